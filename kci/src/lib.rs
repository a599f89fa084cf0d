//! Client for triggering, watching and bisecting KernelCI Maestro runs.
//!
//! The crate keeps the same split throughout:
//!
//! - **[`core`]**: Pure logic (git bisect output parsing, node classification,
//!   the watch state machine). No I/O, tested in isolation.
//! - **[`io`]**: Side effects (git, Maestro HTTP, state file, config, clock,
//!   child processes), each behind a trait or a narrow function so loops can
//!   be driven by fakes.
//!
//! Orchestration modules ([`watch`], [`checkout`], [`bisect`]) combine the two
//! to implement CLI commands.

pub mod bisect;
pub mod checkout;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watch;
