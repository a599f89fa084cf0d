//! I/O helpers for kci commands.

pub mod bisect_state;
pub mod config;
pub mod git;
pub mod maestro;
pub mod pacer;
pub mod process;
