//! Deterministic, pure logic shared by the kci commands.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod bisect_output;
pub mod node_status;
pub mod types;
pub mod watch_tracker;
