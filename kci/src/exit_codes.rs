//! Stable exit codes for kci CLI commands.
//!
//! `checkout --watch` and `watch` report the decisive test through these codes,
//! and `bisect --isolate` reads them back. Generic errors must never reuse a
//! verdict code.

/// Decisive test passed, all watched jobs done, or the command succeeded.
pub const PASSED: i32 = 0;
/// Decisive test failed.
pub const FAILED: i32 = 1;
/// Decisive test skipped or could not run.
pub const SKIPPED: i32 = 2;
/// Infrastructure failure or any other error (config, git, network).
pub const ERROR: i32 = 3;
