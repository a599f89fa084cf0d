//! Clock and sleep abstraction for polling loops.
//!
//! Watch and bisect loops never call `thread::sleep` directly so tests can run
//! hours of virtual polling instantly.

use std::thread;
use std::time::{Duration, Instant};

pub trait Pacer {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock and real sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPacer;

impl Pacer for SystemPacer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
