//! Parser for `git bisect` human-readable output.
//!
//! `git bisect` has no machine-readable mode, so every mark is answered with
//! free text. The formats recognized here are those printed by git 2.x:
//!
//! ```text
//! Bisecting: 3 revisions left to test after this (roughly 2 steps)
//! [0a1b2c3d...] subject line
//! ```
//!
//! ```text
//! 0a1b2c3d... is the first bad commit
//! ```
//!
//! ```text
//! There are only 'skip'ped commits left to test.
//! The first bad commit could be any of:
//! 0a1b2c3d...
//! ```

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

static RESOLVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([0-9a-f]{4,64}) is the first bad commit").expect("valid regex")
});
static NEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([0-9a-f]{4,64})\]").expect("valid regex"));
static REMAINING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bisecting: (\d+) revisions? left to test").expect("valid regex")
});
static HEX_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{4,64}$").expect("valid regex"));

const ONLY_SKIPPED_MARKER: &str = "only 'skip'ped commits left to test";

/// What `git bisect` asked for next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectStep {
    /// Test `commit` next. `remaining` is git's count of revisions left after it.
    Next {
        commit: String,
        remaining: Option<u32>,
    },
    /// The search interval collapsed to `commit`.
    Resolved { commit: String },
    /// Only skipped commits remain; the first bad commit is one of `candidates`.
    OnlySkipped { candidates: Vec<String> },
}

impl BisectStep {
    pub fn remaining(&self) -> Option<u32> {
        match self {
            BisectStep::Next { remaining, .. } => *remaining,
            _ => None,
        }
    }
}

/// Parse the combined output of a `git bisect good|bad|skip` invocation.
///
/// Output matching none of the known shapes is a protocol violation and
/// returned as an error.
pub fn parse_bisect_output(output: &str) -> Result<BisectStep> {
    if let Some(caps) = RESOLVED_RE.captures(output) {
        return Ok(BisectStep::Resolved {
            commit: caps[1].to_string(),
        });
    }
    if output.contains(ONLY_SKIPPED_MARKER) {
        let candidates = output
            .lines()
            .map(str::trim)
            .filter(|line| HEX_LINE_RE.is_match(line))
            .map(str::to_string)
            .collect();
        return Ok(BisectStep::OnlySkipped { candidates });
    }
    if let Some(caps) = NEXT_RE.captures(output) {
        let remaining = REMAINING_RE
            .captures(output)
            .and_then(|c| c[1].parse::<u32>().ok());
        return Ok(BisectStep::Next {
            commit: caps[1].to_string(),
            remaining,
        });
    }
    Err(anyhow!(
        "unrecognized git bisect output:\n{}",
        output.trim_end()
    ))
}
