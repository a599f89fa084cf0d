//! Shared deterministic types for bisection and watch logic.
//!
//! These types define stable contracts between core components and the
//! persisted state file. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Verdict recorded for a tested commit and fed to `git bisect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Good,
    Bad,
    Skip,
}

impl Mark {
    /// The `git bisect` subcommand for this mark.
    pub fn as_str(self) -> &'static str {
        match self {
            Mark::Good => "good",
            Mark::Bad => "bad",
            Mark::Skip => "skip",
        }
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of testing one commit remotely.
///
/// `InfraError` is not a verdict: the commit must be tested again and
/// nothing is recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Mark(Mark),
    InfraError(String),
}

impl CommitOutcome {
    /// Map the exit code of `kci checkout --watch` to an outcome.
    ///
    /// `None` means the child was killed by a signal.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(exit_codes::PASSED) => CommitOutcome::Mark(Mark::Good),
            Some(exit_codes::FAILED) => CommitOutcome::Mark(Mark::Bad),
            Some(exit_codes::SKIPPED) => CommitOutcome::Mark(Mark::Skip),
            Some(other) => CommitOutcome::InfraError(format!("checkout exited with code {other}")),
            None => CommitOutcome::InfraError("checkout terminated by signal".to_string()),
        }
    }

    pub fn mark(&self) -> Option<Mark> {
        match self {
            CommitOutcome::Mark(mark) => Some(*mark),
            CommitOutcome::InfraError(_) => None,
        }
    }
}

/// Status derived from a node's `(kind, state, result)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Done,
    Fail,
}

/// One node of a Maestro job graph, as returned by `nodes/fast`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    pub state: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub treeid: Option<String>,
}

/// Terminal classification of a finished watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchVerdict {
    /// All watched jobs finished and no decisive test was requested.
    JobsDone,
    TestPassed,
    TestFailed { result: String },
    /// The decisive test reported `skip` or `incomplete`.
    TestSkipped { result: String },
    /// A watched job other than the decisive test failed.
    JobFailed { name: String, result: Option<String> },
    /// The decisive test never reported within the configured timeout.
    ResultTimedOut,
}

impl WatchVerdict {
    /// Exit code used by `kci watch` and `kci checkout --watch`.
    pub fn exit_code(&self) -> i32 {
        match self {
            WatchVerdict::JobsDone | WatchVerdict::TestPassed => exit_codes::PASSED,
            WatchVerdict::TestFailed { .. } => exit_codes::FAILED,
            // A failed watched job (build error, boot hang reported as incomplete) means the
            // decisive test never ran on this commit.
            WatchVerdict::TestSkipped { .. } | WatchVerdict::JobFailed { .. } => {
                exit_codes::SKIPPED
            }
            WatchVerdict::ResultTimedOut => exit_codes::ERROR,
        }
    }

    /// Outcome of a bisection step driven by this verdict.
    pub fn commit_outcome(&self) -> CommitOutcome {
        match self.exit_code() {
            exit_codes::ERROR => CommitOutcome::InfraError(self.to_string()),
            code => CommitOutcome::from_exit_code(Some(code)),
        }
    }
}

impl std::fmt::Display for WatchVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchVerdict::JobsDone => f.write_str("all jobs done"),
            WatchVerdict::TestPassed => f.write_str("test passed"),
            WatchVerdict::TestFailed { result } => write!(f, "test failed ({result})"),
            WatchVerdict::TestSkipped { result } => write!(f, "test skipped ({result})"),
            WatchVerdict::JobFailed { name, result } => write!(
                f,
                "job {name} failed ({})",
                result.as_deref().unwrap_or("no result")
            ),
            WatchVerdict::ResultTimedOut => f.write_str("test result never arrived"),
        }
    }
}
