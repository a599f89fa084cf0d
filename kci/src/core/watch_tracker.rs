//! Pure evaluation of job-graph polls.
//!
//! The tracker owns the working set of job names still being waited on and the
//! decisive test result observed so far. Each poll is fed to [`WatchTracker::observe`],
//! which either finishes the watch or reports which phase it is waiting in.
//! Time is passed in so the grace window is deterministic under test.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::core::node_status::node_status;
use crate::core::types::{Node, NodeStatus, WatchVerdict};

/// Name of the checkout node, always watched.
pub const CHECKOUT_JOB: &str = "checkout";

/// Why a watch keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    /// Watched jobs are still pending or some node is running.
    Running,
    /// Jobs finished; waiting inside the grace window for the test result.
    AwaitingResult,
    /// Grace window elapsed without a test result; still polling.
    AwaitingDelayedResult,
}

/// Outcome of evaluating one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    Continue(WatchPhase),
    Finished(WatchVerdict),
}

#[derive(Debug, Clone)]
pub struct WatchTracker {
    pending: BTreeSet<String>,
    test: Option<String>,
    test_result: Option<String>,
    jobs_done_at: Option<Instant>,
    grace: Duration,
    delayed_timeout: Option<Duration>,
}

impl WatchTracker {
    /// Track `jobs` (plus the checkout node) and optionally a decisive `test`.
    pub fn new<I, S>(jobs: I, test: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending: BTreeSet<String> = jobs.into_iter().map(Into::into).collect();
        pending.insert(CHECKOUT_JOB.to_string());
        Self {
            pending,
            test,
            test_result: None,
            jobs_done_at: None,
            grace: Duration::from_secs(60),
            delayed_timeout: None,
        }
    }

    /// How long to wait for the test result once all jobs are done.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Give up on the test result this long after the grace window ends.
    pub fn with_delayed_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delayed_timeout = timeout;
        self
    }

    /// Job names not yet seen in a terminal state.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn test_result(&self) -> Option<&str> {
        self.test_result.as_deref()
    }

    /// Evaluate one full node set.
    pub fn observe(&mut self, nodes: &[Node], now: Instant) -> PollDecision {
        let mut running = false;
        for node in nodes {
            let status = node_status(node);
            if status == NodeStatus::Running {
                running = true;
            }
            let is_test = self.test.as_deref() == Some(node.name.as_str());
            if is_test && let Some(result) = &node.result {
                self.test_result = Some(result.clone());
            }
            if !self.pending.contains(&node.name) {
                continue;
            }
            match status {
                NodeStatus::Running => {}
                NodeStatus::Done => {
                    self.pending.remove(&node.name);
                }
                NodeStatus::Fail if is_test => {
                    self.pending.remove(&node.name);
                    if self.test_result.is_none() {
                        self.test_result = Some("fail".to_string());
                    }
                }
                NodeStatus::Fail => {
                    return PollDecision::Finished(WatchVerdict::JobFailed {
                        name: node.name.clone(),
                        result: node.result.clone(),
                    });
                }
            }
        }

        if !self.pending.is_empty() || running {
            return PollDecision::Continue(WatchPhase::Running);
        }
        if self.test.is_none() {
            return PollDecision::Finished(WatchVerdict::JobsDone);
        }

        let done_at = *self.jobs_done_at.get_or_insert(now);
        match self.test_result.as_deref() {
            Some("pass") => PollDecision::Finished(WatchVerdict::TestPassed),
            Some(result @ ("skip" | "incomplete")) => {
                PollDecision::Finished(WatchVerdict::TestSkipped {
                    result: result.to_string(),
                })
            }
            Some(result) => PollDecision::Finished(WatchVerdict::TestFailed {
                result: result.to_string(),
            }),
            None => {
                let waited = now.saturating_duration_since(done_at);
                if waited <= self.grace {
                    return PollDecision::Continue(WatchPhase::AwaitingResult);
                }
                match self.delayed_timeout {
                    Some(limit) if waited > self.grace + limit => {
                        PollDecision::Finished(WatchVerdict::ResultTimedOut)
                    }
                    _ => PollDecision::Continue(WatchPhase::AwaitingDelayedResult),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::node;

    fn checkout_done() -> Node {
        node("checkout", "checkout", "available", None)
    }

    #[test]
    fn finishes_when_jobs_done_without_test() {
        let mut tracker = WatchTracker::new(["baseline"], None);
        let nodes = vec![
            checkout_done(),
            node("baseline", "job", "done", Some("pass")),
        ];
        assert_eq!(
            tracker.observe(&nodes, Instant::now()),
            PollDecision::Finished(WatchVerdict::JobsDone)
        );
    }

    #[test]
    fn keeps_running_while_any_node_runs() {
        let mut tracker = WatchTracker::new(["baseline"], None);
        let nodes = vec![
            checkout_done(),
            node("baseline", "job", "done", Some("pass")),
            node("baseline.login", "test", "running", None),
        ];
        assert_eq!(
            tracker.observe(&nodes, Instant::now()),
            PollDecision::Continue(WatchPhase::Running)
        );
        assert_eq!(tracker.pending().count(), 0);
    }

    #[test]
    fn checkout_is_watched_implicitly() {
        let mut tracker = WatchTracker::new(Vec::<String>::new(), None);
        let decision = tracker.observe(
            &[node("checkout", "checkout", "running", None)],
            Instant::now(),
        );
        assert_eq!(decision, PollDecision::Continue(WatchPhase::Running));
        assert_eq!(tracker.pending().collect::<Vec<_>>(), vec!["checkout"]);
    }

    #[test]
    fn missing_job_keeps_watch_pending() {
        let mut tracker = WatchTracker::new(["kbuild-gcc-12-x86"], None);
        let decision = tracker.observe(&[checkout_done()], Instant::now());
        assert_eq!(decision, PollDecision::Continue(WatchPhase::Running));
    }

    #[test]
    fn failed_job_ends_watch() {
        let mut tracker = WatchTracker::new(["kbuild"], Some("baseline.login".to_string()));
        let nodes = vec![checkout_done(), node("kbuild", "kbuild", "done", Some("fail"))];
        assert_eq!(
            tracker.observe(&nodes, Instant::now()),
            PollDecision::Finished(WatchVerdict::JobFailed {
                name: "kbuild".to_string(),
                result: Some("fail".to_string()),
            })
        );
    }

    #[test]
    fn failed_test_job_is_test_outcome() {
        let mut tracker = WatchTracker::new(["baseline"], Some("baseline".to_string()));
        let nodes = vec![checkout_done(), node("baseline", "job", "done", Some("fail"))];
        assert_eq!(
            tracker.observe(&nodes, Instant::now()),
            PollDecision::Finished(WatchVerdict::TestFailed {
                result: "fail".to_string()
            })
        );
    }

    #[test]
    fn test_result_decides_verdict() {
        let cases = [
            ("pass", WatchVerdict::TestPassed),
            (
                "fail",
                WatchVerdict::TestFailed {
                    result: "fail".to_string(),
                },
            ),
            (
                "skip",
                WatchVerdict::TestSkipped {
                    result: "skip".to_string(),
                },
            ),
            (
                "incomplete",
                WatchVerdict::TestSkipped {
                    result: "incomplete".to_string(),
                },
            ),
        ];
        for (result, expected) in cases {
            let mut tracker = WatchTracker::new(["baseline"], Some("baseline.login".to_string()));
            let nodes = vec![
                checkout_done(),
                node("baseline", "job", "done", Some("pass")),
                node("baseline.login", "test", "done", Some(result)),
            ];
            assert_eq!(
                tracker.observe(&nodes, Instant::now()),
                PollDecision::Finished(expected)
            );
        }
    }

    #[test]
    fn test_result_seen_early_is_kept_until_jobs_finish() {
        let mut tracker = WatchTracker::new(["baseline"], Some("baseline.login".to_string()));
        let start = Instant::now();
        let first = vec![
            checkout_done(),
            node("baseline", "job", "running", None),
            node("baseline.login", "test", "done", Some("pass")),
        ];
        assert_eq!(
            tracker.observe(&first, start),
            PollDecision::Continue(WatchPhase::Running)
        );
        assert_eq!(tracker.test_result(), Some("pass"));

        let second = vec![checkout_done(), node("baseline", "job", "done", Some("pass"))];
        assert_eq!(
            tracker.observe(&second, start + Duration::from_secs(30)),
            PollDecision::Finished(WatchVerdict::TestPassed)
        );
    }

    #[test]
    fn missing_result_moves_from_grace_to_delayed_phase() {
        let mut tracker = WatchTracker::new(["baseline"], Some("baseline.login".to_string()));
        let nodes = vec![checkout_done(), node("baseline", "job", "done", Some("pass"))];
        let start = Instant::now();
        assert_eq!(
            tracker.observe(&nodes, start),
            PollDecision::Continue(WatchPhase::AwaitingResult)
        );
        assert_eq!(
            tracker.observe(&nodes, start + Duration::from_secs(60)),
            PollDecision::Continue(WatchPhase::AwaitingResult)
        );
        assert_eq!(
            tracker.observe(&nodes, start + Duration::from_secs(90)),
            PollDecision::Continue(WatchPhase::AwaitingDelayedResult)
        );
        assert_eq!(
            tracker.observe(&nodes, start + Duration::from_secs(3600)),
            PollDecision::Continue(WatchPhase::AwaitingDelayedResult)
        );
    }

    #[test]
    fn delayed_timeout_ends_watch_when_configured() {
        let mut tracker = WatchTracker::new(["baseline"], Some("baseline.login".to_string()))
            .with_delayed_timeout(Some(Duration::from_secs(120)));
        let nodes = vec![checkout_done(), node("baseline", "job", "done", Some("pass"))];
        let start = Instant::now();
        tracker.observe(&nodes, start);
        assert_eq!(
            tracker.observe(&nodes, start + Duration::from_secs(150)),
            PollDecision::Continue(WatchPhase::AwaitingDelayedResult)
        );
        assert_eq!(
            tracker.observe(&nodes, start + Duration::from_secs(200)),
            PollDecision::Finished(WatchVerdict::ResultTimedOut)
        );
    }
}
