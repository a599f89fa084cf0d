//! Polling loop for `kci watch`.
//!
//! Fetches the node set of a tree until [`WatchTracker`] reaches a verdict.
//! Fetch failures and empty answers are transient: they are reported and
//! retried after the short interval, never surfaced as errors.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::types::{Node, WatchVerdict};
use crate::core::watch_tracker::{PollDecision, WatchPhase, WatchTracker};
use crate::io::config::WatchConfig;
use crate::io::maestro::MaestroApi;
use crate::io::pacer::Pacer;

/// Timing of the watch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub empty_retry: Duration,
    pub result_grace: Duration,
    pub delayed_result_timeout: Option<Duration>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatchSettings {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            empty_retry: cfg.empty_retry(),
            result_grace: cfg.result_grace(),
            delayed_result_timeout: cfg.delayed_result_timeout(),
        }
    }
}

/// What to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub treeid: String,
    pub jobs: Vec<String>,
    /// Decisive test; when set the watch ends on its result.
    pub test: Option<String>,
}

/// Progress notifications for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A changed node set was evaluated.
    Polled {
        nodes: usize,
        pending: Vec<String>,
        phase: WatchPhase,
    },
    /// Same node set as the previous poll.
    Unchanged,
    /// No nodes yet, or the fetch failed.
    Retrying { reason: String },
    /// The grace window for the test result just elapsed.
    ResultDelayed { test: String },
}

/// Poll `request.treeid` until the watched jobs (and test) finish.
pub fn watch_tree<A, P, F>(
    api: &A,
    pacer: &P,
    settings: &WatchSettings,
    request: &WatchRequest,
    mut on_event: F,
) -> WatchVerdict
where
    A: MaestroApi + ?Sized,
    P: Pacer + ?Sized,
    F: FnMut(&WatchEvent),
{
    info!(treeid = %request.treeid, jobs = ?request.jobs, test = ?request.test, "watching tree");
    let mut tracker = WatchTracker::new(request.jobs.iter().cloned(), request.test.clone())
        .with_grace(settings.result_grace)
        .with_delayed_timeout(settings.delayed_result_timeout);
    let mut previous: Option<Vec<Node>> = None;
    let mut last_phase = WatchPhase::Running;

    loop {
        let nodes = match api.tree_nodes(&request.treeid) {
            Ok(nodes) if !nodes.is_empty() => nodes,
            Ok(_) => {
                debug!("no nodes yet");
                on_event(&WatchEvent::Retrying {
                    reason: "no nodes yet".to_string(),
                });
                pacer.sleep(settings.empty_retry);
                continue;
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "node fetch failed");
                on_event(&WatchEvent::Retrying {
                    reason: format!("{err:#}"),
                });
                pacer.sleep(settings.empty_retry);
                continue;
            }
        };

        let decision = tracker.observe(&nodes, pacer.now());
        if previous.as_ref() == Some(&nodes) {
            on_event(&WatchEvent::Unchanged);
        } else if let PollDecision::Continue(phase) = &decision {
            on_event(&WatchEvent::Polled {
                nodes: nodes.len(),
                pending: tracker.pending().map(str::to_string).collect(),
                phase: *phase,
            });
        }

        match decision {
            PollDecision::Finished(verdict) => {
                info!(%verdict, "watch finished");
                return verdict;
            }
            PollDecision::Continue(phase) => {
                if phase == WatchPhase::AwaitingDelayedResult
                    && last_phase != WatchPhase::AwaitingDelayedResult
                {
                    let test = request.test.clone().unwrap_or_default();
                    warn!(test = %test, "test result not available after grace period");
                    on_event(&WatchEvent::ResultDelayed { test });
                }
                last_phase = phase;
            }
        }

        previous = Some(nodes);
        pacer.sleep(settings.poll_interval);
    }
}
