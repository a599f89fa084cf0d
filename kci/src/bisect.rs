//! Bisection control loop for `kci bisect`.
//!
//! A bisection is resumable: the state file records every verdict and the
//! next commit to test, and is rewritten after each step before the next
//! checkout is triggered. Killing the process at any point loses at most the
//! remote run in flight.
//!
//! Step order is: test commit, mark it in git (explicit commit id), record
//! history, persist. Marking with an explicit id makes a repeated mark after a
//! crash between "mark" and "persist" harmless. The state file is only read
//! and written while holding its [`StateLock`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::checkout::{CommitTestRequest, CommitTester};
use crate::core::bisect_output::BisectStep;
use crate::core::types::{CommitOutcome, Mark};
use crate::io::bisect_state::{
    BisectParams, BisectState, StateLock, load_bisect_state, write_bisect_state,
};
use crate::io::git::{BisectDriver, Git};
use crate::io::pacer::Pacer;

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct BisectOptions {
    /// Pause before re-testing a commit after an infrastructure failure.
    pub infra_retry_delay: Duration,
    /// Re-tests of one commit after consecutive infrastructure failures
    /// before the bisection stops.
    pub max_infra_retries: u32,
}

impl Default for BisectOptions {
    fn default() -> Self {
        Self {
            infra_retry_delay: Duration::from_secs(60),
            max_infra_retries: 5,
        }
    }
}

/// Progress notifications for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectEvent {
    /// A new session was started in the working copy.
    Started {
        good: String,
        bad: String,
        retry_count: u32,
    },
    /// Continuing from a saved state.
    Resumed { tested: usize, next: Option<String> },
    /// The saved state outlived the git session, which was rebuilt from history.
    Replayed { marks: usize },
    Testing { commit: String, remaining: Option<u32> },
    Tested { commit: String, mark: Mark },
    InfraRetry { commit: String, reason: String },
}

/// Result of a finished bisection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectReport {
    pub first_bad: String,
    /// Commits tested by this invocation.
    pub tested_now: usize,
    /// Commits tested over the whole bisection.
    pub tested_total: usize,
}

/// Pick the state to run with: the saved one unless discarded, otherwise a
/// fresh state from `params`.
///
/// `params` is only consulted when no usable saved state exists, so a resumed
/// bisection needs no arguments. Boundaries passed alongside a saved state
/// that disagree with it are ignored with a warning.
pub fn resolve_state<F>(
    lock: &StateLock,
    ignore_saved: bool,
    overrides: Option<(&str, &str)>,
    params: F,
) -> Result<BisectState>
where
    F: FnOnce() -> Result<BisectParams>,
{
    let state_path = lock.state_path();
    let saved = if ignore_saved {
        info!(path = %state_path.display(), "ignoring saved bisect state");
        None
    } else {
        load_bisect_state(state_path)
    };
    match saved {
        Some(state) => {
            if let Some((good, bad)) = overrides
                && (good != state.good_commit || bad != state.bad_commit)
            {
                warn!(
                    saved_good = %state.good_commit,
                    saved_bad = %state.bad_commit,
                    "saved bisection uses different boundaries; keeping saved ones"
                );
            }
            Ok(state)
        }
        None => {
            let params = params().context("no saved bisection to resume")?;
            Ok(BisectState::new(params))
        }
    }
}

/// Open the bisection working copy, cloning the tree if it does not exist.
pub fn ensure_workdir(state: &BisectState) -> Result<Git> {
    if state.workdir.exists() {
        return Ok(Git::new(&state.workdir));
    }
    Git::clone_branch(&state.tree_url, &state.branch, &state.workdir)
        .with_context(|| format!("clone {} into {}", state.tree_url, state.workdir.display()))
}

/// Drive the bisection to the first bad commit.
///
/// An initialized `state` must match the saved file; a copy read before
/// another run advanced the bisection is rejected. A fresh state starts over.
/// On error the state file reflects the last completed step.
pub fn run_bisect<D, T, P, F>(
    lock: &StateLock,
    mut state: BisectState,
    driver: &D,
    tester: &T,
    pacer: &P,
    options: &BisectOptions,
    mut on_event: F,
) -> Result<BisectReport>
where
    D: BisectDriver + ?Sized,
    T: CommitTester + ?Sized,
    P: Pacer + ?Sized,
    F: FnMut(&BisectEvent),
{
    let state_path = lock.state_path();
    ensure_current(state_path, &state)?;
    let tested_before = state.history.len();
    let mut remaining = None;

    if !state.initialized {
        on_event(&BisectEvent::Started {
            good: state.good_commit.clone(),
            bad: state.bad_commit.clone(),
            retry_count: state.retry_count,
        });
        let step = start_session(driver, &state)?;
        state.initialized = true;
        remaining = step.remaining();
        if let Some(first_bad) = apply_step(&mut state, step)? {
            write_bisect_state(state_path, &state)?;
            return Ok(report(&state, first_bad, tested_before));
        }
        write_bisect_state(state_path, &state)?;
    } else {
        on_event(&BisectEvent::Resumed {
            tested: state.history.len(),
            next: state.next_candidate.clone(),
        });
        if state.is_finished() {
            let first_bad = if driver.session_active()? {
                driver.first_bad()?
            } else {
                warn!("git bisect session missing, replaying finished bisection");
                let step = replay_session(driver, &state)?;
                on_event(&BisectEvent::Replayed {
                    marks: state.history.len(),
                });
                match step {
                    BisectStep::Resolved { commit } => Some(commit),
                    _ => None,
                }
            };
            let first_bad = first_bad.ok_or_else(|| {
                anyhow!(
                    "bisection already finished but git has no first bad commit \
                     (use --ignore-state to start over)"
                )
            })?;
            return Ok(report(&state, first_bad, tested_before));
        }
        if !driver.session_active()? {
            warn!("git bisect session missing, replaying saved history");
            let step = replay_session(driver, &state)?;
            remaining = step.remaining();
            on_event(&BisectEvent::Replayed {
                marks: state.history.len(),
            });
            if let Some(first_bad) = adopt_replayed(&mut state, step)? {
                write_bisect_state(state_path, &state)?;
                return Ok(report(&state, first_bad, tested_before));
            }
            write_bisect_state(state_path, &state)?;
        }
    }

    let mut infra_failures = 0u32;
    loop {
        let commit = state
            .next_candidate
            .clone()
            .ok_or_else(|| anyhow!("initialized bisection has no next candidate"))?;

        // Set when a previous run recorded this commit but git could not move on.
        let recorded = state
            .history
            .last()
            .filter(|entry| entry.commit == commit)
            .map(|entry| entry.mark);

        let mark = match recorded {
            Some(mark) => {
                info!(commit = %commit, %mark, "commit already tested, reapplying saved verdict");
                mark
            }
            None => {
                on_event(&BisectEvent::Testing {
                    commit: commit.clone(),
                    remaining,
                });
                match tester.test_commit(&test_request(&state, &commit))? {
                    CommitOutcome::Mark(mark) => mark,
                    CommitOutcome::InfraError(reason) => {
                        infra_failures += 1;
                        if infra_failures > options.max_infra_retries {
                            bail!(
                                "{commit}: {infra_failures} infrastructure failures in a row, \
                                 giving up (last: {reason})"
                            );
                        }
                        warn!(commit = %commit, reason = %reason, "infrastructure failure, retrying");
                        on_event(&BisectEvent::InfraRetry {
                            commit: commit.clone(),
                            reason,
                        });
                        pacer.sleep(options.infra_retry_delay);
                        continue;
                    }
                }
            }
        };
        infra_failures = 0;

        let step = driver.mark(&commit, mark)?;
        if recorded.is_none() {
            state.record(&commit, mark);
        }
        remaining = step.remaining();
        // Persist the verdict even when git cannot continue from it.
        let resolved = apply_step(&mut state, step);
        write_bisect_state(state_path, &state)?;
        let resolved = resolved?;
        debug!(commit = %commit, %mark, history = state.history.len(), "step persisted");
        on_event(&BisectEvent::Tested {
            commit: commit.clone(),
            mark,
        });

        if let Some(first_bad) = resolved {
            info!(first_bad = %first_bad, "bisection finished");
            return Ok(report(&state, first_bad, tested_before));
        }
    }
}

fn ensure_current(state_path: &Path, state: &BisectState) -> Result<()> {
    if !state.initialized {
        return Ok(());
    }
    if let Some(saved) = load_bisect_state(state_path)
        && saved != *state
    {
        bail!(
            "bisect state {} changed since it was loaded (now {} tested commits); \
             rerun to continue from the saved state",
            state_path.display(),
            saved.history.len()
        );
    }
    Ok(())
}

fn start_session<D: BisectDriver + ?Sized>(driver: &D, state: &BisectState) -> Result<BisectStep> {
    driver.start_session()?;
    driver.mark_boundary(&state.good_commit)?;
    driver.mark(&state.bad_commit, Mark::Bad)
}

/// Rebuild the git session from the boundaries and recorded marks.
fn replay_session<D: BisectDriver + ?Sized>(driver: &D, state: &BisectState) -> Result<BisectStep> {
    let mut step = start_session(driver, state)?;
    for entry in &state.history {
        step = driver.mark(&entry.commit, entry.mark)?;
    }
    Ok(step)
}

fn adopt_replayed(state: &mut BisectState, step: BisectStep) -> Result<Option<String>> {
    if let BisectStep::Next { commit, .. } = &step
        && state.next_candidate.as_deref() != Some(commit.as_str())
    {
        warn!(
            saved = ?state.next_candidate,
            replayed = %commit,
            "replayed session picked a different candidate"
        );
    }
    apply_step(state, step)
}

/// Store the driver's answer; returns the first bad commit once resolved.
///
/// `OnlySkipped` leaves `next_candidate` untouched.
fn apply_step(state: &mut BisectState, step: BisectStep) -> Result<Option<String>> {
    match step {
        BisectStep::Next { commit, .. } => {
            state.next_candidate = Some(commit);
            Ok(None)
        }
        BisectStep::Resolved { commit } => {
            state.next_candidate = None;
            Ok(Some(commit))
        }
        BisectStep::OnlySkipped { candidates } => bail!(
            "only skipped commits left to test; the first bad commit is one of:\n{}",
            candidates.join("\n")
        ),
    }
}

fn test_request(state: &BisectState, commit: &str) -> CommitTestRequest {
    CommitTestRequest {
        tree_url: state.tree_url.clone(),
        branch: state.branch.clone(),
        commit: commit.to_string(),
        job_filter: state.job_filter.clone(),
        platform_filter: state.platform_filter.clone(),
        test_name: Some(state.test_name.clone()),
    }
}

fn report(state: &BisectState, first_bad: String, tested_before: usize) -> BisectReport {
    BisectReport {
        first_bad,
        tested_now: state.history.len() - tested_before,
        tested_total: state.history.len(),
    }
}
