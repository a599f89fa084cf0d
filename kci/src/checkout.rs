//! Trigger a Maestro checkout for one commit and turn its result into a
//! bisection outcome.
//!
//! [`CommitTester`] is the seam between the bisection loop and Maestro. Two
//! implementations exist: [`MaestroTester`] triggers and watches in-process,
//! [`SubprocessTester`] re-invokes `kci checkout --watch` and reads its exit
//! code, which keeps a crash in the watch path from taking the loop down.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::types::{CommitOutcome, WatchVerdict};
use crate::io::maestro::{CheckoutRequest, MaestroApi, TriggeredRun};
use crate::io::pacer::Pacer;
use crate::io::process::run_command;
use crate::watch::{WatchEvent, WatchRequest, WatchSettings, watch_tree};

/// Everything needed to test one commit remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTestRequest {
    pub tree_url: String,
    pub branch: String,
    pub commit: String,
    pub job_filter: Vec<String>,
    pub platform_filter: Vec<String>,
    pub test_name: Option<String>,
}

impl CommitTestRequest {
    pub fn checkout_request(&self) -> CheckoutRequest {
        CheckoutRequest {
            url: self.tree_url.clone(),
            branch: self.branch.clone(),
            commit: self.commit.clone(),
            job_filter: self.job_filter.clone(),
            platform_filter: self.platform_filter.clone(),
        }
    }
}

/// Decides whether a commit is good, bad or untestable.
///
/// `Err` is reserved for failures that must stop the bisection; anything the
/// remote side can recover from is `CommitOutcome::InfraError`.
pub trait CommitTester {
    fn test_commit(&self, request: &CommitTestRequest) -> Result<CommitOutcome>;
}

/// Trigger a checkout and block until its jobs (and test) finish.
pub fn trigger_and_watch<A, P, F>(
    api: &A,
    pacer: &P,
    settings: &WatchSettings,
    request: &CommitTestRequest,
    on_event: F,
) -> Result<(TriggeredRun, WatchVerdict)>
where
    A: MaestroApi + ?Sized,
    P: Pacer + ?Sized,
    F: FnMut(&WatchEvent),
{
    let run = api.trigger_checkout(&request.checkout_request())?;
    let verdict = watch_tree(
        api,
        pacer,
        settings,
        &WatchRequest {
            treeid: run.treeid.clone(),
            jobs: request.job_filter.clone(),
            test: request.test_name.clone(),
        },
        on_event,
    );
    Ok((run, verdict))
}

/// In-process tester backed by a [`MaestroApi`].
pub struct MaestroTester<A, P> {
    api: A,
    pacer: P,
    settings: WatchSettings,
    report: fn(&WatchEvent),
}

impl<A: MaestroApi, P: Pacer> MaestroTester<A, P> {
    pub fn new(api: A, pacer: P, settings: WatchSettings, report: fn(&WatchEvent)) -> Self {
        Self {
            api,
            pacer,
            settings,
            report,
        }
    }
}

impl<A: MaestroApi, P: Pacer> CommitTester for MaestroTester<A, P> {
    #[instrument(skip_all, fields(commit = %request.commit))]
    fn test_commit(&self, request: &CommitTestRequest) -> Result<CommitOutcome> {
        match trigger_and_watch(&self.api, &self.pacer, &self.settings, request, self.report) {
            Ok((run, verdict)) => {
                info!(treeid = %run.treeid, %verdict, "commit tested");
                Ok(verdict.commit_outcome())
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "checkout trigger failed");
                Ok(CommitOutcome::InfraError(format!("{err:#}")))
            }
        }
    }
}

/// Tester that runs `kci checkout --watch` as a child process.
#[derive(Debug, Clone)]
pub struct SubprocessTester {
    /// Path of the kci binary.
    pub program: PathBuf,
    /// Global arguments placed before the subcommand (`--settings`, `--instance`).
    pub global_args: Vec<String>,
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl SubprocessTester {
    /// Command line for testing `request`.
    pub fn command(&self, request: &CommitTestRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args)
            .arg("checkout")
            .args(["--giturl", &request.tree_url])
            .args(["--branch", &request.branch])
            .args(["--commit", &request.commit]);
        for job in &request.job_filter {
            cmd.args(["--job-filter", job]);
        }
        for platform in &request.platform_filter {
            cmd.args(["--platform-filter", platform]);
        }
        cmd.arg("--watch");
        if let Some(test) = &request.test_name {
            cmd.args(["--test", test]);
        }
        cmd
    }
}

impl CommitTester for SubprocessTester {
    #[instrument(skip_all, fields(commit = %request.commit))]
    fn test_commit(&self, request: &CommitTestRequest) -> Result<CommitOutcome> {
        // The child's progress goes straight to the operator's terminal.
        let output = run_command(
            self.command(request),
            self.timeout,
            self.output_limit_bytes,
            true,
        )?;
        if output.timed_out {
            return Ok(CommitOutcome::InfraError(
                "checkout subprocess timed out".to_string(),
            ));
        }
        Ok(CommitOutcome::from_exit_code(output.code()))
    }
}
