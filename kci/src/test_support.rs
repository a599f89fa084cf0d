//! Test-only helpers: node builders, scripted Maestro/driver/tester fakes, a
//! virtual clock, and throwaway git repositories.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::checkout::{CommitTestRequest, CommitTester};
use crate::core::bisect_output::BisectStep;
use crate::core::types::{CommitOutcome, Mark, Node};
use crate::io::git::BisectDriver;
use crate::io::maestro::{CheckoutRequest, MaestroApi, TriggeredRun};
use crate::io::pacer::Pacer;

/// Build a node with a name-derived id.
pub fn node(name: &str, kind: &str, state: &str, result: Option<&str>) -> Node {
    Node {
        id: format!("{name}-id"),
        name: name.to_string(),
        kind: kind.to_string(),
        state: state.to_string(),
        result: result.map(str::to_string),
        parent: None,
        treeid: Some("f00d".to_string()),
    }
}

/// Maestro fake replaying a fixed sequence of poll answers.
///
/// Each trigger returns a new tree id (`tree-1`, `tree-2`, ...); polls are
/// consumed in order regardless of tree id.
pub struct ScriptedMaestro {
    polls: RefCell<VecDeque<Result<Vec<Node>>>>,
    triggered: RefCell<Vec<CheckoutRequest>>,
    trigger_error: Option<String>,
}

impl ScriptedMaestro {
    pub fn with_polls(polls: Vec<Result<Vec<Node>>>) -> Self {
        Self {
            polls: RefCell::new(polls.into()),
            triggered: RefCell::new(Vec::new()),
            trigger_error: None,
        }
    }

    /// Make every trigger fail with `message`.
    pub fn failing_trigger(mut self, message: &str) -> Self {
        self.trigger_error = Some(message.to_string());
        self
    }

    pub fn triggered(&self) -> Vec<CheckoutRequest> {
        self.triggered.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.polls.borrow().len();
        if left > 0 {
            return Err(anyhow!("{left} scripted polls were not consumed"));
        }
        Ok(())
    }
}

impl MaestroApi for ScriptedMaestro {
    fn trigger_checkout(&self, request: &CheckoutRequest) -> Result<TriggeredRun> {
        if let Some(message) = &self.trigger_error {
            return Err(anyhow!("{message}"));
        }
        let mut triggered = self.triggered.borrow_mut();
        triggered.push(request.clone());
        Ok(TriggeredRun {
            treeid: format!("tree-{}", triggered.len()),
            node_id: format!("checkout-{}", triggered.len()),
            message: Some("OK".to_string()),
        })
    }

    fn tree_nodes(&self, _treeid: &str) -> Result<Vec<Node>> {
        self.polls
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("scripted Maestro ran out of polls"))
    }
}

/// Clock that advances only when slept on.
pub struct VirtualPacer {
    start: Instant,
    sleeps: RefCell<Vec<Duration>>,
}

impl VirtualPacer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for VirtualPacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacer for VirtualPacer {
    fn now(&self) -> Instant {
        self.start + self.sleeps.borrow().iter().sum::<Duration>()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Tester replaying scripted outcomes; `Err` entries abort the bisection.
pub struct ScriptedTester {
    script: RefCell<VecDeque<std::result::Result<CommitOutcome, String>>>,
    tested: RefCell<Vec<String>>,
}

impl ScriptedTester {
    pub fn new(script: Vec<std::result::Result<CommitOutcome, String>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            tested: RefCell::new(Vec::new()),
        }
    }

    /// Commits passed to `test_commit`, in call order.
    pub fn tested(&self) -> Vec<String> {
        self.tested.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.script.borrow().len();
        if left > 0 {
            return Err(anyhow!("{left} scripted outcomes were not consumed"));
        }
        Ok(())
    }
}

impl CommitTester for ScriptedTester {
    fn test_commit(&self, request: &CommitTestRequest) -> Result<CommitOutcome> {
        self.tested.borrow_mut().push(request.commit.clone());
        match self.script.borrow_mut().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Err(anyhow!("tester script exhausted at {}", request.commit)),
        }
    }
}

/// Tester deciding from the commit id alone.
pub struct FnTester<F> {
    decide: F,
    calls: Cell<usize>,
}

impl<F: Fn(&str) -> CommitOutcome> FnTester<F> {
    pub fn new(decide: F) -> Self {
        Self {
            decide,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<F: Fn(&str) -> CommitOutcome> CommitTester for FnTester<F> {
    fn test_commit(&self, request: &CommitTestRequest) -> Result<CommitOutcome> {
        self.calls.set(self.calls.get() + 1);
        Ok((self.decide)(&request.commit))
    }
}

/// Bisect driver replaying scripted steps and recording the git commands it
/// would have run.
pub struct ScriptedDriver {
    steps: RefCell<VecDeque<BisectStep>>,
    commands: RefCell<Vec<String>>,
    active: Cell<bool>,
    first_bad: Option<String>,
}

impl ScriptedDriver {
    pub fn new(steps: Vec<BisectStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            commands: RefCell::new(Vec::new()),
            active: Cell::new(false),
            first_bad: None,
        }
    }

    /// Pretend a session is already running in the working copy.
    pub fn active(self) -> Self {
        self.active.set(true);
        self
    }

    pub fn with_first_bad(mut self, commit: &str) -> Self {
        self.first_bad = Some(commit.to_string());
        self
    }

    /// Recorded commands, e.g. `["start", "good aaa111", "bad bbb222"]`.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl BisectDriver for ScriptedDriver {
    fn start_session(&self) -> Result<()> {
        self.commands.borrow_mut().push("start".to_string());
        self.active.set(true);
        Ok(())
    }

    fn mark_boundary(&self, good: &str) -> Result<()> {
        self.commands.borrow_mut().push(format!("good {good}"));
        Ok(())
    }

    fn mark(&self, commit: &str, mark: Mark) -> Result<BisectStep> {
        self.commands.borrow_mut().push(format!("{mark} {commit}"));
        self.steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("driver script exhausted at {mark} {commit}"))
    }

    fn session_active(&self) -> Result<bool> {
        Ok(self.active.get())
    }

    fn first_bad(&self) -> Result<Option<String>> {
        Ok(self.first_bad.clone())
    }
}

/// Throwaway git repository with a linear history on `master`.
pub struct TestRepo {
    dir: TempDir,
    commits: Vec<String>,
}

impl TestRepo {
    /// Create a repository with `count` commits; `commit(0)` is the oldest.
    pub fn with_commits(count: usize) -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        git(dir.path(), &["init", "-q"])?;
        git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/master"])?;
        let mut commits = Vec::with_capacity(count);
        for i in 0..count {
            std::fs::write(dir.path().join("version.txt"), format!("{i}\n"))
                .context("write version.txt")?;
            git(dir.path(), &["add", "version.txt"])?;
            git(dir.path(), &["commit", "-q", "-m", &format!("change {i}")])?;
            let sha = git(dir.path(), &["rev-parse", "HEAD"])?;
            commits.push(sha);
        }
        Ok(Self { dir, commits })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn commit(&self, index: usize) -> &str {
        &self.commits[index]
    }

    /// Position of `sha` in the history (full or abbreviated).
    pub fn index_of(&self, sha: &str) -> usize {
        self.commits
            .iter()
            .position(|c| c.starts_with(sha))
            .unwrap_or_else(|| panic!("unknown commit {sha}"))
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=kci test",
            "-c",
            "user.email=kci@example.invalid",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
