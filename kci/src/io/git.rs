//! Git adapter for bisection.
//!
//! Every operation runs `git` with an explicit working directory; the process
//! working directory is never changed. `git bisect` answers are parsed by
//! [`parse_bisect_output`] so this module only deals with spawning and exit
//! status.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::bisect_output::{BisectStep, parse_bisect_output};
use crate::core::types::Mark;

/// Local bisection primitives the control loop depends on.
pub trait BisectDriver {
    /// Begin a new bisection session (resets any previous one).
    fn start_session(&self) -> Result<()>;
    /// Mark the known-good boundary. Produces no candidate on its own.
    fn mark_boundary(&self, good: &str) -> Result<()>;
    /// Mark `commit` and return what git wants tested next.
    fn mark(&self, commit: &str, mark: Mark) -> Result<BisectStep>;
    /// Whether a bisection session is in progress.
    fn session_active(&self) -> Result<bool>;
    /// The first bad commit once the session has resolved.
    fn first_bad(&self) -> Result<Option<String>>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` at `branch` into `dest`.
    #[instrument(skip_all, fields(url = %url, branch = %branch))]
    pub fn clone_branch(url: &str, branch: &str, dest: &Path) -> Result<Self> {
        info!(url, branch, dest = %dest.display(), "cloning tree");
        let output = Command::new("git")
            .args(["clone", "--branch", branch, url])
            .arg(dest)
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git clone {url} failed: {}", stderr.trim()));
        }
        Ok(Self::new(dest))
    }

    /// Resolve the tip of `branch` on the remote `url` without a local clone.
    #[instrument(skip_all, fields(url = %url, branch = %branch))]
    pub fn ls_remote_head(url: &str, branch: &str) -> Result<String> {
        let refname = format!("refs/heads/{branch}");
        let output = Command::new("git")
            .args(["ls-remote", url, &refname])
            .output()
            .context("spawn git ls-remote")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git ls-remote {url} failed: {}", stderr.trim()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let sha = stdout
            .lines()
            .find_map(|line| {
                let (sha, name) = line.split_once('\t')?;
                (name.trim() == refname).then(|| sha.trim().to_string())
            })
            .ok_or_else(|| anyhow!("branch {branch} not found on {url}"))?;
        debug!(sha = %sha, "resolved tip of tree");
        Ok(sha)
    }

    /// True if the working directory is inside a git working copy.
    pub fn is_repository(&self) -> bool {
        self.workdir.is_dir()
            && self
                .run(&["rev-parse", "--is-inside-work-tree"])
                .map(|out| out.status.success())
                .unwrap_or(false)
    }

    /// Resolve any revision expression to a full SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", rev])?;
        Ok(out.trim().to_string())
    }

    fn run_bisect(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        // git writes bisect progress to stdout, but older versions put some of it on stderr.
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed ({}): {}",
                args.join(" "),
                output.status,
                format!("{}\n{}", stdout.trim(), stderr.trim()).trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl BisectDriver for Git {
    #[instrument(skip_all)]
    fn start_session(&self) -> Result<()> {
        if !self.is_repository() {
            return Err(anyhow!(
                "{} is not a git working copy",
                self.workdir.display()
            ));
        }
        debug!(workdir = %self.workdir.display(), "starting bisect session");
        self.run_bisect(&["bisect", "start"])?;
        Ok(())
    }

    #[instrument(skip_all, fields(good = %good))]
    fn mark_boundary(&self, good: &str) -> Result<()> {
        self.run_bisect(&["bisect", "good", good])?;
        Ok(())
    }

    #[instrument(skip_all, fields(commit = %commit, mark = %mark))]
    fn mark(&self, commit: &str, mark: Mark) -> Result<BisectStep> {
        let text = self.run_bisect(&["bisect", mark.as_str(), commit])?;
        let step = parse_bisect_output(&text)
            .with_context(|| format!("git bisect {mark} {commit}"))?;
        debug!(?step, "bisect step");
        Ok(step)
    }

    fn session_active(&self) -> Result<bool> {
        let output = self.run(&["bisect", "log"])?;
        Ok(output.status.success())
    }

    fn first_bad(&self) -> Result<Option<String>> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", "refs/bisect/bad"])?;
        if !output.status.success() {
            warn!("refs/bisect/bad not found");
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn start_session_requires_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Git::new(temp.path())
            .start_session()
            .expect_err("not a repo");
        assert!(err.to_string().contains("not a git working copy"));
    }

    #[test]
    fn bisect_narrows_to_first_bad_commit() {
        let repo = TestRepo::with_commits(8).expect("repo");
        let git = Git::new(repo.path());
        let first_bad = repo.commit(5).to_string();

        git.start_session().expect("start");
        assert!(git.session_active().expect("active"));
        git.mark_boundary(repo.commit(0)).expect("good");
        let mut step = git.mark(repo.commit(7), Mark::Bad).expect("bad");

        let (mut lo, mut hi) = (0usize, 7usize);
        let mut last_remaining = u32::MAX;
        let resolved = loop {
            match step {
                BisectStep::Next { commit, remaining } => {
                    let remaining = remaining.expect("git reports remaining count");
                    assert!(remaining <= last_remaining, "git count must not grow");
                    last_remaining = remaining;
                    let index = repo.index_of(&commit);
                    assert!(lo < index && index < hi, "candidate inside interval");
                    let mark = if index >= 5 {
                        hi = index;
                        Mark::Bad
                    } else {
                        lo = index;
                        Mark::Good
                    };
                    step = git.mark(&commit, mark).expect("mark");
                }
                BisectStep::Resolved { commit } => break commit,
                BisectStep::OnlySkipped { .. } => panic!("nothing was skipped"),
            }
        };

        assert_eq!(resolved, first_bad);
        assert_eq!((lo, hi), (4, 5));
        assert_eq!(git.first_bad().expect("first bad"), Some(first_bad));
    }

    #[test]
    fn skip_moves_to_another_candidate() {
        let repo = TestRepo::with_commits(6).expect("repo");
        let git = Git::new(repo.path());
        git.start_session().expect("start");
        git.mark_boundary(repo.commit(0)).expect("good");
        let BisectStep::Next { commit, .. } = git.mark(repo.commit(5), Mark::Bad).expect("bad")
        else {
            panic!("expected a candidate");
        };
        match git.mark(&commit, Mark::Skip).expect("skip") {
            BisectStep::Next { commit: next, .. } => assert_ne!(next, commit),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn session_inactive_without_start() {
        let repo = TestRepo::with_commits(2).expect("repo");
        assert!(!Git::new(repo.path()).session_active().expect("active"));
    }

    #[test]
    fn ls_remote_resolves_branch_tip() {
        let repo = TestRepo::with_commits(3).expect("repo");
        let url = repo.path().to_string_lossy().to_string();
        let sha = Git::ls_remote_head(&url, "master").expect("ls-remote");
        assert_eq!(sha, repo.commit(2));
    }

    #[test]
    fn clone_branch_creates_working_copy() {
        let repo = TestRepo::with_commits(2).expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("clone");
        let url = repo.path().to_string_lossy().to_string();
        let git = Git::clone_branch(&url, "master", &dest).expect("clone");
        assert!(git.is_repository());
        assert_eq!(git.rev_parse("HEAD").expect("head"), repo.commit(1));
    }
}
