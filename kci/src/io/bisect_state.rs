//! Persisted bisection state (`kci-bisect.json` by default).
//!
//! The file is the only record of an in-progress bisection that survives a
//! restart. It is rewritten in full after every step via temp file + rename,
//! and guarded by an advisory lock for the lifetime of a `kci bisect` run.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::Mark;

pub const STATE_VERSION: u32 = 1;

/// One tested commit and its verdict.
///
/// Serialized as a single-key object, `{"<commit>": "good"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Mark>", into = "BTreeMap<String, Mark>")]
pub struct HistoryEntry {
    pub commit: String,
    pub mark: Mark,
}

impl HistoryEntry {
    pub fn new(commit: impl Into<String>, mark: Mark) -> Self {
        Self {
            commit: commit.into(),
            mark,
        }
    }
}

impl TryFrom<BTreeMap<String, Mark>> for HistoryEntry {
    type Error = String;

    fn try_from(map: BTreeMap<String, Mark>) -> std::result::Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "history entry must have exactly one commit, found {}",
                map.len()
            ));
        }
        let (commit, mark) = map.into_iter().next().ok_or("empty history entry")?;
        Ok(Self { commit, mark })
    }
}

impl From<HistoryEntry> for BTreeMap<String, Mark> {
    fn from(entry: HistoryEntry) -> Self {
        BTreeMap::from([(entry.commit, entry.mark)])
    }
}

/// Persisted record of a bisection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BisectState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub tree_url: String,
    pub branch: String,
    pub good_commit: String,
    pub bad_commit: String,
    /// Configured flaky-test retry count. Recorded and shown, not acted upon.
    pub retry_count: u32,
    pub job_filter: Vec<String>,
    pub platform_filter: Vec<String>,
    pub test_name: String,
    pub workdir: PathBuf,
    /// True once `git bisect start/good/bad` ran in `workdir`.
    pub initialized: bool,
    pub next_candidate: Option<String>,
    pub history: Vec<HistoryEntry>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl BisectState {
    /// Fresh, uninitialized state for a new bisection.
    pub fn new(params: BisectParams) -> Self {
        Self {
            version: STATE_VERSION,
            tree_url: params.tree_url,
            branch: params.branch,
            good_commit: params.good_commit,
            bad_commit: params.bad_commit,
            retry_count: params.retry_count,
            job_filter: dedup_ordered(params.job_filter),
            platform_filter: dedup_ordered(params.platform_filter),
            test_name: params.test_name,
            workdir: params.workdir,
            initialized: false,
            next_candidate: None,
            history: Vec::new(),
        }
    }

    /// Append a verdict for the commit that was just tested.
    pub fn record(&mut self, commit: &str, mark: Mark) {
        self.history.push(HistoryEntry::new(commit, mark));
    }

    pub fn is_finished(&self) -> bool {
        self.initialized && self.next_candidate.is_none()
    }
}

/// Parameters that seed a new bisection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectParams {
    pub tree_url: String,
    pub branch: String,
    pub good_commit: String,
    pub bad_commit: String,
    pub retry_count: u32,
    pub job_filter: Vec<String>,
    pub platform_filter: Vec<String>,
    pub test_name: String,
    pub workdir: PathBuf,
}

fn dedup_ordered(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Load bisection state, treating a missing or unreadable file as absent.
pub fn load_bisect_state(path: &Path) -> Option<BisectState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no bisect state");
            return None;
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable bisect state, ignoring");
            return None;
        }
    };
    match serde_json::from_str::<BisectState>(&contents) {
        Ok(state) => {
            debug!(
                path = %path.display(),
                history = state.history.len(),
                next = ?state.next_candidate,
                "bisect state loaded"
            );
            Some(state)
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "corrupt bisect state, ignoring");
            None
        }
    }
}

/// Atomically write bisection state to disk (temp file + rename).
pub fn write_bisect_state(path: &Path, state: &BisectState) -> Result<()> {
    debug!(
        path = %path.display(),
        history = state.history.len(),
        next = ?state.next_candidate,
        "writing bisect state"
    );
    let mut buf = serde_json::to_string_pretty(state).context("serialize bisect state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp bisect state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace bisect state {}", path.display()))?;
    Ok(())
}

/// Exclusive advisory lock on `<state>.lock`, released on drop.
///
/// Reads and writes of the state file go through the holder of this lock.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
    state_path: PathBuf,
}

impl StateLock {
    /// Take the lock without blocking; fails if another process holds it.
    pub fn acquire(state_path: &Path) -> Result<Self> {
        let path = lock_path(state_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|err| {
            anyhow!(
                "bisect state {} is locked by another kci process ({err})",
                state_path.display()
            )
        })?;
        debug!(path = %path.display(), "state lock acquired");
        Ok(Self {
            file,
            path,
            state_path: state_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The state file this lock guards.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release state lock");
        }
    }
}

fn lock_path(state_path: &Path) -> PathBuf {
    let mut name = state_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    state_path.with_file_name(name)
}
