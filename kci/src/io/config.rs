//! kci settings (`.kci-dev.toml`).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Settings file name looked up in the current directory.
pub const LOCAL_SETTINGS: &str = ".kci-dev.toml";
/// Environment variable overriding the instance token.
pub const TOKEN_ENV: &str = "KCI_DEV_TOKEN";

/// kci configuration (TOML).
///
/// Missing fields default to the values Maestro's public instances work with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct KciConfig {
    /// Instance used when `--instance` is not given.
    pub default_instance: Option<String>,

    pub instances: BTreeMap<String, Instance>,

    pub watch: WatchConfig,

    pub bisect: BisectConfig,
}

/// One Maestro deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// Pipeline API base URL (checkout trigger).
    pub pipeline: String,
    /// Core API base URL (node queries).
    pub api: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    /// Delay between node polls.
    pub poll_interval_secs: u64,
    /// Delay before retrying a poll that returned no nodes or failed.
    pub empty_retry_secs: u64,
    /// How long to wait for the decisive test result after all jobs finished.
    pub result_grace_secs: u64,
    /// Give up on the test result this long after the grace window. Unset waits forever.
    pub delayed_result_timeout_secs: Option<u64>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            empty_retry_secs: 5,
            result_grace_secs: 60,
            delayed_result_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BisectConfig {
    /// Pause before re-testing a commit after an infrastructure failure.
    pub infra_retry_delay_secs: u64,
    /// Re-tests of one commit after consecutive infrastructure failures before giving up.
    pub max_infra_retries: u32,
    /// Kill an isolated checkout subprocess after this long. Unset waits forever.
    pub subprocess_timeout_secs: Option<u64>,
    /// Keep at most this much subprocess stdout in memory.
    pub output_limit_bytes: usize,
}

impl Default for BisectConfig {
    fn default() -> Self {
        Self {
            infra_retry_delay_secs: 60,
            max_infra_retries: 5,
            subprocess_timeout_secs: None,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn empty_retry(&self) -> Duration {
        Duration::from_secs(self.empty_retry_secs)
    }

    pub fn result_grace(&self) -> Duration {
        Duration::from_secs(self.result_grace_secs)
    }

    pub fn delayed_result_timeout(&self) -> Option<Duration> {
        self.delayed_result_timeout_secs.map(Duration::from_secs)
    }
}

impl KciConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watch.poll_interval_secs == 0 {
            return Err(anyhow!("watch.poll_interval_secs must be > 0"));
        }
        if self.watch.empty_retry_secs == 0 {
            return Err(anyhow!("watch.empty_retry_secs must be > 0"));
        }
        if self.bisect.output_limit_bytes == 0 {
            return Err(anyhow!("bisect.output_limit_bytes must be > 0"));
        }
        if let Some(name) = &self.default_instance
            && !self.instances.contains_key(name)
        {
            return Err(anyhow!("default_instance '{name}' is not defined"));
        }
        for (name, instance) in &self.instances {
            if instance.pipeline.trim().is_empty() || instance.api.trim().is_empty() {
                return Err(anyhow!(
                    "instance '{name}' needs non-empty pipeline and api URLs"
                ));
            }
        }
        Ok(())
    }

    /// Pick the instance named on the command line, or the default one.
    ///
    /// The token from [`TOKEN_ENV`] wins over the one in the file.
    pub fn instance(&self, name: Option<&str>) -> Result<Instance> {
        let name = name
            .or(self.default_instance.as_deref())
            .ok_or_else(|| anyhow!("no instance selected (use --instance or default_instance)"))?;
        let mut instance = self
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("instance '{name}' is not defined in settings"))?;
        if let Ok(token) = env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            instance.token = Some(token);
        }
        Ok(instance)
    }
}

/// Settings file to use: explicit path, then `./.kci-dev.toml`, then
/// `$HOME/.config/kci-dev/kci-dev.toml`.
pub fn resolve_settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_SETTINGS);
    if local.exists() {
        return Some(local);
    }
    let home = env::var_os("HOME")?;
    let user = PathBuf::from(home)
        .join(".config")
        .join("kci-dev")
        .join("kci-dev.toml");
    user.exists().then_some(user)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KciConfig::default()`.
pub fn load_config(path: &Path) -> Result<KciConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "settings missing, using defaults");
        let cfg = KciConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KciConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    debug!(path = %path.display(), instances = cfg.instances.len(), "settings loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_instance = "staging"

[instances.staging]
pipeline = "https://staging.kernelci.org:9100/"
api = "https://staging.kernelci.org:9000/"
token = "secret"

[instances.production]
pipeline = "https://kernelci-pipeline.westus3.cloudapp.azure.com/"
api = "https://kernelci-api.westus3.cloudapp.azure.com/"

[watch]
poll_interval_secs = 10
"#;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, KciConfig::default());
        assert_eq!(cfg.watch.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.watch.empty_retry(), Duration::from_secs(5));
        assert_eq!(cfg.watch.result_grace(), Duration::from_secs(60));
        assert_eq!(cfg.watch.delayed_result_timeout(), None);
        assert_eq!(cfg.bisect.max_infra_retries, 5);
    }

    #[test]
    fn bisect_section_overrides_retry_limits() {
        let cfg: KciConfig =
            toml::from_str("[bisect]\nmax_infra_retries = 2\ninfra_retry_delay_secs = 10\n")
                .expect("parse");
        assert_eq!(cfg.bisect.max_infra_retries, 2);
        assert_eq!(cfg.bisect.infra_retry_delay_secs, 10);
        assert_eq!(cfg.bisect.output_limit_bytes, 1_000_000);
    }

    #[test]
    fn load_fills_missing_sections_with_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("kci-dev.toml");
        fs::write(&path, SAMPLE).expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.watch.poll_interval_secs, 10);
        assert_eq!(cfg.watch.empty_retry_secs, 5);
        assert_eq!(cfg.bisect, BisectConfig::default());
        assert_eq!(cfg.instances.len(), 2);
    }

    #[test]
    fn instance_falls_back_to_default() {
        let cfg: KciConfig = toml::from_str(SAMPLE).expect("parse");
        let instance = cfg.instance(None).expect("default instance");
        assert_eq!(instance.api, "https://staging.kernelci.org:9000/");
        let production = cfg.instance(Some("production")).expect("named instance");
        assert!(production.pipeline.contains("pipeline"));
        assert!(cfg.instance(Some("nope")).is_err());
    }

    #[test]
    fn undefined_default_instance_is_invalid() {
        let cfg = KciConfig {
            default_instance: Some("ghost".to_string()),
            ..KciConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn zero_poll_interval_is_invalid() {
        let mut cfg = KciConfig::default();
        cfg.watch.poll_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_settings_path_wins() {
        let path = Path::new("/nonexistent/settings.toml");
        assert_eq!(resolve_settings_path(Some(path)), Some(path.to_path_buf()));
    }
}
