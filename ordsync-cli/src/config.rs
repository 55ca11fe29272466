//! CLI configuration.
//!
//! Loaded from `--config <path>` or `~/.ordsync/config.yaml`:
//!
//! ```yaml
//! data_dir: /var/lib/ordsync
//! spool_dir: /var/lib/ordsync/spool
//! registry_path: /etc/ordsync/registry.yaml
//! fieldmap_path: /etc/ordsync/fields.yaml
//! workers: 5
//! tracker:
//!   base_url: https://tracker.example.com
//!   token_env: ORDSYNC_TOKEN
//! retry:
//!   max_attempts: 3
//!   backoff_base_ms: 500
//!   backoff_cap_ms: 30000
//! ```
//!
//! The API token is never stored in the file; `token_env` names the
//! environment variable that carries it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use ordsync_engine::executor::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub registry_path: PathBuf,
    pub fieldmap_path: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub tracker: Option<TrackerSection>,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSection {
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

fn default_workers() -> usize {
    5
}

fn default_token_env() -> String {
    "ORDSYNC_TOKEN".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_cap() -> u64 {
    30_000
}

impl Config {
    /// `~/.ordsync/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ordsync").join("config.yaml"))
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::default_path().context("could not determine home directory")?,
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// The tracker section, required for commands that go online.
    pub fn tracker(&self) -> Result<&TrackerSection> {
        self.tracker
            .as_ref()
            .context("config has no [tracker] section; online commands need one")
    }

    /// Read the API token from the configured environment variable.
    pub fn api_token(&self) -> Result<String> {
        let section = self.tracker()?;
        match std::env::var(&section.token_env) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => bail!(
                "tracker API token not found; export {}",
                section.token_env
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff_base: Duration::from_millis(self.retry.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.retry.backoff_cap_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
data_dir: /tmp/ordsync
spool_dir: /tmp/ordsync/spool
registry_path: /tmp/registry.yaml
fieldmap_path: /tmp/fields.yaml
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.workers, 5);
        assert!(config.tracker.is_none());
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.tracker().is_err());
    }

    #[test]
    fn retry_policy_converts_milliseconds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
data_dir: /tmp/d
spool_dir: /tmp/s
registry_path: /tmp/r.yaml
fieldmap_path: /tmp/f.yaml
retry:
  max_attempts: 5
  backoff_base_ms: 100
  backoff_cap_ms: 1000
"#,
        )
        .unwrap();

        let policy = Config::load(Some(&path)).unwrap().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base, Duration::from_millis(100));
        assert_eq!(policy.backoff_cap, Duration::from_millis(1000));
    }
}
