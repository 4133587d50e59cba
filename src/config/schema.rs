//! Configuration schema for previewd
//!
//! Configuration is stored at `~/.config/previewd/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// HTTP listener settings
    pub server: ServerConfig,

    /// Source repository settings
    pub repo: RepoConfig,

    /// Build command settings
    pub build: BuildConfig,

    /// Build coordination policy
    pub coordinator: CoordinatorConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable the build-event journal
    pub journal: bool,

    /// Journal location (defaults to the state directory)
    pub journal_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            journal: true,
            journal_path: None,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub bind: String,

    /// Port to listen on (overridden by `PORT`)
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Source repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// git executable
    pub git: String,

    /// Shared clone that worktrees are added from
    pub git_dir: PathBuf,

    /// Directory holding one worktree per build key
    pub worktree_root: PathBuf,

    /// Remote to fetch branches and pull requests from
    pub remote: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            git_dir: PathBuf::from("/tmp/preview.git"),
            worktree_root: PathBuf::from("/tmp/preview"),
            remote: "origin".to_string(),
        }
    }
}

/// A single build command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Program to execute
    pub program: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Commands run inside the worktree after checkout
    pub steps: Vec<StepConfig>,

    /// Re-run the build steps after a refresh
    pub rebuild_on_refresh: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            steps: vec![StepConfig {
                program: "make".to_string(),
                args: vec!["test".to_string()],
                env: HashMap::new(),
            }],
            rebuild_on_refresh: true,
        }
    }
}

/// What to do with waiters when a refresh of a mutable ref fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshFailurePolicy {
    /// Log the failure and serve the previous artifact
    #[default]
    ServeStale,
    /// Deliver the failure log to every waiter
    Fail,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Seconds a branch or pull request build stays fresh
    pub ttl_secs: u64,

    /// Shortest accepted commit abbreviation
    pub min_abbrev_len: usize,

    /// Refresh failure handling
    pub refresh_failure: RefreshFailurePolicy,
}

impl CoordinatorConfig {
    /// Freshness window for mutable refs
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            min_abbrev_len: 4,
            refresh_failure: RefreshFailurePolicy::ServeStale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[coordinator]"));
        assert!(toml.contains("serve-stale"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.coordinator.min_abbrev_len, 4);
        assert_eq!(config.coordinator.ttl(), Duration::from_secs(5));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [coordinator]
            ttl_secs = 30
            refresh_failure = "fail"

            [[build.steps]]
            program = "npm"
            args = ["run", "build"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.coordinator.ttl_secs, 30);
        assert_eq!(config.coordinator.refresh_failure, RefreshFailurePolicy::Fail);
        assert_eq!(config.coordinator.min_abbrev_len, 4); // default preserved
        assert_eq!(config.build.steps.len(), 1);
        assert_eq!(config.build.steps[0].program, "npm");
        assert!(config.build.steps[0].env.is_empty());
        assert!(config.build.rebuild_on_refresh);
    }
}
