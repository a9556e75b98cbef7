//! Configuration for the PRD engine

use eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::oracle::DEFAULT_CALL_TIMEOUT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control root holding the session store and its lock
    #[serde(default = "default_control_root")]
    pub control_root: PathBuf,

    /// Directory for per-chat conversation logs
    #[serde(default = "default_log_dir")]
    pub conversation_log_dir: PathBuf,

    /// Directory queued issues are written to on apply
    #[serde(default = "default_queue_dir")]
    pub issue_queue_dir: PathBuf,

    /// Directory finalized PRD documents land in
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,

    /// Command for the reasoning CLI; empty disables the oracle
    #[serde(default = "default_oracle_command")]
    pub oracle_command: String,

    /// Per-call oracle timeout in seconds (hard-capped at 120)
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,

    /// Byte budget for the conversation tail sent with oracle calls
    #[serde(default = "default_tail_budget")]
    pub conversation_tail_budget: usize,
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prdengine")
}

fn default_control_root() -> PathBuf {
    data_root().join("control")
}

fn default_log_dir() -> PathBuf {
    data_root().join("convlog")
}

fn default_queue_dir() -> PathBuf {
    data_root().join("queue")
}

fn default_documents_dir() -> PathBuf {
    data_root().join("documents")
}

fn default_oracle_command() -> String {
    "codex".to_string()
}

fn default_oracle_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_secs()
}

fn default_tail_budget() -> usize {
    convlog::DEFAULT_TAIL_BUDGET
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_root: default_control_root(),
            conversation_log_dir: default_log_dir(),
            issue_queue_dir: default_queue_dir(),
            documents_dir: default_documents_dir(),
            oracle_command: default_oracle_command(),
            oracle_timeout_secs: default_oracle_timeout_secs(),
            conversation_tail_budget: default_tail_budget(),
        }
    }
}

impl Config {
    /// Load config from file, or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = serde_yaml::from_str(&content)?;
            return Ok(config);
        }

        // Try default locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("prdengine").join("config.yml")),
            Some(PathBuf::from("prdengine.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        Ok(Config::default())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.oracle_command, "codex");
        assert_eq!(config.oracle_timeout_secs, 40);
        assert!(config.control_root.ends_with("prdengine/control"));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yml");
        std::fs::write(&path, "oracle_command: my-oracle\noracle_timeout_secs: 10\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.oracle_command, "my-oracle");
        assert_eq!(config.oracle_timeout(), Duration::from_secs(10));
        assert_eq!(config.conversation_tail_budget, convlog::DEFAULT_TAIL_BUDGET);
    }

    #[test]
    fn test_save_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yml");
        let mut config = Config::default();
        config.issue_queue_dir = temp.path().join("q");
        config.save(&path).unwrap();

        let back = Config::load(Some(&path)).unwrap();
        assert_eq!(back.issue_queue_dir, config.issue_queue_dir);
    }
}
