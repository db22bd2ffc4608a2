//! On-device agent configuration.
//!
//! Local bootstrap settings: which orchestrator to drive (or auto-detect),
//! where durable state lives, and per-driver connection settings. The cloud
//! can override the orchestrator choice later through the target state's
//! config block.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DockerSettings, K3sSettings, OrchestratorKind};

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/edgewise")
}

fn default_poll_interval() -> u64 {
    60
}

fn default_queue_max_size() -> usize {
    1000
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Explicit orchestrator choice; unset means probe and auto-detect.
    #[serde(default)]
    pub orchestrator: Option<OrchestratorKind>,

    /// Directory for the sqlite database and other durable state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub k3s: K3sSettings,

    /// Seconds between reconcile passes in `run` mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Cap on each named offline queue before the oldest item is evicted.
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator: None,
            data_dir: default_data_dir(),
            docker: DockerSettings::default(),
            k3s: K3sSettings::default(),
            poll_interval_secs: default_poll_interval(),
            queue_max_size: default_queue_max_size(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no config file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
}

impl AgentConfig {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a string (useful for testing).
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search for a config file: env override first, then the start
    /// directory and its parents.
    pub fn discover(start_dir: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let names = ["edgewise.yaml", "edgewise.yml", ".edgewise.yaml", ".edgewise.yml"];
        let mut searched = Vec::new();

        if let Ok(env_path) = std::env::var("EDGEWISE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in &names {
                let path = current.join(name);
                if path.exists() {
                    return Ok((path.clone(), Self::load(&path)?));
                }
                searched.push(path);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound { searched })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::Invalid("queue_max_size must be at least 1".into()));
        }
        if self.orchestrator == Some(OrchestratorKind::K3s) && self.k3s.server.is_empty() {
            return Err(ConfigError::Invalid(
                "k3s.server must be set when orchestrator is k3s".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
orchestrator: docker
data_dir: /tmp/edgewise-test
docker:
  socket: /var/run/docker.sock
poll_interval_secs: 30
"#;
        let config = AgentConfig::from_str(yaml).unwrap();
        assert_eq!(config.orchestrator, Some(OrchestratorKind::Docker));
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.docker.socket.as_deref(), Some("/var/run/docker.sock"));
    }

    #[test]
    fn test_defaults_apply_on_empty_config() {
        let config = AgentConfig::from_str("{}").unwrap();
        assert_eq!(config.orchestrator, None);
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.queue_max_size, 1000);
        assert_eq!(config.k3s.namespace, "edgewise");
    }

    #[test]
    fn test_unknown_orchestrator_fails_fast() {
        let result = AgentConfig::from_str("orchestrator: swarm\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = AgentConfig::from_str("poll_interval_secs: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_k3s_server_rejected_when_selected() {
        let yaml = r#"
orchestrator: k3s
k3s:
  server: ""
"#;
        let result = AgentConfig::from_str(yaml);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
