// SPDX-License-Identifier: GPL-2.0-only
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    NotFound(std::io::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(e) => write!(f, "config file not found: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound(_))
    }
}

/// Creation attributes a task may leave unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub class: String,
    pub label: String,
    pub netvm: String,
    pub template: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            class: "AppVM".to_string(),
            label: "red".to_string(),
            netvm: "default".to_string(),
            template: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Milliseconds between observed-state re-checks while decommissioning.
    pub poll_interval_ms: u64,
    /// Bound on the decommission wait. Absent means wait forever.
    pub undefine_timeout_secs: Option<u64>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            poll_interval_ms: 1000,
            undefine_timeout_secs: None,
        }
    }
}

/// Which registry implementation backs the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Qadmin,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qadmin" => Ok(BackendKind::Qadmin),
            "memory" => Ok(BackendKind::Memory),
            _ => Err(format!("invalid backend: '{s}' (expected: qadmin, memory)")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub defaults: DefaultsConfig,
    pub reconcile: ReconcileConfig,
    pub backend: BackendConfig,
}

/// Returns the default config file path: $XDG_CONFIG_HOME/warden/warden.yaml
pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .expect("cannot determine XDG_CONFIG_HOME")
        .join("warden");
    config_dir.join("warden.yaml")
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(e)
            } else {
                ConfigError::Invalid(e.to_string())
            }
        })?;
        let config: Config =
            serde_norway::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.defaults.class, "AppVM");
        assert_eq!(config.defaults.label, "red");
        assert_eq!(config.defaults.netvm, "default");
        assert_eq!(config.reconcile.poll_interval_ms, 1000);
        assert_eq!(config.reconcile.undefine_timeout_secs, None);
        assert_eq!(config.backend.kind, BackendKind::Qadmin);
    }

    #[test]
    fn partial_yaml_uses_defaults() {
        let yaml = "defaults:\n  label: blue\n";
        let config: Config = serde_norway::from_str(yaml).unwrap();
        assert_eq!(config.defaults.label, "blue");
        assert_eq!(config.defaults.class, "AppVM");
        assert_eq!(config.backend.kind, BackendKind::Qadmin);
    }

    #[test]
    fn backend_section_deserializes() {
        let yaml = "backend:\n  kind: memory\n";
        let config: Config = serde_norway::from_str(yaml).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }

    #[test]
    fn reconcile_section_deserializes() {
        let yaml = "reconcile:\n  poll_interval_ms: 250\n  undefine_timeout_secs: 30\n";
        let config: Config = serde_norway::from_str(yaml).unwrap();
        assert_eq!(config.reconcile.poll_interval_ms, 250);
        assert_eq!(config.reconcile.undefine_timeout_secs, Some(30));
    }

    #[test]
    fn load_nonexistent_file_returns_not_found() {
        let result = Config::load("/nonexistent/path/warden.yaml");
        assert!(result.is_err());
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn load_invalid_yaml_returns_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.yaml");
        std::fs::write(&path, "{{invalid yaml").unwrap();
        let result = Config::load(&path);
        assert!(result.is_err());
        assert!(!result.unwrap_err().is_not_found());
    }

    #[test]
    fn default_config_path_ends_with_warden_yaml() {
        let path = default_config_path();
        assert!(path.ends_with("warden/warden.yaml"));
    }
}
