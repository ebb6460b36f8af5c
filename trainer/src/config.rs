use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cluster::ClusterConfig;
use crate::discovery::DiscoveryConfig;
use crate::errors::{Result, TrainerError};
use crate::training::TrainingConfig;

/// Main configuration for the trainer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub cluster: ClusterConfig,
    pub discovery: DiscoveryConfig,
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    /// Defaults to `~/.meshtrain/logs`
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_dir: None,
        }
    }
}

impl TrainerConfig {
    /// Get default configuration file path: `~/.meshtrain/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| TrainerError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".meshtrain").join("config.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: TrainerConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(TrainerError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        self.cluster.validate()?;
        self.discovery.validate()?;
        self.training.validate()?;

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ReductionFailurePolicy;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TrainerConfig::default();

        assert_eq!(config.cluster.collective_timeout_secs, 30);
        assert_eq!(
            config.cluster.reduction_failure_policy,
            ReductionFailurePolicy::ContinueLocal
        );
        assert_eq!(config.discovery.listen_window_ms, 2000);
        assert_eq!(config.training.grad_norm_epsilon, 1e-7);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.log_to_file);
    }

    #[test]
    fn test_config_validation() {
        let config = TrainerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = TrainerConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sections() {
        let mut config = TrainerConfig::default();
        config.discovery.multicast_addr = Ipv4Addr::new(192, 168, 1, 1);
        assert!(config.validate().is_err());

        let mut config = TrainerConfig::default();
        config.training.epochs = 0;
        assert!(config.validate().is_err());

        let mut config = TrainerConfig::default();
        config.cluster.collective_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = TrainerConfig::default();
        original.training.epochs = 7;
        original.logging.log_dir = Some(temp_dir.path().join("logs"));
        original.save(&config_path).expect("save should succeed");

        assert!(config_path.exists());

        let loaded = TrainerConfig::load(&config_path).expect("load should succeed");
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "[training]\nepochs = 3\n\n[cluster]\nreduction_failure_policy = \"abort\"\n",
        )
        .unwrap();

        let config = TrainerConfig::load(&config_path).unwrap();
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.cluster.reduction_failure_policy, ReductionFailurePolicy::Abort);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[logging]\nlevel = \"chatty\"\n").unwrap();

        assert!(matches!(
            TrainerConfig::load(&config_path),
            Err(TrainerError::Config(_))
        ));
        assert!(TrainerConfig::load_or_default(&temp_dir.path().join("missing.toml")).is_ok());
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        TrainerConfig::default().save(&config_path).unwrap();

        let temp_path = config_path.with_extension("toml.tmp");
        assert!(!temp_path.exists(), "temp file should be removed after rename");
        assert!(config_path.exists());
    }

    #[test]
    fn test_default_path() {
        let path = TrainerConfig::default_path().unwrap();
        assert!(path.ends_with(".meshtrain/config.toml"));
    }
}
