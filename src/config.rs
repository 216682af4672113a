// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::backend::queue::CommandQueueType;
use crate::native::BackendKind;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub queues: Vec<QueueConfig>,
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            queues: vec![
                QueueConfig {
                    ty: CommandQueueType::Graphics,
                    presenting: true,
                },
                QueueConfig {
                    ty: CommandQueueType::Compute,
                    presenting: false,
                },
                QueueConfig {
                    ty: CommandQueueType::Copy,
                    presenting: false,
                },
            ],
            memory: MemoryConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

/// Device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// Fatal precondition checks; only honoured in debug builds.
    pub validation: bool,
    pub adapter_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::platform_default(),
            validation: true,
            adapter_name: "Host Timeline Adapter".to_string(),
        }
    }
}

/// One logical queue
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(rename = "type")]
    pub ty: CommandQueueType,
    pub presenting: bool,
}

/// Memory budgets in MiB
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub local_budget_mb: u64,
    pub upload_budget_mb: u64,
    pub readback_budget_mb: u64,
    pub max_allocation_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            local_budget_mb: 1024,
            upload_budget_mb: 256,
            readback_budget_mb: 256,
            max_allocation_mb: 512,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "prism_rhi.log".to_string(),
        }
    }
}

impl DebugConfig {
    /// Log level as a filter, defaulting to `Info` for unknown names.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Invalid TOML configuration")?;
        if config.queues.is_empty() {
            log::warn!("No queues configured, using the default queue set");
            config.queues = Config::default().queues;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::from_toml_str("[device]\nvalidation = false\n").unwrap();
        assert!(!config.device.validation);
        assert_eq!(config.queues.len(), 3);
        assert_eq!(config.memory.local_budget_mb, 1024);
    }

    #[test]
    fn queues_and_backend_parse() {
        let config = Config::from_toml_str(
            r#"
            [device]
            backend = "metal"

            [[queues]]
            type = "graphics"
            presenting = true

            [[queues]]
            type = "copy"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.backend, BackendKind::Metal);
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[1].ty, CommandQueueType::Copy);
        assert!(!config.queues[1].presenting);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::from_toml_str("[device\n").is_err());
        assert!(Config::from_toml_str("[device]\nbackend = \"opengl\"\n").is_err());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let debug = DebugConfig {
            log_level: "chatty".to_string(),
            ..DebugConfig::default()
        };
        assert_eq!(debug.level_filter(), log::LevelFilter::Info);
    }
}
