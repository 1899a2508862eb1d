// Scripted Gateway - Configuration
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Listener address, directories, channel capacities and limits.
// Loaded from JSON, falling back to defaults when the file is absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Master gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Static editor assets
    pub client_dir: PathBuf,
    /// LMDB project store lives under here
    pub data_dir: PathBuf,
    /// Command definitions, relative to each project root
    pub commands_file: String,
    /// Console chunks buffered per execution before the producer suspends
    pub console_buffer: usize,
    /// Events buffered per session before that session starts lagging
    pub event_buffer: usize,
    /// Hard limit for one command execution; None disables it
    pub command_timeout_secs: Option<u64>,
    /// How often the running server re-reads the project store
    pub registry_refresh_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7261,
            client_dir: crate::paths::default_client_dir(),
            data_dir: crate::paths::default_data_dir(),
            commands_file: ".scripted/commands.json".to_string(),
            console_buffer: 64,
            event_buffer: 128,
            command_timeout_secs: Some(15 * 60),
            registry_refresh_secs: 5,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Load config from JSON file, falling back to defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            log::warn!("Config not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save config to JSON file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn registry_refresh(&self) -> Option<Duration> {
        (self.registry_refresh_secs > 0).then(|| Duration::from_secs(self.registry_refresh_secs))
    }
}

// ============================================================================
// TESTS
// ============================================================================
