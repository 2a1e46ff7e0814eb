use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::controller::ControllerSettings;
use crate::fleet::FleetSettings;
use crate::process::StopTimeouts;

pub const CONFIG_PATH_ENV: &str = "MC_FLEET_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    /// Directory whose subdirectories are the managed servers.
    pub server_path: PathBuf,
    pub static_dir: PathBuf,
    pub runtime_scan_dirs: Vec<PathBuf>,
    pub sample_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    pub stop_timeout_secs: u64,
    pub start_marker_poll_secs: u64,
    pub avatar_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8081".to_string(),
            server_path: PathBuf::from("servers"),
            static_dir: PathBuf::from("dist"),
            runtime_scan_dirs: vec![PathBuf::from("/opt")],
            sample_interval_secs: 10,
            shutdown_timeout_secs: 60,
            probe_timeout_ms: 300,
            stop_timeout_secs: 30,
            start_marker_poll_secs: 2,
            avatar_url: "https://crafatar.com/avatars".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        let defaults = ControllerSettings::default();
        FleetSettings {
            sample_interval: Duration::from_secs(self.sample_interval_secs.max(1)),
            start_marker_poll: Duration::from_secs(self.start_marker_poll_secs.max(1)),
            controller: ControllerSettings {
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                stop: StopTimeouts {
                    graceful: Duration::from_secs(self.stop_timeout_secs),
                    ..defaults.stop
                },
                ..defaults
            },
        }
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("SERVER_PATH").filter(|v| !v.is_empty()) {
            self.server_path = PathBuf::from(path);
        }
        if let Some(addr) = var("BIND_ADDRESS").filter(|v| !v.is_empty()) {
            self.bind_address = addr;
        }
    }
}

/// Loads the agent config from `$MC_FLEET_CONFIG` (or `config.json`),
/// then applies environment overrides.
pub async fn load_config() -> anyhow::Result<AgentConfig> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_config_from(Path::new(&path)).await?;
    config.apply_env(|name| std::env::var(name).ok());
    Ok(config)
}

pub async fn load_config_from(path: &Path) -> anyhow::Result<AgentConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(AgentConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
