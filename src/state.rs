use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::properties::ServerProperties;
use crate::server_config::IdlePolicy;
use crate::usage::UsageSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerStatus {
    Unknown,
    Stopped,
    Starting,
    Started,
    Stopping,
    Paused,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Started => "started",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Name and root directory of a managed server. Fixed at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub root: PathBuf,
}

impl ServerIdentity {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Player {
    pub uuid: String,
    pub name: String,
    /// Base64 data URI of the player's avatar, empty when it could not be resolved.
    pub head: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlayerStats {
    pub online: u32,
    pub max: u32,
    pub sample: Vec<Player>,
}

/// What clients get to see of a server. Built fresh for every publish; holds
/// no process handle and no console history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerView {
    pub name: String,
    pub status: ServerStatus,
    pub properties: ServerProperties,
    pub players: PlayerStats,
    pub favicon: String,
    pub jar: Option<String>,
    pub flags: Vec<String>,
    pub autostart: bool,
    pub pause_on_idle: IdlePolicy,
    pub runtime_path: Option<PathBuf>,
    pub resource_usage: Vec<UsageSample>,
}
