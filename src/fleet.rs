use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::json;

use crate::controller::{spawn_controller, ControllerHandle, ControllerSettings, Services};
use crate::error::LifecycleError;
use crate::hub::{Publisher, ROSTER_CHANNEL};
use crate::properties::PROPERTIES_FILE;
use crate::schedule::ScheduledTask;
use crate::state::{LiveServerView, ServerIdentity};
use crate::usage::UsageProbe;

/// Marker file whose appearance in a server directory starts that server.
pub const START_MARKER: &str = "start";

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub sample_interval: Duration,
    pub start_marker_poll: Duration,
    pub controller: ControllerSettings,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            start_marker_poll: Duration::from_secs(2),
            controller: ControllerSettings::default(),
        }
    }
}

/// Every directory under `base` holding a `server.properties`, sorted by name.
pub async fn discover(base: &Path) -> anyhow::Result<Vec<ServerIdentity>> {
    let mut entries = tokio::fs::read_dir(base)
        .await
        .with_context(|| format!("Failed to read server directory {}", base.display()))?;
    let mut servers = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .context("Failed to list server directory")?
    {
        let root = entry.path();
        if !root.join(PROPERTIES_FILE).is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        servers.push(ServerIdentity::new(name, root));
    }
    servers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(servers)
}

/// All controllers on this host, keyed by their publish channel.
pub struct Fleet {
    servers: Arc<DashMap<String, ControllerHandle>>,
    publisher: Arc<dyn Publisher>,
    timers: Mutex<Vec<ScheduledTask>>,
}

impl Fleet {
    /// Spawns one controller per server and the fleet-wide timers.
    pub fn launch<F>(
        identities: Vec<ServerIdentity>,
        services: Services,
        settings: FleetSettings,
        usage: F,
    ) -> Arc<Self>
    where
        F: Fn() -> Box<dyn UsageProbe>,
    {
        let servers = Arc::new(DashMap::new());
        for identity in identities {
            tracing::info!(server = %identity.name, root = %identity.root.display(), "managing server");
            let handle = spawn_controller(identity, services.clone(), settings.controller.clone(), usage());
            servers.insert(handle.channel().to_string(), handle);
        }

        let timers = vec![
            sample_ticker(servers.clone(), settings.sample_interval),
            start_marker_watch(servers.clone(), settings.start_marker_poll),
        ];

        Arc::new(Self {
            servers,
            publisher: services.publisher,
            timers: Mutex::new(timers),
        })
    }

    pub fn get(&self, channel: &str) -> Option<ControllerHandle> {
        self.servers.get(channel).map(|entry| entry.value().clone())
    }

    pub fn roster(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .iter()
            .map(|entry| entry.value().name().to_string())
            .collect();
        names.sort();
        names
    }

    /// The roster "hello" clients ask for when they connect, followed by a
    /// fresh state of every server.
    pub async fn hello(&self) {
        self.publisher
            .publish(ROSTER_CHANNEL, json!({ "servers": self.roster() }));
        let handles: Vec<ControllerHandle> = self.servers.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            if let Err(e) = handle.refresh_snapshot().await {
                tracing::debug!(server = %handle.name(), "no state for hello: {}", e);
            }
        }
    }

    pub async fn snapshots(&self) -> Vec<LiveServerView> {
        let handles: Vec<ControllerHandle> = self.servers.iter().map(|e| e.value().clone()).collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.snapshot().await {
                Ok(view) => views.push(view),
                Err(e) => tracing::warn!(server = %handle.name(), "no snapshot: {}", e),
            }
        }
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    /// Delivers a free-text command received on a server channel. Returns
    /// `Ok(false)` when no server owns that channel.
    pub async fn dispatch(&self, channel: &str, text: &str) -> Result<bool, LifecycleError> {
        let Some(handle) = self.get(channel) else {
            tracing::debug!(channel, "command for unknown server channel");
            return Ok(false);
        };
        handle.handle_text(text).await?;
        Ok(true)
    }

    /// Stops every server (bounded by `timeout`), then the fleet timers.
    pub async fn shutdown(&self, timeout: Duration) {
        let handles: Vec<ControllerHandle> = self.servers.iter().map(|e| e.value().clone()).collect();
        let pending: Arc<DashMap<String, ()>> =
            Arc::new(handles.iter().map(|h| (h.name().to_string(), ())).collect());

        let stops = handles.iter().map(|handle| {
            let pending = pending.clone();
            async move {
                if let Err(e) = handle.shutdown().await {
                    tracing::warn!(server = %handle.name(), "failed to shut down cleanly: {}", e);
                }
                pending.remove(handle.name());
            }
        });
        if tokio::time::timeout(timeout, join_all(stops)).await.is_err() {
            let mut stragglers: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
            stragglers.sort();
            tracing::error!(?stragglers, "gave up waiting for servers to stop after {:?}", timeout);
        } else {
            tracing::info!("all servers shut down");
        }

        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn sample_ticker(servers: Arc<DashMap<String, ControllerHandle>>, period: Duration) -> ScheduledTask {
    ScheduledTask::spawn(async move {
        // First tick fires immediately.
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let at = chrono::Utc::now().timestamp_millis();
            for entry in servers.iter() {
                entry.value().sample(at);
            }
        }
    })
}

fn start_marker_watch(servers: Arc<DashMap<String, ControllerHandle>>, period: Duration) -> ScheduledTask {
    ScheduledTask::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let handles: Vec<ControllerHandle> = servers.iter().map(|e| e.value().clone()).collect();
            for handle in handles {
                let marker: PathBuf = handle.root().join(START_MARKER);
                if !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                    continue;
                }
                tracing::info!(server = %handle.name(), "start marker found");
                let starter = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = starter.start().await {
                        tracing::warn!(server = %starter.name(), "start from marker failed: {}", e);
                    }
                });
                if let Err(e) = tokio::fs::remove_file(&marker).await {
                    tracing::warn!(marker = %marker.display(), "failed to remove start marker: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovers_directories_with_properties() {
        let base = tempfile::tempdir().unwrap();
        for name in ["survival", "creative"] {
            let root = base.path().join(name);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join(PROPERTIES_FILE), "server-port=25565\n").unwrap();
        }
        std::fs::create_dir_all(base.path().join("backups")).unwrap();
        std::fs::write(base.path().join("README"), "").unwrap();

        let servers = discover(base.path()).await.unwrap();
        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["creative", "survival"]);
        assert_eq!(servers[1].root, base.path().join("survival"));
    }

    #[tokio::test]
    async fn missing_base_directory_is_an_error() {
        assert!(discover(Path::new("/definitely/not/here")).await.is_err());
    }
}
