use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

pub const CONFIG_FILE: &str = "mc-fleet.json";
const CONFIG_TMP_FILE: &str = "mc-fleet.json.tmp";
const LEGACY_FLAGS_FILE: &str = "flags.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdlePolicy {
    pub enabled: bool,
    pub timeout_seconds: u64,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub flags: Vec<String>,
    pub autostart: bool,
    pub pause_on_idle: IdlePolicy,
    pub runtime_path: Option<PathBuf>,
}

/// Partial update sent by clients with `set <json>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub flags: Option<Vec<String>>,
    pub autostart: Option<bool>,
    pub pause_on_idle: Option<IdlePolicy>,
    pub runtime_path: Option<PathBuf>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.flags.is_none()
            && self.autostart.is_none()
            && self.pause_on_idle.is_none()
            && self.runtime_path.is_none()
    }
}

impl ServerConfig {
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(flags) = patch.flags {
            self.flags = flags;
        }
        if let Some(autostart) = patch.autostart {
            self.autostart = autostart;
        }
        if let Some(policy) = patch.pause_on_idle {
            self.pause_on_idle = policy;
        }
        if let Some(path) = patch.runtime_path {
            self.runtime_path = Some(path);
        }
    }
}

/// Reads and writes the per-server config file inside the server directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Never fails: a missing or unreadable file yields the default config.
    pub async fn load(&self) -> ServerConfig {
        let mut config = match tokio::fs::read_to_string(self.path()).await {
            Ok(contents) => match serde_json::from_str::<ServerConfig>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::debug!(dir = %self.dir.display(), "ignoring malformed server config: {}", e);
                    ServerConfig::default()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(dir = %self.dir.display(), "could not read server config: {}", e);
                }
                ServerConfig::default()
            }
        };

        if config.flags.is_empty() {
            if let Some(flags) = self.take_legacy_flags().await {
                config.flags = flags;
                if let Err(e) = self.save(&config).await {
                    tracing::warn!(dir = %self.dir.display(), "failed to persist migrated flags: {:#}", e);
                }
            }
        }
        config
    }

    async fn take_legacy_flags(&self) -> Option<Vec<String>> {
        let path = self.dir.join(LEGACY_FLAGS_FILE);
        let contents = tokio::fs::read_to_string(&path).await.ok()?;
        let flags: Vec<String> = contents.split_whitespace().map(str::to_string).collect();
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("failed to remove {}: {}", path.display(), e);
        }
        tracing::info!(dir = %self.dir.display(), "migrated {} flags from {}", flags.len(), LEGACY_FLAGS_FILE);
        Some(flags)
    }

    pub async fn save(&self, config: &ServerConfig) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(config).context("Failed to serialize server config")?;
        let tmp_path = self.dir.join(CONFIG_TMP_FILE);
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .context("Failed to create temp server config")?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to write temp server config")?;
        file.flush().await.context("Failed to flush temp server config")?;
        file.sync_all().await.context("Failed to fsync temp server config")?;
        drop(file);

        set_shared_permissions(&tmp_path)?;

        tokio::fs::rename(&tmp_path, self.path())
            .await
            .context("Failed to move server config into place")?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_shared_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_shared_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_or_garbled_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.load().await, ServerConfig::default());

        std::fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load().await, ServerConfig::default());
    }

    #[tokio::test]
    async fn saved_config_is_reloaded_and_world_writable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = ServerConfig {
            flags: vec!["-Xmx2G".to_string()],
            autostart: true,
            pause_on_idle: IdlePolicy {
                enabled: true,
                timeout_seconds: 30,
            },
            runtime_path: Some(PathBuf::from("/opt/jdk-21")),
        };
        store.save(&config).await.unwrap();
        assert_eq!(store.load().await, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o666);
        }
    }

    #[tokio::test]
    async fn legacy_flags_file_is_migrated_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LEGACY_FLAGS_FILE), "-Xms1G -Xmx4G\n").unwrap();
        let store = ConfigStore::new(dir.path());

        let config = store.load().await;
        assert_eq!(config.flags, vec!["-Xms1G", "-Xmx4G"]);
        assert!(!dir.path().join(LEGACY_FLAGS_FILE).exists());
        assert_eq!(store.load().await.flags, vec!["-Xms1G", "-Xmx4G"]);
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut config = ServerConfig {
            flags: vec!["-Xmx1G".to_string()],
            ..ServerConfig::default()
        };
        let patch: ConfigPatch =
            serde_json::from_str(r#"{"pauseOnIdle": {"enabled": true, "timeoutSeconds": 45}}"#).unwrap();
        config.apply(patch);
        assert_eq!(config.flags, vec!["-Xmx1G"]);
        assert!(config.pause_on_idle.enabled);
        assert_eq!(config.pause_on_idle.timeout_seconds, 45);
    }
}
