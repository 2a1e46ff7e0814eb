use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::ProbeError;
use crate::protocol::{Handshake, Packet, PacketWriter, HANDSHAKE_PROTOCOL, NEXT_STATE_STATUS};
use crate::state::{Player, PlayerStats};

/// A successful status reading; its existence means the server is online.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub players: PlayerStats,
    pub favicon: Option<String>,
    pub version: String,
}

#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// Errors, including timeouts, simply mean "offline".
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<StatusReport, ProbeError>;
}

#[async_trait]
pub trait AvatarResolver: Send + Sync {
    async fn resolve(&self, uuid: &str) -> anyhow::Result<String>;
}

pub struct NoAvatars;

#[async_trait]
impl AvatarResolver for NoAvatars {
    async fn resolve(&self, _uuid: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Fetches player heads over HTTP and caches them as data URIs.
pub struct HttpAvatars {
    client: reqwest::Client,
    base_url: String,
    cache: DashMap<String, String>,
}

impl HttpAvatars {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            cache: DashMap::new(),
        })
    }
}

impl HttpAvatars {
    async fn fetch(&self, uuid: &str) -> anyhow::Result<String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), uuid);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        ))
    }
}

#[async_trait]
impl AvatarResolver for HttpAvatars {
    async fn resolve(&self, uuid: &str) -> anyhow::Result<String> {
        if let Some(cached) = self.cache.get(uuid) {
            return Ok(cached.value().clone());
        }
        let result = self.fetch(uuid).await;
        // A failed lookup is remembered as a blank head.
        let head = result.as_ref().map(String::clone).unwrap_or_default();
        self.cache.insert(uuid.to_string(), head);
        result
    }
}

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(default)]
    version: Option<VersionJson>,
    players: PlayersJson,
    #[serde(default)]
    favicon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionJson {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlayersJson {
    max: u32,
    online: u32,
    #[serde(default)]
    sample: Option<Vec<SampleJson>>,
}

#[derive(Debug, Deserialize)]
struct SampleJson {
    id: String,
    name: String,
}

/// Queries a server with the Server List Ping protocol.
pub struct ServerListPing {
    avatars: Arc<dyn AvatarResolver>,
}

impl ServerListPing {
    pub fn new(avatars: Arc<dyn AvatarResolver>) -> Self {
        Self { avatars }
    }

    async fn query(host: &str, port: u16) -> Result<StatusJson, ProbeError> {
        let mut stream = TcpStream::connect((host, port)).await?;
        Handshake {
            protocol: HANDSHAKE_PROTOCOL,
            address: host.to_string(),
            port,
            next_state: NEXT_STATE_STATUS,
        }
        .writer()
        .send(&mut stream)
        .await?;
        PacketWriter::new(0x00).send(&mut stream).await?;

        let mut packet = Packet::read(&mut stream).await?;
        if packet.id != 0x00 {
            return Err(ProbeError::Protocol(format!(
                "expected status response, got packet {:#04x}",
                packet.id
            )));
        }
        let json = packet.string()?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Player head for one sample entry, or "" if it isn't ready by
    /// `deadline`. An unfinished lookup keeps running so the resolver can
    /// cache it for the next probe.
    async fn head(&self, entry: &SampleJson, deadline: Instant) -> String {
        let avatars = self.avatars.clone();
        let uuid = entry.id.clone();
        let lookup = tokio::spawn(async move { avatars.resolve(&uuid).await });
        match tokio::time::timeout_at(deadline, lookup).await {
            Ok(Ok(Ok(head))) => head,
            Ok(Ok(Err(e))) => {
                tracing::debug!("avatar lookup for {} failed: {:#}", entry.name, e);
                String::new()
            }
            Ok(Err(e)) => {
                tracing::debug!("avatar lookup for {} panicked: {}", entry.name, e);
                String::new()
            }
            Err(_) => {
                tracing::debug!("avatar lookup for {} is still running", entry.name);
                String::new()
            }
        }
    }
}

#[async_trait]
impl StatusProbe for ServerListPing {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<StatusReport, ProbeError> {
        let deadline = Instant::now() + timeout;
        let status = tokio::time::timeout_at(deadline, Self::query(host, port))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))??;

        let entries = status.players.sample.unwrap_or_default();
        let heads = join_all(entries.iter().map(|entry| self.head(entry, deadline))).await;
        let sample = entries
            .into_iter()
            .zip(heads)
            .map(|(entry, head)| Player {
                uuid: entry.id,
                name: entry.name,
                head,
            })
            .collect();

        Ok(StatusReport {
            players: PlayerStats {
                online: status.players.online,
                max: status.players.max,
                sample,
            },
            favicon: status.favicon,
            version: status.version.map(|v| v.name).unwrap_or_default(),
        })
    }
}
