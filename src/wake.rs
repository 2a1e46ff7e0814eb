use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::protocol::{
    Handshake, Packet, PacketWriter, MAX_SERVERBOUND_LEN, NEXT_STATE_LOGIN, NEXT_STATE_STATUS,
};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub const PAUSED_PREFIX: &str = "§7[§3mc-fleet§7] ⏸ PAUSED ⏸ §7[§3Join to start§7]\n§r";
pub const WAKING_MESSAGE: &str =
    "§7[§3mc-fleet§7]§r\nThe server is now waking up.\nPlease try again in a few seconds.";

/// What the decoy reports to server list pings while the real server sleeps.
#[derive(Debug, Clone)]
pub struct PausedStatus {
    pub motd: String,
    pub max_players: u32,
    pub favicon: Option<String>,
}

impl PausedStatus {
    fn to_json(&self, protocol: i32) -> String {
        let mut status = json!({
            "version": { "name": "paused", "protocol": protocol },
            "players": { "max": self.max_players, "online": 0, "sample": [] },
            "description": { "text": format!("{}{}", PAUSED_PREFIX, self.motd) },
        });
        if let Some(favicon) = self.favicon.as_deref().filter(|f| !f.is_empty()) {
            status["favicon"] = json!(favicon);
        }
        status.to_string()
    }
}

enum Visit {
    Status,
    Login(String),
}

/// Decoy listener bound to a paused server's port. The first login attempt
/// closes the socket and then runs the wake callback, exactly once.
#[derive(Debug)]
pub struct WakeListener {
    port: u16,
    task: Option<JoinHandle<()>>,
}

impl WakeListener {
    pub async fn bind<F>(port: u16, status: PausedStatus, on_wake: F) -> io::Result<Self>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(port, "wake listener bound");

        let task = tokio::spawn(async move {
            let (login_tx, mut login_rx) = mpsc::channel::<(String, SocketAddr)>(1);
            // Dropped with this task, which aborts any connection still open.
            let mut visitors = JoinSet::new();
            let (player, peer) = loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!(port, "wake listener accept failed: {}", e);
                                continue;
                            }
                        };
                        let status = status.clone();
                        let login_tx = login_tx.clone();
                        visitors.spawn(async move {
                            match tokio::time::timeout(CONNECTION_TIMEOUT, handle_connection(stream, &status)).await {
                                Ok(Ok(Visit::Login(player))) => {
                                    let _ = login_tx.try_send((player, peer));
                                }
                                Ok(Ok(Visit::Status)) => {}
                                Ok(Err(e)) => tracing::debug!(port, %peer, "decoy connection failed: {}", e),
                                Err(_) => tracing::debug!(port, %peer, "decoy connection timed out"),
                            }
                        });
                    }
                    Some(login) = login_rx.recv() => break login,
                    Some(_) = visitors.join_next(), if !visitors.is_empty() => {}
                }
            };
            drop(listener);
            tracing::info!(port, %peer, %player, "login attempt on paused server");
            on_wake(player);
        });

        Ok(Self {
            port,
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Releases the port. Returns once the socket is dropped.
    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            tracing::debug!(port = self.port, "wake listener closed");
        }
    }
}

impl Drop for WakeListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_connection(mut stream: TcpStream, status: &PausedStatus) -> io::Result<Visit> {
    let mut packet = Packet::read_limited(&mut stream, MAX_SERVERBOUND_LEN).await?;
    let handshake = Handshake::parse(&mut packet)?;

    match handshake.next_state {
        NEXT_STATE_STATUS => {
            loop {
                let mut packet = match Packet::read_limited(&mut stream, MAX_SERVERBOUND_LEN).await {
                    Ok(packet) => packet,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Visit::Status),
                    Err(e) => return Err(e),
                };
                match packet.id {
                    0x00 => {
                        PacketWriter::new(0x00)
                            .string(&status.to_json(handshake.protocol))
                            .send(&mut stream)
                            .await?;
                    }
                    0x01 => {
                        let payload = packet.i64()?;
                        PacketWriter::new(0x01).i64(payload).send(&mut stream).await?;
                        return Ok(Visit::Status);
                    }
                    other => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unexpected status packet {other:#04x}"),
                        ))
                    }
                }
            }
        }
        // Anything past status (login, transfer) is a player trying to join.
        next if next >= NEXT_STATE_LOGIN => {
            let player = match Packet::read_limited(&mut stream, MAX_SERVERBOUND_LEN).await {
                Ok(mut login) if login.id == 0x00 => login.string().unwrap_or_default(),
                _ => String::new(),
            };
            let reason = json!({ "text": WAKING_MESSAGE }).to_string();
            PacketWriter::new(0x00).string(&reason).send(&mut stream).await?;
            let _ = stream.shutdown().await;
            Ok(Visit::Login(player))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown next state {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HANDSHAKE_PROTOCOL;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn paused() -> PausedStatus {
        PausedStatus {
            motd: "A Minecraft Server".to_string(),
            max_players: 10,
            favicon: None,
        }
    }

    async fn handshake(port: u16, next_state: i32) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Handshake {
            protocol: HANDSHAKE_PROTOCOL,
            address: "localhost".to_string(),
            port,
            next_state,
        }
        .writer()
        .send(&mut stream)
        .await
        .unwrap();
        stream
    }

    #[tokio::test]
    async fn answers_status_pings_with_paused_motd() {
        let port = free_port().await;
        let mut listener = WakeListener::bind(port, paused(), |_| {}).await.unwrap();

        let mut stream = handshake(port, NEXT_STATE_STATUS).await;
        PacketWriter::new(0x00).send(&mut stream).await.unwrap();
        let mut response = Packet::read(&mut stream).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&response.string().unwrap()).unwrap();
        assert_eq!(body["players"]["max"], 10);
        assert_eq!(body["players"]["online"], 0);
        assert!(body["description"]["text"].as_str().unwrap().contains("PAUSED"));

        PacketWriter::new(0x01).i64(99).send(&mut stream).await.unwrap();
        let mut pong = Packet::read(&mut stream).await.unwrap();
        assert_eq!(pong.id, 0x01);
        assert_eq!(pong.i64().unwrap(), 99);

        listener.close().await;
    }

    #[tokio::test]
    async fn login_closes_the_socket_and_wakes_once() {
        let port = free_port().await;
        let wakes = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = wakes.clone();
        let listener = WakeListener::bind(port, paused(), move |player| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(player);
        })
        .await
        .unwrap();

        let mut stream = handshake(port, NEXT_STATE_LOGIN).await;
        PacketWriter::new(0x00).string("Steve").send(&mut stream).await.unwrap();
        let mut disconnect = Packet::read(&mut stream).await.unwrap();
        assert_eq!(disconnect.id, 0x00);
        assert!(disconnect.string().unwrap().contains("waking up"));

        assert_eq!(rx.recv().await.as_deref(), Some("Steve"));
        // The socket is dropped before the callback runs.
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        drop(listener);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn port_is_free_after_close() {
        let port = free_port().await;
        let mut listener = WakeListener::bind(port, paused(), |_| {}).await.unwrap();
        listener.close().await;
        let rebound = TcpListener::bind(("0.0.0.0", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn silent_visitor_does_not_delay_a_login() {
        let port = free_port().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = WakeListener::bind(port, paused(), move |player| {
            let _ = tx.send(player);
        })
        .await
        .unwrap();

        // Connects and never says anything.
        let _lurker = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let mut stream = handshake(port, NEXT_STATE_LOGIN).await;
        PacketWriter::new(0x00).string("Alex").send(&mut stream).await.unwrap();
        let woke = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(woke.unwrap().as_deref(), Some("Alex"));
    }
}
