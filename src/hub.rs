use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

pub const ROSTER_CHANNEL: &str = "MESSAGE";
pub const ROSTER_REQUEST_CHANNEL: &str = "SEND_MESSAGE";
pub const RUNTIMES_CHANNEL: &str = "JAVA_RUNTIMES";
const SERVER_CHANNEL_PREFIX: &str = "server_";

/// Characters left alone by JavaScript's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn server_channel(name: &str) -> String {
    format!("{}{}", SERVER_CHANNEL_PREFIX, utf8_percent_encode(name, COMPONENT))
}

pub fn is_server_channel(channel: &str) -> bool {
    channel.starts_with(SERVER_CHANNEL_PREFIX)
}

/// Where controllers broadcast state. The transport behind it is not their concern.
pub trait Publisher: Send + Sync {
    fn publish(&self, channel: &str, payload: Value);
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: Value,
}

/// Fan-out of published envelopes to every connected client.
pub struct Hub {
    tx: broadcast::Sender<Envelope>,
    closed: watch::Sender<bool>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self { tx, closed }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
        tracing::info!("publish hub closed");
    }
}

impl Publisher for Hub {
    fn publish(&self, channel: &str, payload: Value) {
        if self.is_closed() {
            return;
        }
        // No subscribers is fine; nobody is watching right now.
        let _ = self.tx.send(Envelope {
            channel: channel.to_string(),
            payload,
        });
    }
}
