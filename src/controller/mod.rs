//! Per-server lifecycle controller.
//!
//! Every server gets one actor task that owns all of its mutable state.
//! Callers talk to it through a [`ControllerHandle`]; requests are answered
//! in the order they were sent, so a `stop` can never interleave with a
//! `start` of the same server. Timers, output readers and the wake listener
//! report back through the same inbox as events.

mod events;
mod server;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::command::ServerCommand;
use crate::error::LifecycleError;
use crate::hub::{server_channel, Publisher};
use crate::idle::LogMatcher;
use crate::message::ConsoleMessage;
use crate::probe::StatusProbe;
use crate::process::{Launcher, StopTimeouts};
use crate::runtime::RuntimeCatalog;
use crate::server_config::ConfigPatch;
use crate::state::{LiveServerView, ServerIdentity};
use crate::usage::UsageProbe;

use events::{ConsoleSink, Event, Input, Notifier, Op};
pub use events::OutputRouter;
use server::Controller;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Probe period while a server is starting.
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_host: String,
    pub stop: StopTimeouts,
    /// Delay before re-probing after a join/leave line, and the extra delay
    /// before the second probe that picks up the player sample.
    pub join_settle: Duration,
    pub sample_settle: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(300),
            probe_host: "127.0.0.1".to_string(),
            stop: StopTimeouts {
                graceful: Duration::from_secs(30),
                terminate: Duration::from_secs(5),
                kill: Duration::from_secs(5),
            },
            join_settle: Duration::from_millis(500),
            sample_settle: Duration::from_millis(4500),
        }
    }
}

/// Collaborators shared by every controller on the host.
#[derive(Clone)]
pub struct Services {
    pub runtimes: Arc<dyn RuntimeCatalog>,
    pub launcher: Arc<dyn Launcher>,
    pub probe: Arc<dyn StatusProbe>,
    pub publisher: Arc<dyn Publisher>,
    pub matcher: Arc<dyn LogMatcher>,
}

#[derive(Clone)]
pub struct ControllerHandle {
    identity: Arc<ServerIdentity>,
    channel: Arc<str>,
    inbox: mpsc::UnboundedSender<Input>,
    console: ConsoleSink,
}

/// Starts the controller task for one server. It refreshes the server's
/// state, autostarts it if configured to, and then serves requests until
/// [`ControllerHandle::shutdown`] or until every handle is dropped.
pub fn spawn_controller(
    identity: ServerIdentity,
    services: Services,
    settings: ControllerSettings,
    usage: Box<dyn UsageProbe>,
) -> ControllerHandle {
    let channel = server_channel(&identity.name);
    let (inbox, rx) = mpsc::unbounded_channel();
    let console = ConsoleSink::new(services.publisher.clone(), channel.clone());
    let controller = Controller::new(
        identity.clone(),
        services,
        settings,
        usage,
        console.clone(),
        channel.clone(),
        Notifier::new(&inbox),
    );
    tokio::spawn(controller.run(rx));

    ControllerHandle {
        identity: Arc::new(identity),
        channel: channel.into(),
        inbox,
        console,
    }
}

impl ControllerHandle {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn root(&self) -> &Path {
        &self.identity.root
    }

    /// The publish channel this server's state and console go out on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn request(&self, op: Op) -> Result<(), LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Op { op, reply })
            .map_err(|_| LifecycleError::ControllerGone)?;
        rx.await.map_err(|_| LifecycleError::ControllerGone)?
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.request(Op::Start).await
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.request(Op::Stop).await
    }

    pub async fn restart(&self) -> Result<(), LifecycleError> {
        self.request(Op::Restart).await
    }

    pub async fn pause(&self) -> Result<(), LifecycleError> {
        self.request(Op::Pause).await
    }

    pub async fn delete_world(&self) -> Result<(), LifecycleError> {
        self.request(Op::DeleteWorld).await
    }

    pub async fn send_command(&self, text: impl Into<String>) -> Result<(), LifecycleError> {
        self.request(Op::Command(text.into())).await
    }

    pub async fn set(&self, patch: ConfigPatch) -> Result<(), LifecycleError> {
        self.request(Op::Set(patch)).await
    }

    /// Stops a running server, releases the wake listener and ends the task.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.request(Op::Shutdown).await
    }

    /// Publishes the whole console history and returns it.
    pub fn get_messages(&self) -> Vec<ConsoleMessage> {
        self.console.replay()
    }

    pub async fn snapshot(&self) -> Result<LiveServerView, LifecycleError> {
        self.view(false).await
    }

    /// Re-reads the server's files and probes it before answering.
    pub async fn refresh_snapshot(&self) -> Result<LiveServerView, LifecycleError> {
        self.view(true).await
    }

    async fn view(&self, refresh: bool) -> Result<LiveServerView, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Snapshot { refresh, reply })
            .map_err(|_| LifecycleError::ControllerGone)?;
        rx.await.map_err(|_| LifecycleError::ControllerGone)?
    }

    /// Asks for one usage sample stamped `at` (unix millis).
    pub fn sample(&self, at: i64) {
        let _ = self.inbox.send(Input::Event(Event::Sample { at }));
    }

    /// Runs a free-text command as received from a client.
    pub async fn handle_text(&self, text: &str) -> Result<(), LifecycleError> {
        let command: ServerCommand = text.parse().map_err(|e| {
            tracing::warn!(server = %self.name(), "rejected command {:?}: {}", text, e);
            LifecycleError::from(e)
        })?;
        tracing::debug!(server = %self.name(), ?command, "command received");
        match command {
            ServerCommand::Start => self.start().await,
            ServerCommand::Stop => self.stop().await,
            ServerCommand::Restart => self.restart().await,
            ServerCommand::Pause => self.pause().await,
            ServerCommand::DeleteWorld => self.delete_world().await,
            ServerCommand::Console(line) => self.send_command(line).await,
            ServerCommand::GetMessages => {
                self.get_messages();
                Ok(())
            }
            ServerCommand::Set(patch) => self.set(patch).await,
        }
    }
}
