use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::events::{ConsoleSink, Event, Input, Notifier, Op, OutputRouter};
use super::{ControllerSettings, Services};
use crate::error::LifecycleError;
use crate::idle::{
    countdown_armed_notice, IdleCountdown, COUNTDOWN_DISABLED_NOTICE, COUNTDOWN_FIRED_NOTICE,
    COUNTDOWN_PLAYER_NOTICE,
};
use crate::message::ConsoleMessage;
use crate::probe::StatusReport;
use crate::process::{find_jar, LaunchRequest, ProcessSupervisor};
use crate::properties::ServerProperties;
use crate::runtime::default_runtime;
use crate::schedule::ScheduledTask;
use crate::server_config::{ConfigPatch, ConfigStore, ServerConfig};
use crate::state::{LiveServerView, PlayerStats, ServerIdentity, ServerStatus};
use crate::usage::{UsageProbe, UsageSampler};
use crate::wake::{PausedStatus, WakeListener};

const BRAND: &str = "[mc-fleet]";
const WORLD_SUFFIXES: [&str; 3] = ["", "_nether", "_the_end"];

/// State and tasks of one server, owned by its actor task.
pub(super) struct Controller {
    identity: ServerIdentity,
    services: Services,
    settings: ControllerSettings,
    store: ConfigStore,
    console: ConsoleSink,
    channel: String,
    notifier: Notifier,

    status: ServerStatus,
    config: ServerConfig,
    properties: ServerProperties,
    players: PlayerStats,
    favicon: String,
    jar: Option<PathBuf>,
    usage: UsageSampler,

    process: Option<ProcessSupervisor>,
    generation: u64,
    poll: Option<ScheduledTask>,
    idle: Option<IdleCountdown>,
    idle_tokens: u64,
    settles: Vec<ScheduledTask>,
    wake: Option<WakeListener>,
}

impl Controller {
    pub(super) fn new(
        identity: ServerIdentity,
        services: Services,
        settings: ControllerSettings,
        usage: Box<dyn UsageProbe>,
        console: ConsoleSink,
        channel: String,
        notifier: Notifier,
    ) -> Self {
        Self {
            store: ConfigStore::new(&identity.root),
            identity,
            services,
            settings,
            console,
            channel,
            notifier,
            status: ServerStatus::Unknown,
            config: ServerConfig::default(),
            properties: ServerProperties::default(),
            players: PlayerStats::default(),
            favicon: String::new(),
            jar: None,
            usage: UsageSampler::new(usage),
            process: None,
            generation: 0,
            poll: None,
            idle: None,
            idle_tokens: 0,
            settles: Vec::new(),
            wake: None,
        }
    }

    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>) {
        self.reload().await;
        self.probe_status().await;
        self.publish_view();

        if self.config.autostart && self.status == ServerStatus::Stopped {
            tracing::info!(server = %self.identity.name, "autostarting server");
            if let Err(e) = self.start().await {
                tracing::error!(server = %self.identity.name, "autostart failed: {}", e);
            }
        }

        while let Some(input) = inbox.recv().await {
            match input {
                Input::Op { op: Op::Shutdown, reply } => {
                    let result = self.shutdown().await;
                    let _ = reply.send(result);
                    return;
                }
                Input::Op { op, reply } => {
                    let result = self.apply(op).await;
                    if let Err(e) = &result {
                        tracing::warn!(server = %self.identity.name, "operation failed: {}", e);
                    }
                    let _ = reply.send(result);
                }
                Input::Snapshot { refresh, reply } => {
                    if refresh {
                        self.reload().await;
                        self.probe_status().await;
                        self.publish_view();
                    }
                    let _ = reply.send(Ok(self.view()));
                }
                Input::Event(event) => self.on_event(event).await,
            }
        }

        // Every handle is gone.
        self.clear_process_tasks();
        self.close_wake().await;
    }

    async fn apply(&mut self, op: Op) -> Result<(), LifecycleError> {
        match op {
            Op::Start => self.start().await,
            Op::Stop => self.stop().await,
            Op::Restart => self.restart().await,
            Op::Pause => self.pause().await,
            Op::DeleteWorld => self.delete_world().await,
            Op::Command(text) => self.send_command(&text).await,
            Op::Set(patch) => self.set(patch).await,
            Op::Shutdown => self.shutdown().await,
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::PlayerActivity(activity) => {
                tracing::debug!(server = %self.identity.name, ?activity, "player activity");
                self.settles.retain(|task| !task.is_finished());
                let first = self.settings.join_settle;
                let second = first + self.settings.sample_settle;
                for delay in [first, second] {
                    let notifier = self.notifier.clone();
                    self.settles.push(ScheduledTask::after(delay, move || {
                        notifier.send(Event::Settled);
                    }));
                }
            }
            Event::Settled => {
                if self.process.is_some() && self.probe_status().await {
                    self.publish_view();
                    self.check_idle().await;
                }
            }
            Event::PollTick => {
                if self.status == ServerStatus::Starting {
                    self.probe_status().await;
                    self.publish_view();
                }
                if self.status != ServerStatus::Starting {
                    self.poll = None;
                }
            }
            Event::IdleElapsed { token } => self.on_idle_elapsed(token).await,
            Event::ProcessExited { generation, code } => {
                if generation == self.generation && self.process.is_some() {
                    self.on_exit(code);
                }
            }
            Event::Wake { player } => {
                if self.status != ServerStatus::Paused {
                    return;
                }
                self.console
                    .push(ConsoleMessage::notice(format!("{} tried to join, waking the server up.", player)));
                if let Err(e) = self.start().await {
                    tracing::error!(server = %self.identity.name, "failed to wake server: {}", e);
                }
            }
            Event::Sample { at } => {
                let pid = self
                    .process
                    .as_ref()
                    .filter(|p| p.is_alive())
                    .and_then(ProcessSupervisor::pid);
                self.usage.sample(at, pid);
                self.publish_view();
            }
        }
    }

    async fn start(&mut self) -> Result<(), LifecycleError> {
        match self.status {
            ServerStatus::Stopped => {}
            ServerStatus::Paused => {
                self.close_wake().await;
                self.status = ServerStatus::Stopped;
            }
            status => {
                return Err(LifecycleError::InvalidTransition {
                    action: "start",
                    status,
                })
            }
        }
        self.reload().await;

        let runtime = match self.resolve_runtime().await {
            Ok(runtime) => runtime,
            Err(e) => return Err(self.start_failed(e)),
        };
        let Some(jar) = self.jar.clone() else {
            let e = LifecycleError::ProcessSpawn(format!(
                "no server jar found in {}",
                self.identity.root.display()
            ));
            return Err(self.start_failed(e));
        };

        self.generation += 1;
        let router = OutputRouter::new(
            self.console.clone(),
            self.services.matcher.clone(),
            self.notifier.clone(),
            self.generation,
        );
        let request = LaunchRequest {
            server: self.identity.clone(),
            runtime,
            flags: self.config.flags.clone(),
            jar,
        };
        let launcher = self.services.launcher.clone();
        let process = match launcher.launch(request, router).await {
            Ok(process) => process,
            Err(e) => return Err(self.start_failed(e)),
        };
        let pid = process.pid();
        self.process = Some(process);
        self.status = ServerStatus::Starting;
        self.players = PlayerStats {
            max: self.properties.max_players,
            ..PlayerStats::default()
        };
        tracing::info!(server = %self.identity.name, ?pid, "server starting");

        // Nobody can be online yet, so an idle countdown starts right away.
        self.arm_idle().await;
        self.start_polling();
        self.usage.sample(chrono::Utc::now().timestamp_millis(), pid);
        self.publish_view();
        Ok(())
    }

    fn start_failed(&mut self, error: LifecycleError) -> LifecycleError {
        tracing::warn!(server = %self.identity.name, "failed to start server: {}", error);
        self.status = ServerStatus::Stopped;
        self.console
            .push(ConsoleMessage::error(format!("Failed to start server: {}", error)));
        self.publish_view();
        error
    }

    async fn resolve_runtime(&mut self) -> Result<PathBuf, LifecycleError> {
        let catalog = self.services.runtimes.clone();
        let runtimes = catalog.discover().await;
        match &self.config.runtime_path {
            Some(path) => runtimes
                .iter()
                .find(|runtime| &runtime.path == path)
                .map(|runtime| runtime.path.clone())
                .ok_or_else(|| LifecycleError::RuntimeMissing(path.display().to_string())),
            None => default_runtime(&runtimes)
                .map(|runtime| runtime.path.clone())
                .ok_or_else(|| LifecycleError::RuntimeMissing("(default)".to_string())),
        }
    }

    async fn stop(&mut self) -> Result<(), LifecycleError> {
        match self.status {
            ServerStatus::Stopped | ServerStatus::Unknown => return Ok(()),
            ServerStatus::Paused => {
                self.close_wake().await;
                self.status = ServerStatus::Stopped;
                self.console.push(ConsoleMessage::notice(
                    "Server has stopped listening for connections.",
                ));
                self.publish_view();
                return Ok(());
            }
            _ => {}
        }

        if self.process.is_none() {
            self.status = ServerStatus::Stopped;
            self.publish_view();
            return Ok(());
        }
        self.status = ServerStatus::Stopping;
        self.publish_view();
        tracing::info!(server = %self.identity.name, "stopping server");

        let timeouts = self.settings.stop;
        let exit = match self.process.as_mut() {
            Some(process) => process.stop(timeouts).await,
            None => return Ok(()),
        };
        match exit {
            Some(exit) => {
                self.on_exit(exit.code);
                Ok(())
            }
            None => {
                let e = LifecycleError::StuckStop(timeouts.total());
                tracing::error!(server = %self.identity.name, "{}", e);
                self.console.push(ConsoleMessage::error(format!("Failed to stop server: {}", e)));
                self.publish_view();
                Err(e)
            }
        }
    }

    async fn restart(&mut self) -> Result<(), LifecycleError> {
        self.stop().await?;
        self.start().await
    }

    async fn pause(&mut self) -> Result<(), LifecycleError> {
        match self.status {
            ServerStatus::Paused => return Err(LifecycleError::WakeAlreadyArmed),
            ServerStatus::Started | ServerStatus::Starting | ServerStatus::Stopped => {}
            status => {
                return Err(LifecycleError::InvalidTransition {
                    action: "pause",
                    status,
                })
            }
        }
        if self.wake.is_some() {
            return Err(LifecycleError::WakeAlreadyArmed);
        }

        self.stop().await?;
        self.reload().await;

        let port = self.properties.server_port;
        let paused = PausedStatus {
            motd: self.properties.motd.clone(),
            max_players: self.properties.max_players,
            favicon: Some(self.favicon.clone()).filter(|f| !f.is_empty()),
        };
        let notifier = self.notifier.clone();
        match WakeListener::bind(port, paused, move |player| {
            notifier.send(Event::Wake { player });
        })
        .await
        {
            Ok(listener) => {
                self.wake = Some(listener);
                self.status = ServerStatus::Paused;
                self.console.push(ConsoleMessage::notice(
                    "Server paused. It will start again when a player tries to join.",
                ));
                self.publish_view();
                Ok(())
            }
            Err(source) => {
                self.status = ServerStatus::Stopped;
                let e = LifecycleError::WakeBind { port, source };
                self.console.push(ConsoleMessage::error(e.to_string()));
                self.publish_view();
                Err(e)
            }
        }
    }

    async fn delete_world(&mut self) -> Result<(), LifecycleError> {
        let was = self.status;
        if matches!(
            was,
            ServerStatus::Started | ServerStatus::Starting | ServerStatus::Stopping
        ) {
            self.stop().await?;
        }
        self.reload().await;

        if let Err(e) = remove_world_dirs(&self.identity.root, &self.properties.level_name).await {
            self.console
                .push(ConsoleMessage::error(format!("Failed to delete world: {}", e)));
            self.publish_view();
            return Err(e);
        }
        self.console.push(ConsoleMessage::notice("World deleted."));
        tracing::info!(server = %self.identity.name, "world deleted");

        if was == ServerStatus::Started {
            self.start().await?;
        }
        self.publish_view();
        Ok(())
    }

    async fn send_command(&mut self, text: &str) -> Result<(), LifecycleError> {
        let Some(process) = self.process.as_mut() else {
            return Err(LifecycleError::NotRunning);
        };
        if matches!(text.trim(), "stop" | "restart") {
            self.status = ServerStatus::Stopping;
        }
        process.send_line(text).await.map_err(LifecycleError::Console)?;
        self.publish_view();
        Ok(())
    }

    async fn set(&mut self, patch: ConfigPatch) -> Result<(), LifecycleError> {
        if patch.is_empty() {
            return Ok(());
        }
        let before = self.config.pause_on_idle;
        let mut updated = self.config.clone();
        updated.apply(patch);
        self.store
            .save(&updated)
            .await
            .map_err(|e| LifecycleError::Config(format!("{:#}", e)))?;
        self.config = updated;

        let after = self.config.pause_on_idle;
        if after != before && after.enabled {
            // A new timeout only applies to a fresh countdown.
            let timeout = Duration::from_secs(after.timeout_seconds);
            if self.idle.as_ref().is_some_and(|countdown| countdown.timeout() != timeout) {
                self.idle = None;
            }
            if self.players.online == 0 {
                self.arm_idle().await;
            }
        }
        // Disabling leaves an armed countdown in place; it re-checks the
        // policy when it fires.
        self.publish_view();
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        let result = match self.status {
            ServerStatus::Started | ServerStatus::Starting | ServerStatus::Stopping => self.stop().await,
            _ => Ok(()),
        };
        self.close_wake().await;
        self.clear_process_tasks();
        tracing::info!(server = %self.identity.name, status = %self.status, "controller shut down");
        result
    }

    async fn arm_idle(&mut self) {
        let policy = self.config.pause_on_idle;
        if !policy.enabled || self.idle.is_some() {
            return;
        }
        if !matches!(self.status, ServerStatus::Started | ServerStatus::Starting) {
            return;
        }
        self.idle_tokens += 1;
        let timeout = Duration::from_secs(policy.timeout_seconds);
        let notifier = self.notifier.clone();
        self.idle = Some(IdleCountdown::arm(self.idle_tokens, timeout, move |token| {
            notifier.send(Event::IdleElapsed { token });
        }));
        tracing::debug!(server = %self.identity.name, ?timeout, "idle countdown armed");
        self.broadcast(&countdown_armed_notice(timeout)).await;
    }

    async fn check_idle(&mut self) {
        if self.players.online == 0 {
            self.arm_idle().await;
        } else if self.idle.take().is_some() {
            self.broadcast(COUNTDOWN_PLAYER_NOTICE).await;
        }
    }

    async fn on_idle_elapsed(&mut self, token: u64) {
        if self.idle.as_ref().map(IdleCountdown::token) != Some(token) {
            return;
        }
        self.idle = None;

        if !self.config.pause_on_idle.enabled {
            self.broadcast(COUNTDOWN_DISABLED_NOTICE).await;
            return;
        }
        if self.players.online > 0 {
            self.broadcast(COUNTDOWN_PLAYER_NOTICE).await;
            return;
        }
        if !matches!(self.status, ServerStatus::Started | ServerStatus::Starting) {
            return;
        }
        self.broadcast(COUNTDOWN_FIRED_NOTICE).await;
        if let Err(e) = self.pause().await {
            tracing::warn!(server = %self.identity.name, "idle pause failed: {}", e);
        }
    }

    /// Writes a notice to the console log and, if the server is up, to every player in game.
    async fn broadcast(&mut self, text: &str) {
        self.console.push(ConsoleMessage::notice(text));
        if let Some(process) = self.process.as_mut().filter(|p| p.is_alive()) {
            let component = Value::String(format!("{} {}", BRAND, text));
            if let Err(e) = process.send_line(&format!("tellraw @a {}", component)).await {
                tracing::debug!(server = %self.identity.name, "could not broadcast notice: {}", e);
            }
        }
    }

    async fn reload(&mut self) {
        match ServerProperties::load(&self.identity.root).await {
            Ok(properties) => self.properties = properties,
            Err(e) => {
                tracing::warn!(server = %self.identity.name, "failed to read server properties: {:#}", e)
            }
        }
        self.config = self.store.load().await;
        self.jar = find_jar(&self.identity.root).await;
    }

    /// Probes the server's port and folds the result into the status.
    /// Returns whether the server answered.
    async fn probe_status(&mut self) -> bool {
        if self.status == ServerStatus::Paused {
            return false;
        }
        let probe = self.services.probe.clone();
        let result = probe
            .probe(
                &self.settings.probe_host,
                self.properties.server_port,
                self.settings.probe_timeout,
            )
            .await;
        match result {
            Ok(report) => {
                self.on_online(report);
                true
            }
            Err(e) => {
                tracing::debug!(server = %self.identity.name, "status probe failed: {}", e);
                self.on_offline();
                false
            }
        }
    }

    fn on_online(&mut self, report: StatusReport) {
        self.players = report.players;
        if let Some(favicon) = report.favicon {
            self.favicon = favicon;
        }
        // A port answered without our process is someone else's server.
        if self.process.is_some()
            && matches!(self.status, ServerStatus::Starting | ServerStatus::Unknown)
        {
            tracing::info!(server = %self.identity.name, version = %report.version, "server started");
            self.status = ServerStatus::Started;
        }
    }

    fn on_offline(&mut self) {
        self.players = PlayerStats {
            max: self.properties.max_players,
            ..PlayerStats::default()
        };
        let exited = match &self.process {
            None => {
                if self.status != ServerStatus::Stopped {
                    self.status = ServerStatus::Stopped;
                }
                return;
            }
            Some(process) => process.exit_state(),
        };
        // A live process, or one that exited cleanly and is about to report
        // it, is not evidence enough of a stopped server.
        if let Some(exit) = exited.filter(|exit| !exit.is_clean()) {
            self.on_exit(exit.code);
        }
    }

    fn on_exit(&mut self, code: Option<i32>) {
        let expected = self.status == ServerStatus::Stopping;
        self.process = None;
        self.clear_process_tasks();
        self.status = ServerStatus::Stopped;
        self.players = PlayerStats {
            max: self.properties.max_players,
            ..PlayerStats::default()
        };
        if expected {
            tracing::info!(server = %self.identity.name, ?code, "server stopped");
        } else {
            tracing::warn!(server = %self.identity.name, ?code, "server process exited unexpectedly");
            let code = code.map_or_else(|| "a signal".to_string(), |c| format!("code {}", c));
            self.console
                .push(ConsoleMessage::error(format!("Server process exited with {}.", code)));
        }
        self.publish_view();
    }

    fn start_polling(&mut self) {
        let notifier = self.notifier.clone();
        self.poll = Some(ScheduledTask::every(self.settings.poll_interval, move || {
            notifier.send(Event::PollTick)
        }));
    }

    fn clear_process_tasks(&mut self) {
        self.poll = None;
        self.idle = None;
        self.settles.clear();
    }

    async fn close_wake(&mut self) {
        if let Some(mut listener) = self.wake.take() {
            listener.close().await;
            tracing::debug!(server = %self.identity.name, port = listener.port(), "wake listener released");
        }
    }

    fn view(&self) -> LiveServerView {
        LiveServerView {
            name: self.identity.name.clone(),
            status: self.status,
            properties: self.properties.clone(),
            players: self.players.clone(),
            favicon: self.favicon.clone(),
            jar: self
                .jar
                .as_ref()
                .and_then(|jar| jar.file_name())
                .map(|name| name.to_string_lossy().into_owned()),
            flags: self.config.flags.clone(),
            autostart: self.config.autostart,
            pause_on_idle: self.config.pause_on_idle,
            runtime_path: self.config.runtime_path.clone(),
            resource_usage: self.usage.samples(),
        }
    }

    fn publish_view(&self) {
        self.services
            .publisher
            .publish(&self.channel, json!({ "serverInfo": self.view() }));
    }
}

/// Removes the world and its nether and end companions. Missing ones are fine.
async fn remove_world_dirs(root: &Path, level_name: &str) -> Result<(), LifecycleError> {
    let is_plain = Path::new(level_name)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if level_name.is_empty() || !is_plain {
        return Err(LifecycleError::DeleteWorld(format!(
            "refusing to delete level '{}'",
            level_name
        )));
    }
    for suffix in WORLD_SUFFIXES {
        let dir = root.join(format!("{}{}", level_name, suffix));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed world directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(LifecycleError::DeleteWorld(format!("{}: {}", dir.display(), e)));
            }
        }
    }
    Ok(())
}
