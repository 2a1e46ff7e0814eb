#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};

use mc_fleet_agent::controller::{
    spawn_controller, ControllerHandle, ControllerSettings, OutputRouter, Services,
};
use mc_fleet_agent::error::{LifecycleError, ProbeError, UsageError};
use mc_fleet_agent::hub::Publisher;
use mc_fleet_agent::idle::VanillaLogMatcher;
use mc_fleet_agent::probe::{StatusProbe, StatusReport};
use mc_fleet_agent::process::{ExitState, LaunchRequest, Launcher, ProcessSupervisor};
use mc_fleet_agent::runtime::{FixedRuntimes, RuntimeDescriptor};
use mc_fleet_agent::state::{PlayerStats, ServerIdentity, ServerStatus};
use mc_fleet_agent::usage::{Measurement, UsageProbe};

pub const RUNTIME: &str = "/opt/jdk-21";

type ExitSender = Arc<watch::Sender<Option<ExitState>>>;

/// Pretends to be a server process: console input is recorded, `stop`
/// makes it exit cleanly and a kill makes it exit by signal.
#[derive(Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
    stubborn: AtomicBool,
    failing: AtomicBool,
    processes: Mutex<Vec<(OutputRouter, ExitSender)>>,
    lines: Arc<Mutex<Vec<String>>>,
    requests: Mutex<Vec<LaunchRequest>>,
}

impl FakeLauncher {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Makes later processes ignore both `stop` and kills.
    pub fn set_stubborn(&self, stubborn: bool) {
        self.stubborn.store(stubborn, Ordering::SeqCst);
    }

    /// Makes later launches fail as if the process could not be spawned.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Prints a line on the latest process's stdout.
    pub fn emit(&self, line: &str) {
        let processes = self.processes.lock().unwrap();
        processes.last().expect("no process launched").0.stdout(line);
    }

    /// The latest process dies on its own with `code`.
    pub fn crash(&self, code: Option<i32>) {
        let processes = self.processes.lock().unwrap();
        let (router, exit) = processes.last().expect("no process launched");
        if exit.send_replace(Some(ExitState { code })).is_none() {
            router.exited(code);
        }
    }

    /// The latest process dies but its exit is never reported, so only a
    /// look at the process itself can tell.
    pub fn exit_unnoticed(&self, code: Option<i32>) {
        let processes = self.processes.lock().unwrap();
        let (_, exit) = processes.last().expect("no process launched");
        exit.send_replace(Some(ExitState { code }));
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        router: OutputRouter,
    ) -> Result<ProcessSupervisor, LifecycleError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LifecycleError::ProcessSpawn("exec format error".to_string()));
        }

        let (stdin, console) = tokio::io::duplex(4096);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exit_tx = Arc::new(exit_tx);
        let stubborn = self.stubborn.load(Ordering::SeqCst);

        {
            let exit_tx = exit_tx.clone();
            let router = router.clone();
            let lines = self.lines.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(console).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().unwrap().push(line.clone());
                    if line == "stop" && !stubborn {
                        if exit_tx.send_replace(Some(ExitState { code: Some(0) })).is_none() {
                            router.exited(Some(0));
                        }
                        break;
                    }
                }
            });
        }
        self.processes
            .lock()
            .unwrap()
            .push((router.clone(), exit_tx.clone()));
        {
            let router = router.clone();
            tokio::spawn(async move {
                if kill_rx.await.is_ok() && !stubborn {
                    if exit_tx.send_replace(Some(ExitState { code: None })).is_none() {
                        router.exited(None);
                    }
                }
            });
        }

        Ok(ProcessSupervisor::from_parts(None, stdin, exit_rx, kill_tx))
    }
}

/// A status probe whose answer the test controls.
pub struct FakeProbe {
    online: AtomicBool,
    players: AtomicU32,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            players: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_players(&self, players: u32) {
        self.players.store(players, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for FakeProbe {
    async fn probe(&self, _host: &str, _port: u16, timeout: Duration) -> Result<StatusReport, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(ProbeError::Timeout(timeout));
        }
        Ok(StatusReport {
            players: PlayerStats {
                online: self.players.load(Ordering::SeqCst),
                max: 20,
                sample: Vec::new(),
            },
            favicon: None,
            version: "fake".to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Value)>>,
}

impl Publisher for RecordingPublisher {
    fn publish(&self, channel: &str, payload: Value) {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
    }
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    /// Status changes and console messages in publish order, as
    /// `status:<status>` and `<kind>:<text>` entries. Repeated statuses are collapsed.
    pub fn timeline(&self) -> Vec<String> {
        let mut timeline: Vec<String> = Vec::new();
        for (_, payload) in self.published() {
            if let Some(status) = payload["serverInfo"]["status"].as_str() {
                let entry = format!("status:{}", status);
                let last_status = timeline.iter().rev().find(|e| e.starts_with("status:"));
                if last_status != Some(&entry) {
                    timeline.push(entry);
                }
            } else if payload["message"].is_object() {
                let message = &payload["message"];
                timeline.push(format!(
                    "{}:{}",
                    message["kind"].as_str().unwrap_or_default(),
                    message["text"].as_str().unwrap_or_default()
                ));
            }
        }
        timeline
    }

    pub fn messages(&self) -> Vec<String> {
        self.timeline()
            .into_iter()
            .filter(|entry| !entry.starts_with("status:"))
            .collect()
    }

    pub fn has_message(&self, text: &str) -> bool {
        self.messages().iter().any(|m| m.contains(text))
    }
}

pub struct FixedUsage;

impl UsageProbe for FixedUsage {
    fn measure(&mut self, _pid: u32) -> Result<Measurement, UsageError> {
        Ok(Measurement {
            cpu: 0.5,
            memory_bytes: 1024,
        })
    }
}

/// Creates `<base>/<name>` with a `server.properties`, a jar and an optional
/// `mc-fleet.json`.
pub fn server_dir(base: &Path, name: &str, port: u16, config: Option<&str>) -> PathBuf {
    let root = base.join(name);
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(
        root.join("server.properties"),
        format!("server-port={}\nlevel-name=world\nmotd=Test server\nmax-players=20\n", port),
    )
    .unwrap();
    std::fs::write(root.join("server.jar"), "").unwrap();
    if let Some(config) = config {
        std::fs::write(root.join("mc-fleet.json"), config).unwrap();
    }
    root
}

pub fn runtimes() -> FixedRuntimes {
    FixedRuntimes(vec![RuntimeDescriptor {
        path: PathBuf::from(RUNTIME),
        name: "OpenJDK 21".to_string(),
        is_default: true,
    }])
}

pub struct Harness {
    pub base: TempDir,
    pub root: PathBuf,
    pub launcher: Arc<FakeLauncher>,
    pub probe: Arc<FakeProbe>,
    pub publisher: Arc<RecordingPublisher>,
    pub handle: ControllerHandle,
}

impl Harness {
    /// Spawns a controller for a fresh server that starts out offline; the
    /// probe reports `online` once the initial refresh is done.
    pub async fn new(port: u16, config: Option<&str>, online: bool) -> Self {
        let base = tempfile::tempdir().unwrap();
        let root = server_dir(base.path(), "alpha", port, config);
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(FakeProbe::new(false));
        let publisher = Arc::new(RecordingPublisher::default());
        let services = Services {
            runtimes: Arc::new(runtimes()),
            launcher: launcher.clone(),
            probe: probe.clone(),
            publisher: publisher.clone(),
            matcher: Arc::new(VanillaLogMatcher),
        };
        let handle = spawn_controller(
            ServerIdentity::new("alpha", root.clone()),
            services,
            ControllerSettings::default(),
            Box::new(FixedUsage),
        );
        handle.snapshot().await.unwrap();
        probe.set_online(online);
        Self {
            base,
            root,
            launcher,
            probe,
            publisher,
            handle,
        }
    }

    pub async fn status(&self) -> ServerStatus {
        self.handle.snapshot().await.unwrap().status
    }

    /// Polls until the controller reports `status`; panics after ~5s.
    pub async fn wait_for(&self, status: ServerStatus) {
        for _ in 0..100 {
            if self.status().await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server never reached {:?}, still {:?}", status, self.status().await);
    }
}

pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
