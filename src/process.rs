use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::controller::OutputRouter;
use crate::error::LifecycleError;
use crate::runtime::java_binary;
use crate::state::ServerIdentity;

/// How a server process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub code: Option<i32>,
}

impl ExitState {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Grace periods for each step of a stop.
#[derive(Debug, Clone, Copy)]
pub struct StopTimeouts {
    pub graceful: Duration,
    pub terminate: Duration,
    pub kill: Duration,
}

impl StopTimeouts {
    pub fn total(&self) -> Duration {
        self.graceful + self.terminate + self.kill
    }
}

/// Handle to one running server process: its console input and its exit.
pub struct ProcessSupervisor {
    pid: Option<u32>,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    exit: watch::Receiver<Option<ExitState>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessSupervisor {
    /// `exit` must be set once the process is gone; sending on `kill` asks
    /// whoever owns the child to kill it.
    pub fn from_parts(
        pid: Option<u32>,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        exit: watch::Receiver<Option<ExitState>>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            stdin: Box::new(stdin),
            exit,
            kill: Some(kill),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_state().is_none()
    }

    /// Returns `None` if the process is still running after `timeout`.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitState> {
        let mut exit = self.exit.clone();
        let result = match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => *state,
            // Nobody is left to report the exit, so nothing is running either.
            Ok(Err(_)) => Some(ExitState { code: None }),
            Err(_) => None,
        };
        result
    }

    pub fn terminate(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(pid, "failed to send SIGTERM: {}", e);
            }
        }
        #[cfg(not(unix))]
        tracing::debug!(pid, "SIGTERM not available on this platform");
    }

    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Writes `stop` to the console, then escalates to SIGTERM and finally a
    /// kill. `None` means the process outlived every step.
    pub async fn stop(&mut self, timeouts: StopTimeouts) -> Option<ExitState> {
        if let Err(e) = self.send_line("stop").await {
            tracing::debug!(pid = ?self.pid, "could not write stop command: {}", e);
        }
        if let Some(exit) = self.wait_for_exit(timeouts.graceful).await {
            return Some(exit);
        }

        tracing::warn!(pid = ?self.pid, "server ignored stop command, sending SIGTERM");
        self.terminate();
        if let Some(exit) = self.wait_for_exit(timeouts.terminate).await {
            return Some(exit);
        }

        tracing::warn!(pid = ?self.pid, "server ignored SIGTERM, killing it");
        self.kill();
        self.wait_for_exit(timeouts.kill).await
    }
}

/// Everything needed to spawn one server process.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub server: ServerIdentity,
    pub runtime: PathBuf,
    pub flags: Vec<String>,
    pub jar: PathBuf,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawns the process and wires its output into `router`. The router
    /// must be told when the process exits.
    async fn launch(
        &self,
        request: LaunchRequest,
        router: OutputRouter,
    ) -> Result<ProcessSupervisor, LifecycleError>;
}

/// Clears the umask, then replaces the shell with the server process.
const UMASK_WRAPPER: &str = r#"umask 0000 && exec "$0" "$@""#;

/// Program and arguments for a launch. On unix the JVM runs with umask 0 so
/// world files stay writable outside the agent.
fn command_line(request: &LaunchRequest) -> (OsString, Vec<OsString>) {
    let mut java: Vec<OsString> = vec![java_binary(&request.runtime).into_os_string()];
    java.extend(request.flags.iter().map(OsString::from));
    java.push("-jar".into());
    java.push(request.jar.clone().into_os_string());
    java.push("nogui".into());

    if cfg!(unix) {
        let mut args = vec![OsString::from("-c"), OsString::from(UMASK_WRAPPER)];
        args.extend(java);
        (OsString::from("sh"), args)
    } else {
        let program = java.remove(0);
        (program, java)
    }
}

/// Launches `<runtime>/bin/java <flags> -jar <jar> nogui` in the server directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct JavaLauncher;

#[async_trait]
impl Launcher for JavaLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        router: OutputRouter,
    ) -> Result<ProcessSupervisor, LifecycleError> {
        let (program, args) = command_line(&request);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.server.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LifecycleError::ProcessSpawn(format!("failed to spawn java: {}", e)))?;

        let pid = child.id();
        let missing = |stream: &str| LifecycleError::ProcessSpawn(format!("failed to get child {}", stream));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        {
            let router = router.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    router.stdout(&line);
                }
            });
        }
        {
            let router = router.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    router.stderr(&line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let name = request.server.name.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(server = %name, "failed to kill server process: {}", e);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(server = %name, "failed to wait for server process: {}", e);
                    None
                }
            };
            tracing::info!(server = %name, ?code, "server process exited");
            exit_tx.send_replace(Some(ExitState { code }));
            router.exited(code);
        });

        tracing::info!(server = %request.server.name, ?pid, "started server process");
        Ok(ProcessSupervisor::from_parts(pid, stdin, exit_rx, kill_tx))
    }
}

/// First `*.jar` in the server directory, by name.
pub async fn find_jar(root: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(root).await.ok()?;
    let mut jars = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jar") && path.is_file() {
            jars.push(path);
        }
    }
    jars.sort();
    jars.into_iter().next()
}

/// Kills java processes left running in a managed server directory by a
/// previous agent that died without stopping them.
pub async fn kill_orphaned_servers(servers: &[ServerIdentity]) {
    let sys = System::new_all();
    let mut killed = 0;
    for server in servers {
        let Ok(root) = std::fs::canonicalize(&server.root) else {
            continue;
        };
        for (pid, process) in sys.processes() {
            let cmd = process.cmd();
            let is_java = cmd.iter().any(|c| c.contains("java")) && cmd.iter().any(|c| c == "-jar");
            if !is_java || process.cwd() != Some(root.as_path()) {
                continue;
            }
            tracing::warn!(server = %server.name, %pid, "found orphaned server process, killing it");
            if process.kill() {
                killed += 1;
            }
        }
    }
    if killed > 0 {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (ProcessSupervisor, watch::Sender<Option<ExitState>>, oneshot::Receiver<()>) {
        let (stdin, _peer) = tokio::io::duplex(64);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        (ProcessSupervisor::from_parts(None, stdin, exit_rx, kill_tx), exit_tx, kill_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_to_kill_when_stop_is_ignored() {
        let (mut process, exit_tx, kill_rx) = supervisor();
        tokio::spawn(async move {
            if kill_rx.await.is_ok() {
                exit_tx.send_replace(Some(ExitState { code: None }));
            }
        });
        let timeouts = StopTimeouts {
            graceful: Duration::from_secs(30),
            terminate: Duration::from_secs(5),
            kill: Duration::from_secs(5),
        };
        let started = tokio::time::Instant::now();
        let exit = process.stop(timeouts).await;
        assert_eq!(exit, Some(ExitState { code: None }));
        assert!(started.elapsed() >= Duration::from_secs(35));
        assert!(!process.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_process_outlives_the_escalation() {
        let (mut process, _exit_tx, _kill_rx) = supervisor();
        let timeouts = StopTimeouts {
            graceful: Duration::from_secs(1),
            terminate: Duration::from_secs(1),
            kill: Duration::from_secs(1),
        };
        assert_eq!(process.stop(timeouts).await, None);
        assert!(process.is_alive());
    }

    #[tokio::test]
    async fn picks_the_first_jar_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.jar"), "").unwrap();
        std::fs::write(dir.path().join("paper-1.21.jar"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(find_jar(dir.path()).await, Some(dir.path().join("paper-1.21.jar")));

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(find_jar(empty.path()).await, None);
    }

    fn request(runtime: &Path, root: &Path) -> LaunchRequest {
        LaunchRequest {
            server: ServerIdentity::new("alpha", root.to_path_buf()),
            runtime: runtime.to_path_buf(),
            flags: vec!["-Xmx2G".to_string()],
            jar: root.join("server.jar"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn java_runs_behind_the_umask_wrapper() {
        let (program, args) = command_line(&request(Path::new("/opt/jdk-21"), Path::new("/srv/alpha")));
        assert_eq!(program, "sh");
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-c",
                UMASK_WRAPPER,
                "/opt/jdk-21/bin/java",
                "-Xmx2G",
                "-jar",
                "/srv/alpha/server.jar",
                "nogui",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wrapped_process_sees_an_empty_umask() {
        use std::os::unix::fs::PermissionsExt;

        let runtime = tempfile::tempdir().unwrap();
        let java = java_binary(runtime.path());
        std::fs::create_dir_all(java.parent().unwrap()).unwrap();
        std::fs::write(&java, "#!/bin/sh\numask\n").unwrap();
        std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = tempfile::tempdir().unwrap();
        let (program, args) = command_line(&request(runtime.path(), root.path()));
        let output = Command::new(program).args(args).output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0000");
    }
}
