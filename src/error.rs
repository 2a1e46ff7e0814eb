use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::state::ServerStatus;

/// Failures of a lifecycle operation on a single server.
///
/// None of these are fatal to the agent: they are reported to the server's
/// console and to the caller, and the controller keeps running.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The configured runtime is no longer among the discovered ones.
    #[error("Java runtime {0} does not exist")]
    RuntimeMissing(String),

    #[error("failed to spawn server process: {0}")]
    ProcessSpawn(String),

    #[error("failed to delete world: {0}")]
    DeleteWorld(String),

    /// The process ignored `stop`, SIGTERM and SIGKILL for the whole escalation window.
    #[error("server process did not exit after {0:?}")]
    StuckStop(Duration),

    #[error("cannot {action} while the server is {status}")]
    InvalidTransition {
        action: &'static str,
        status: ServerStatus,
    },

    #[error("a wake listener is already bound for this server")]
    WakeAlreadyArmed,

    #[error("failed to bind wake listener on port {port}: {source}")]
    WakeBind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("server is not running")]
    NotRunning,

    #[error("failed to write to the server console: {0}")]
    Console(#[source] io::Error),

    #[error("failed to persist server config: {0}")]
    Config(String),

    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    #[error("the controller for this server has shut down")]
    ControllerGone,
}

/// Why a status probe did not produce a reading. All of these mean "offline".
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("status query timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("malformed status json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),

    #[error("invalid settings payload: {0}")]
    InvalidPatch(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("process {0} is gone")]
    ProcessGone(u32),
}
