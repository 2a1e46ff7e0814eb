use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::error::LifecycleError;
use crate::hub::Publisher;
use crate::idle::{LogMatcher, PlayerEvent};
use crate::message::{ConsoleMessage, MessageLog};
use crate::server_config::ConfigPatch;
use crate::state::LiveServerView;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, LifecycleError>>;

/// Operations that change a server; processed one at a time.
#[derive(Debug)]
pub(crate) enum Op {
    Start,
    Stop,
    Restart,
    Pause,
    DeleteWorld,
    Command(String),
    Set(ConfigPatch),
    Shutdown,
}

/// Things the controller's own tasks report back to it.
#[derive(Debug)]
pub(crate) enum Event {
    PlayerActivity(PlayerEvent),
    Settled,
    PollTick,
    IdleElapsed { token: u64 },
    ProcessExited { generation: u64, code: Option<i32> },
    Wake { player: String },
    Sample { at: i64 },
}

pub(crate) enum Input {
    Op { op: Op, reply: Reply<()> },
    Snapshot { refresh: bool, reply: Reply<LiveServerView> },
    Event(Event),
}

/// Lets timers and readers reach the controller without keeping it alive.
#[derive(Clone)]
pub(crate) struct Notifier {
    inbox: mpsc::WeakUnboundedSender<Input>,
}

impl Notifier {
    pub(crate) fn new(inbox: &mpsc::UnboundedSender<Input>) -> Self {
        Self {
            inbox: inbox.downgrade(),
        }
    }

    /// `false` once the controller is gone.
    pub(crate) fn send(&self, event: Event) -> bool {
        match self.inbox.upgrade() {
            Some(inbox) => inbox.send(Input::Event(event)).is_ok(),
            None => false,
        }
    }
}

/// The console history of one server, shared by the controller and the
/// output readers so lines never queue behind a slow operation.
#[derive(Clone)]
pub(crate) struct ConsoleSink {
    log: Arc<Mutex<MessageLog>>,
    publisher: Arc<dyn Publisher>,
    channel: String,
}

impl ConsoleSink {
    pub(crate) fn new(publisher: Arc<dyn Publisher>, channel: String) -> Self {
        Self {
            log: Arc::new(Mutex::new(MessageLog::default())),
            publisher,
            channel,
        }
    }

    pub(crate) fn push(&self, message: ConsoleMessage) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        self.publisher.publish(&self.channel, json!({ "message": message }));
    }

    pub(crate) fn snapshot(&self) -> Vec<ConsoleMessage> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }

    /// Re-sends the whole history, for clients that just connected.
    pub(crate) fn replay(&self) -> Vec<ConsoleMessage> {
        let messages = self.snapshot();
        self.publisher.publish(&self.channel, json!({ "message": messages }));
        messages
    }
}

/// Receives the output and the exit of one launched process.
#[derive(Clone)]
pub struct OutputRouter {
    console: ConsoleSink,
    matcher: Arc<dyn LogMatcher>,
    notifier: Notifier,
    generation: u64,
}

impl OutputRouter {
    pub(crate) fn new(
        console: ConsoleSink,
        matcher: Arc<dyn LogMatcher>,
        notifier: Notifier,
        generation: u64,
    ) -> Self {
        Self {
            console,
            matcher,
            notifier,
            generation,
        }
    }

    pub fn stdout(&self, line: &str) {
        self.console.push(ConsoleMessage::output(line));
        if let Some(event) = self.matcher.classify(line) {
            self.notifier.send(Event::PlayerActivity(event));
        }
    }

    pub fn stderr(&self, line: &str) {
        self.console.push(ConsoleMessage::error(line));
    }

    pub fn exited(&self, code: Option<i32>) {
        self.notifier.send(Event::ProcessExited {
            generation: self.generation,
            code,
        });
    }
}
