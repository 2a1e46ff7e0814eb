use std::collections::VecDeque;

use serde::Serialize;
use uuid::Uuid;

pub const MESSAGE_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Default,
    Error,
    SystemNotice,
}

/// A single console line, either from the server process or from the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleMessage {
    pub timestamp: i64,
    pub kind: MessageKind,
    pub text: String,
    pub id: Uuid,
}

impl ConsoleMessage {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            text: text.into(),
            id: Uuid::new_v4(),
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Default, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, text)
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::new(MessageKind::SystemNotice, text)
    }
}

/// FIFO of the most recent console messages.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: VecDeque<ConsoleMessage>,
}

impl MessageLog {
    pub fn push(&mut self, message: ConsoleMessage) {
        while self.entries.len() >= MESSAGE_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn snapshot(&self) -> Vec<ConsoleMessage> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_most_recent_fifty_in_order() {
        let mut log = MessageLog::default();
        for i in 0..75 {
            log.push(ConsoleMessage::output(format!("line {i}")));
        }
        assert_eq!(log.snapshot().len(), MESSAGE_CAPACITY);

        let texts: Vec<String> = log.snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts.first().map(String::as_str), Some("line 25"));
        assert_eq!(texts.last().map(String::as_str), Some("line 74"));
        assert!(texts.windows(2).all(|w| {
            let a: u32 = w[0].trim_start_matches("line ").parse().unwrap();
            let b: u32 = w[1].trim_start_matches("line ").parse().unwrap();
            b == a + 1
        }));
    }

    #[test]
    fn repeated_messages_are_not_deduplicated() {
        let mut log = MessageLog::default();
        let message = ConsoleMessage::notice("same");
        log.push(message.clone());
        log.push(message);
        assert_eq!(log.snapshot().len(), 2);
    }
}
