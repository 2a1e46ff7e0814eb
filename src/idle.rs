//! Join/leave detection and the idle countdown.
//!
//! The console format belongs to the game server, not to us, so the
//! matching is kept behind [`LogMatcher`] and the countdown only reports
//! back to its owner; whether to actually pause is decided when it fires.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::schedule::ScheduledTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Joined(String),
    Left(String),
}

pub trait LogMatcher: Send + Sync {
    fn classify(&self, line: &str) -> Option<PlayerEvent>;
}

static VANILLA_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r": (?P<player>[^ \[]+)\[/[^\]]+\] logged in with entity id \d+ at \((?:\[[^\]]+\])?-?\d+\.\d+, -?\d+\.\d+, -?\d+\.\d+\)",
    )
    .expect("join pattern is valid")
});

static VANILLA_LEAVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r": (?P<player>[^ ]+) lost connection: .+").expect("leave pattern is valid")
});

/// Connection-log lines as printed by vanilla, Spigot and Paper servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct VanillaLogMatcher;

impl LogMatcher for VanillaLogMatcher {
    fn classify(&self, line: &str) -> Option<PlayerEvent> {
        if let Some(caps) = VANILLA_JOIN.captures(line) {
            return Some(PlayerEvent::Joined(caps["player"].to_string()));
        }
        VANILLA_LEAVE
            .captures(line)
            .map(|caps| PlayerEvent::Left(caps["player"].to_string()))
    }
}

/// An armed idle countdown. `token` identifies this arming so a firing that
/// races with a cancel can be told apart from the current countdown.
#[derive(Debug)]
pub struct IdleCountdown {
    token: u64,
    timeout: Duration,
    _task: ScheduledTask,
}

impl IdleCountdown {
    pub fn arm<F>(token: u64, timeout: Duration, on_elapsed: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        Self {
            token,
            timeout,
            _task: ScheduledTask::after(timeout, move || on_elapsed(token)),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

pub fn countdown_armed_notice(timeout: Duration) -> String {
    format!(
        "This server will pause in {}s, as no players are currently online.",
        timeout.as_secs()
    )
}

pub const COUNTDOWN_FIRED_NOTICE: &str = "This server will pause now, as no players are currently online.";
pub const COUNTDOWN_PLAYER_NOTICE: &str =
    "The scheduled pause has been cancelled, as there are players online again.";
pub const COUNTDOWN_DISABLED_NOTICE: &str =
    "The scheduled pause has been cancelled, as pause-on-idle has been disabled.";

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn recognises_join_lines() {
        let matcher = VanillaLogMatcher;
        let vanilla = "[12:00:01] [Server thread/INFO]: Steve[/127.0.0.1:54321] logged in with entity id 123 at (10.5, 64.0, -20.3)";
        let paper = "[12:00:01 INFO]: Alex[/192.168.1.20:50712] logged in with entity id 4821 at ([world]-120.5, 70.0, 33.69999998)";
        assert_eq!(matcher.classify(vanilla), Some(PlayerEvent::Joined("Steve".into())));
        assert_eq!(matcher.classify(paper), Some(PlayerEvent::Joined("Alex".into())));
    }

    #[test]
    fn recognises_leave_lines() {
        let matcher = VanillaLogMatcher;
        let line = "[12:05:44] [Server thread/INFO]: Steve lost connection: Disconnected";
        assert_eq!(matcher.classify(line), Some(PlayerEvent::Left("Steve".into())));
    }

    #[test]
    fn ignores_chat_and_noise() {
        let matcher = VanillaLogMatcher;
        assert_eq!(matcher.classify("[12:00:00] [Server thread/INFO]: Done (3.2s)! For help, type \"help\""), None);
        assert_eq!(matcher.classify("[12:00:00] [Server thread/INFO]: <Steve> logged in with entity id 5"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_reports_its_token_after_the_timeout() {
        let fired = Arc::new(AtomicU64::new(0));
        let sink = fired.clone();
        let countdown = IdleCountdown::arm(7, Duration::from_secs(30), move |token| {
            sink.store(token, Ordering::SeqCst);
        });
        assert_eq!(countdown.token(), 7);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_countdown_cancels_it() {
        let fired = Arc::new(AtomicU64::new(0));
        let sink = fired.clone();
        let countdown = IdleCountdown::arm(1, Duration::from_secs(5), move |token| {
            sink.store(token, Ordering::SeqCst);
        });
        drop(countdown);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
