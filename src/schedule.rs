use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A spawned timer owned by whoever holds it. Dropping the value aborts the
/// task, so a cleared `Option<ScheduledTask>` can never fire later.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Runs `f` once after `delay`.
    pub fn after<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    /// Runs `f` every `period`, starting one period from now, until it
    /// returns `false`.
    pub fn every<F>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !f() {
                    break;
                }
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
