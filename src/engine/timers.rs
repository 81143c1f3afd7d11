use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Per-order timers: one approval countdown and one recurring location
/// push slot per canonical order id. Scheduling a timer for an id that
/// already has one aborts the old task first, so at most one instance of
/// each runs per order. Dropping the manager aborts everything.
pub struct TimerManager {
    countdowns: DashMap<i64, JoinHandle<()>>,
    pushers: DashMap<i64, JoinHandle<()>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            countdowns: DashMap::new(),
            pushers: DashMap::new(),
        }
    }

    /// Runs `on_tick(remaining)` once a second starting immediately, then
    /// `on_expiry` after `total_secs` seconds. The expiry callback must
    /// tolerate racing a resolution that already happened.
    pub fn schedule_countdown<T, F>(&self, order_id: i64, total_secs: u64, mut on_tick: T, on_expiry: F)
    where
        T: FnMut(u64) + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut remaining = total_secs;
            loop {
                ticker.tick().await;
                if remaining == 0 {
                    break;
                }
                on_tick(remaining);
                remaining -= 1;
            }
            on_expiry.await;
        });

        if let Some(previous) = self.countdowns.insert(order_id, handle) {
            previous.abort();
        }
    }

    /// Idempotent; cancelling an order with no countdown is a no-op.
    pub fn cancel_countdown(&self, order_id: i64) {
        if let Some((_, handle)) = self.countdowns.remove(&order_id) {
            handle.abort();
        }
    }

    pub fn start_location_pushes<F>(&self, order_id: i64, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(previous) = self.pushers.insert(order_id, handle) {
            previous.abort();
        }
    }

    pub fn stop_location_pushes(&self, order_id: i64) {
        if let Some((_, handle)) = self.pushers.remove(&order_id) {
            handle.abort();
        }
    }

    /// Reaps entries whose tasks already finished; the maps only grow
    /// otherwise, since countdown completion does not remove itself.
    pub fn sweep(&self) {
        self.countdowns.retain(|_, handle| !handle.is_finished());
        self.pushers.retain(|_, handle| !handle.is_finished());
    }

    pub fn active_countdowns(&self) -> usize {
        self.countdowns.len()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for entry in self.countdowns.iter() {
            entry.value().abort();
        }
        for entry in self.pushers.iter() {
            entry.value().abort();
        }
    }
}
