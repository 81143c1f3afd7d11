use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::AppError;
use crate::protocol::EventKind;

const WINDOW: Duration = Duration::from_secs(60);
const GLOBAL_USER_MAX: u32 = 200;
const GLOBAL_ADDR_MAX: u32 = 500;

/// Accepted events per 60 s window for one identity and one event kind.
fn event_quota(kind: EventKind) -> u32 {
    match kind {
        EventKind::LocationUpdate | EventKind::CustomerLocationUpdate => 60,
        EventKind::CreateOrder => 5,
        EventKind::CancelOrder | EventKind::CancelOrderWithCode => 10,
        EventKind::AcceptOrderWithLabor
        | EventKind::ConfirmPriceWithCustomer
        | EventKind::PriceConfirmationResponse => 20,
        EventKind::InspectOrder | EventKind::StopInspectingOrder => 30,
        EventKind::AvailabilityUpdate | EventKind::DriverGoingOffline => 30,
        EventKind::DriverStartedNavigation | EventKind::UpdateOrderStatus => 30,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Identity {
    User(i64),
    Addr(IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WindowKey {
    Global(Identity),
    PerEvent(Identity, EventKind),
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Counts the attempt against the window, resetting it lazily when the
    /// previous one has expired. Returns the milliseconds until reset when
    /// the quota is already spent.
    fn admit(&mut self, now: Instant, max: u32) -> Result<(), u64> {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= WINDOW {
            *self = Self::fresh(now);
            return Ok(());
        }
        if self.count >= max {
            return Err((WINDOW - elapsed).as_millis() as u64);
        }
        self.count += 1;
        Ok(())
    }
}

/// Fixed-window counters keyed by identity and event kind. Windows reset
/// lazily on the next check after expiry; the periodic sweep only bounds
/// memory.
pub struct RateLimiter {
    windows: DashMap<WindowKey, RateWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Global per-identity caps, checked before the payload is even parsed.
    pub fn check_global(&self, user_id: i64, addr: IpAddr) -> Result<(), AppError> {
        let now = Instant::now();
        self.admit(
            WindowKey::Global(Identity::User(user_id)),
            now,
            GLOBAL_USER_MAX,
            "global",
        )?;
        self.admit(
            WindowKey::Global(Identity::Addr(addr)),
            now,
            GLOBAL_ADDR_MAX,
            "global",
        )
    }

    /// Per-event caps for both the user id and the source address.
    pub fn check_event(
        &self,
        user_id: i64,
        addr: IpAddr,
        kind: EventKind,
    ) -> Result<(), AppError> {
        let now = Instant::now();
        let max = event_quota(kind);
        self.admit(
            WindowKey::PerEvent(Identity::User(user_id), kind),
            now,
            max,
            kind.as_str(),
        )?;
        self.admit(
            WindowKey::PerEvent(Identity::Addr(addr), kind),
            now,
            max,
            kind.as_str(),
        )
    }

    fn admit(
        &self,
        key: WindowKey,
        now: Instant,
        max: u32,
        event: &'static str,
    ) -> Result<(), AppError> {
        let result = match self.windows.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().admit(now, max),
            Entry::Vacant(entry) => {
                entry.insert(RateWindow::fresh(now));
                Ok(())
            }
        };
        result.map_err(|retry_after_ms| AppError::RateLimited {
            event,
            retry_after_ms,
            remaining: 0,
        })
    }

    /// Drops windows whose reset already passed. Run periodically.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, window| now.duration_since(window.window_start) < WINDOW);
    }

    #[cfg(test)]
    fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
