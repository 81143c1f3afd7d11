use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::{Duration, Instant};

use moka::sync::Cache;

use crate::error::AppError;
use crate::protocol::EventKind;

const REPEAT_WINDOW: Duration = Duration::from_secs(1);
const BURST_WINDOW: Duration = Duration::from_millis(100);
const MAX_TRACKED: u64 = 100_000;

#[derive(Clone, Copy)]
struct Stamp {
    at: Instant,
    payload_hash: u64,
}

/// De-duplication filter in front of the handlers. Tracks the last event
/// per (identity, kind) with a 1 s TTL: an identical payload inside that
/// second is spam, and any repeat inside 100 ms is spam regardless of
/// payload. Rejections refresh the stamp, so a steady spammer stays
/// rejected.
pub struct SpamGuard {
    recent: Cache<(i64, EventKind), Stamp>,
}

impl SpamGuard {
    pub fn new() -> Self {
        let recent = Cache::builder()
            .max_capacity(MAX_TRACKED)
            .time_to_live(REPEAT_WINDOW)
            .build();
        Self { recent }
    }

    pub fn check(&self, user_id: i64, kind: EventKind, payload: &str) -> Result<(), AppError> {
        let key = (user_id, kind);
        let now = Instant::now();
        let payload_hash = hash_payload(payload);

        if let Some(prev) = self.recent.get(&key) {
            let burst = now.duration_since(prev.at) < BURST_WINDOW;
            if burst || prev.payload_hash == payload_hash {
                self.recent.insert(key, Stamp { at: now, payload_hash });
                return Err(AppError::Spam {
                    event: kind.as_str(),
                });
            }
        }

        self.recent.insert(key, Stamp { at: now, payload_hash });
        Ok(())
    }
}

impl Default for SpamGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_payload(payload: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::SpamGuard;
    use crate::protocol::EventKind;

    #[test]
    fn identical_payload_within_a_second_is_spam() {
        let guard = SpamGuard::new();
        let payload = r#"{"event":"inspect_order"}"#;
        assert!(guard.check(1, EventKind::InspectOrder, payload).is_ok());
        sleep(Duration::from_millis(120));
        assert!(guard.check(1, EventKind::InspectOrder, payload).is_err());
    }

    #[test]
    fn any_repeat_within_the_burst_window_is_spam() {
        let guard = SpamGuard::new();
        assert!(guard.check(1, EventKind::LocationUpdate, "a").is_ok());
        assert!(guard.check(1, EventKind::LocationUpdate, "b").is_err());
    }

    #[test]
    fn distinct_payload_after_the_burst_window_passes() {
        let guard = SpamGuard::new();
        assert!(guard.check(1, EventKind::LocationUpdate, "a").is_ok());
        sleep(Duration::from_millis(120));
        assert!(guard.check(1, EventKind::LocationUpdate, "b").is_ok());
    }

    #[test]
    fn identities_and_kinds_do_not_interfere() {
        let guard = SpamGuard::new();
        assert!(guard.check(1, EventKind::LocationUpdate, "a").is_ok());
        assert!(guard.check(2, EventKind::LocationUpdate, "a").is_ok());
        assert!(guard.check(1, EventKind::AvailabilityUpdate, "a").is_ok());
    }
}
