use std::collections::HashSet;

use chrono::Utc;
use tracing::warn;

use crate::state::AppState;

/// Filters driver ids down to those the persisted store confirms as
/// dispatchable: approved, active, available, and with a location update
/// inside the freshness window. In-memory presence is never trusted on its
/// own; any query failure returns the empty set so a broken store can only
/// shrink scope, never widen it.
pub async fn filter_eligible(state: &AppState, driver_ids: &[i64]) -> HashSet<i64> {
    if driver_ids.is_empty() {
        return HashSet::new();
    }

    let settings = match state.settings.current(&state.store).await {
        Ok(settings) => settings,
        Err(err) => {
            state.metrics.store_failures_total.inc();
            warn!(error = %err, "settings unavailable, no drivers eligible this cycle");
            return HashSet::new();
        }
    };

    let rows = match state.store.eligibility_snapshot(driver_ids).await {
        Ok(rows) => rows,
        Err(err) => {
            state.metrics.store_failures_total.inc();
            warn!(error = %err, "eligibility query failed, no drivers eligible this cycle");
            return HashSet::new();
        }
    };

    let now = Utc::now();
    let freshness = settings.freshness_window();
    rows.into_iter()
        .filter(|row| {
            row.approved
                && row.active
                && row.available
                && row
                    .last_location_update
                    .is_some_and(|at| now - at <= freshness)
        })
        .map(|row| row.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::models::presence::GeoPoint;
    use crate::state::AppState;
    use crate::store::Store;

    use super::filter_eligible;

    async fn state() -> AppState {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        AppState::new(Config::for_tests(), store)
    }

    #[tokio::test]
    async fn only_approved_active_available_fresh_drivers_pass() {
        let state = state().await;
        let point = GeoPoint { lat: 43.2, lon: 76.9 };

        state.store.upsert_driver(1, "ok", "van", 5.0, true, true).await.unwrap();
        state.store.set_driver_available(1, true).await.unwrap();
        state.store.update_user_location(1, point).await.unwrap();

        state.store.upsert_driver(2, "unapproved", "van", 5.0, false, true).await.unwrap();
        state.store.set_driver_available(2, true).await.unwrap();
        state.store.update_user_location(2, point).await.unwrap();

        state.store.upsert_driver(3, "unavailable", "van", 5.0, true, true).await.unwrap();
        state.store.update_user_location(3, point).await.unwrap();

        state.store.upsert_driver(4, "no-location", "van", 5.0, true, true).await.unwrap();
        state.store.set_driver_available(4, true).await.unwrap();

        let eligible = filter_eligible(&state, &[1, 2, 3, 4, 99]).await;
        assert_eq!(eligible.len(), 1);
        assert!(eligible.contains(&1));
    }

    #[tokio::test]
    async fn store_failure_yields_the_empty_set() {
        let state = state().await;
        state.store.upsert_driver(1, "ok", "van", 5.0, true, true).await.unwrap();
        state.store.set_driver_available(1, true).await.unwrap();
        state
            .store
            .update_user_location(1, GeoPoint { lat: 1.0, lon: 1.0 })
            .await
            .unwrap();

        state.store.close().await;

        let eligible = filter_eligible(&state, &[1]).await;
        assert!(eligible.is_empty());
        assert!(state.metrics.store_failures_total.get() >= 1);
    }

    #[tokio::test]
    async fn empty_input_never_queries() {
        let state = state().await;
        state.store.close().await;
        let eligible = filter_eligible(&state, &[]).await;
        assert!(eligible.is_empty());
        assert_eq!(state.metrics.store_failures_total.get(), 0);
    }
}
