use std::collections::HashSet;

use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::{dispatch, validator};
use crate::geo;
use crate::models::presence::GeoPoint;
use crate::protocol::ServerEvent;
use crate::protocol::outbound::NearbyDriver;
use crate::state::AppState;

/// Recomputes which customer groups one driver connection belongs to and
/// applies the difference. Any failure to confirm eligibility leaves the
/// driver in no group at all for this cycle.
pub async fn refresh_driver(state: &AppState, driver_id: i64) {
    let Some((conn_id, location, available)) = state
        .drivers
        .get(&driver_id)
        .map(|presence| (presence.conn_id, presence.location, presence.available))
    else {
        return;
    };

    let desired = desired_rooms_for(state, driver_id, location, available).await;

    let affected = {
        let mut rooms = state.rooms_mut();
        let old: HashSet<i64> = rooms.rooms_of(&conn_id).into_iter().collect();
        rooms.set_rooms(conn_id, desired.clone());
        old.symmetric_difference(&desired).copied().collect::<Vec<_>>()
    };

    state.sync_presence_gauges();
    for customer_id in affected {
        push_nearby_update(state, customer_id);
    }
}

async fn desired_rooms_for(
    state: &AppState,
    driver_id: i64,
    location: Option<GeoPoint>,
    available: bool,
) -> HashSet<i64> {
    let Some(location) = location else {
        return HashSet::new();
    };
    if !available {
        return HashSet::new();
    }

    let Ok(settings) = state.settings.current(&state.store).await else {
        state.metrics.store_failures_total.inc();
        return HashSet::new();
    };
    if !validator::filter_eligible(state, &[driver_id]).await.contains(&driver_id) {
        return HashSet::new();
    }

    state
        .customers
        .iter()
        .filter_map(|entry| {
            let customer_location = entry.value().location?;
            let distance = geo::haversine_km(&location, &customer_location);
            (distance <= settings.search_radius_km).then_some(entry.value().customer_id)
        })
        .collect()
}

/// Recomputes the member set of one customer's group from every connected
/// driver, validating all candidates in a single batched query, then pushes
/// the refreshed nearby list to the customer.
pub async fn refresh_customer(state: &AppState, customer_id: i64) {
    let Some(location) = state
        .customers
        .get(&customer_id)
        .map(|presence| presence.location)
    else {
        return;
    };

    let desired = desired_members_for(state, location).await;

    {
        let mut rooms = state.rooms_mut();
        rooms.set_members(customer_id, desired);
    }

    state.sync_presence_gauges();
    push_nearby_update(state, customer_id);
}

async fn desired_members_for(state: &AppState, location: Option<GeoPoint>) -> HashSet<Uuid> {
    let Some(location) = location else {
        return HashSet::new();
    };
    let Ok(settings) = state.settings.current(&state.store).await else {
        state.metrics.store_failures_total.inc();
        return HashSet::new();
    };

    // in-memory prefilter; the store has the final word on eligibility
    let candidates: Vec<(i64, Uuid)> = state
        .drivers
        .iter()
        .filter_map(|entry| {
            let presence = entry.value();
            let driver_location = presence.location?;
            if !presence.available {
                return None;
            }
            let distance = geo::haversine_km(&driver_location, &location);
            (distance <= settings.search_radius_km)
                .then_some((presence.driver_id, presence.conn_id))
        })
        .collect();

    let ids: Vec<i64> = candidates.iter().map(|(id, _)| *id).collect();
    let eligible = validator::filter_eligible(state, &ids).await;

    candidates
        .into_iter()
        .filter_map(|(id, conn)| eligible.contains(&id).then_some(conn))
        .collect()
}

/// Sends the customer the current member list with distances, nearest
/// first.
pub fn push_nearby_update(state: &AppState, customer_id: i64) {
    let Some(customer_location) = state
        .customers
        .get(&customer_id)
        .and_then(|presence| presence.location)
    else {
        return;
    };

    let member_conns = state.rooms().members_of(customer_id);
    let mut drivers: Vec<NearbyDriver> = member_conns
        .iter()
        .filter_map(|conn_id| {
            let driver_id = state.conns.get(conn_id)?.principal.user_id();
            let presence = state.drivers.get(&driver_id)?;
            let location = presence.location?;
            Some(NearbyDriver {
                driver_id,
                location,
                heading: presence.heading,
                distance_km: geo::haversine_km(&location, &customer_location),
            })
        })
        .collect();
    drivers.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

    state.send_to_customer(customer_id, ServerEvent::NearbyDriversUpdate { drivers });
}

/// Periodic repair pass: rebuilds the whole desired membership table from
/// live presence with one batched eligibility query, applies differences,
/// drops groups of departed customers, and expires stale inspection locks.
/// Running it twice in a row changes nothing the second time.
pub async fn run_reconciliation(state: &AppState) {
    let settings = state.settings.current(&state.store).await;
    let radius_km = match &settings {
        Ok(settings) => settings.search_radius_km,
        Err(_) => {
            state.metrics.store_failures_total.inc();
            0.0
        }
    };

    let customers: Vec<(i64, Option<GeoPoint>)> = state
        .customers
        .iter()
        .map(|entry| (entry.value().customer_id, entry.value().location))
        .collect();
    let candidates: Vec<(i64, Uuid, GeoPoint)> = state
        .drivers
        .iter()
        .filter_map(|entry| {
            let presence = entry.value();
            let location = presence.location?;
            presence
                .available
                .then_some((presence.driver_id, presence.conn_id, location))
        })
        .collect();

    let eligible = if settings.is_ok() {
        let ids: Vec<i64> = candidates.iter().map(|(id, _, _)| *id).collect();
        validator::filter_eligible(state, &ids).await
    } else {
        HashSet::new()
    };

    let mut changed_customers = Vec::new();
    {
        let mut rooms = state.rooms_mut();

        let live: HashSet<i64> = customers.iter().map(|(id, _)| *id).collect();
        for stale in rooms.customer_ids() {
            if !live.contains(&stale) {
                rooms.clear_customer(stale);
            }
        }

        for (customer_id, location) in &customers {
            let desired: HashSet<Uuid> = match location {
                Some(location) => candidates
                    .iter()
                    .filter(|(driver_id, _, driver_location)| {
                        eligible.contains(driver_id)
                            && geo::haversine_km(driver_location, location) <= radius_km
                    })
                    .map(|(_, conn_id, _)| *conn_id)
                    .collect(),
                None => HashSet::new(),
            };

            let old: HashSet<Uuid> = rooms.members_of(*customer_id).into_iter().collect();
            if old != desired {
                changed_customers.push(*customer_id);
                rooms.set_members(*customer_id, desired);
            }
        }
    }

    state.sync_presence_gauges();
    for customer_id in &changed_customers {
        push_nearby_update(state, *customer_id);
    }

    let expired_locks = dispatch::expire_stale_locks(state).await;

    if !changed_customers.is_empty() || expired_locks > 0 {
        info!(
            corrected_groups = changed_customers.len(),
            expired_locks, "reconciliation applied corrections"
        );
    } else {
        debug!("reconciliation found nothing to correct");
    }
}
