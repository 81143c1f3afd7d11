use tracing::{info, warn};

use crate::auth::Role;
use crate::engine::proximity;
use crate::models::presence::{
    CustomerPresence, DriverPresence, GROUP_REFRESH_METERS, GeoPoint,
};
use crate::protocol::ServerEvent;
use crate::state::{AppState, ConnCtx};

/// Registers a driver session. A prior session for the same driver id is
/// told it was replaced and killed; its socket cleanup then sees a presence
/// record owned by the new connection and leaves it alone.
pub async fn driver_connect(state: &AppState, ctx: &ConnCtx) {
    let driver_id = ctx.principal.user_id();

    let previous_conn = state
        .drivers
        .get(&driver_id)
        .map(|presence| presence.conn_id)
        .filter(|conn_id| *conn_id != ctx.conn_id);
    if let Some(old_conn) = previous_conn {
        state.send_to_conn(&old_conn, ServerEvent::SessionReplaced);
        if let Some(handle) = state.conns.get(&old_conn) {
            handle.kill.notify_waiters();
        }
        info!(driver_id, "driver session replaced");
    }

    state
        .drivers
        .insert(driver_id, DriverPresence::new(driver_id, ctx.conn_id));

    if let Err(err) = state.store.set_driver_available(driver_id, true).await {
        warn!(driver_id, error = %err, "failed to persist driver availability");
    }

    state.send_to_conn(&ctx.conn_id, ServerEvent::RequestLocationUpdate);
    state.sync_presence_gauges();
    info!(driver_id, conn_id = %ctx.conn_id, "driver connected");
}

pub fn customer_connect(state: &AppState, ctx: &ConnCtx) {
    let customer_id = ctx.principal.user_id();

    let previous_conn = state
        .customers
        .get(&customer_id)
        .map(|presence| presence.conn_id)
        .filter(|conn_id| *conn_id != ctx.conn_id);
    if let Some(old_conn) = previous_conn {
        state.send_to_conn(&old_conn, ServerEvent::SessionReplaced);
        if let Some(handle) = state.conns.get(&old_conn) {
            handle.kill.notify_waiters();
        }
        info!(customer_id, "customer session replaced");
    }

    state
        .customers
        .insert(customer_id, CustomerPresence::new(customer_id, ctx.conn_id));
    state.sync_presence_gauges();
    info!(customer_id, conn_id = %ctx.conn_id, "customer connected");
}

/// Socket teardown. Always drops the connection handle and its group
/// edges; the presence record is only removed when this connection still
/// owns it, so a replacement session survives the old socket closing.
pub async fn disconnect(state: &AppState, ctx: &ConnCtx) {
    state.conns.remove(&ctx.conn_id);
    let user_id = ctx.principal.user_id();

    match ctx.principal.role() {
        Role::Driver => {
            let affected = {
                let mut rooms = state.rooms_mut();
                let affected = rooms.rooms_of(&ctx.conn_id);
                rooms.evict_conn(&ctx.conn_id);
                affected
            };

            let owns_presence = state
                .drivers
                .get(&user_id)
                .map(|presence| presence.conn_id == ctx.conn_id)
                .unwrap_or(false);
            if owns_presence {
                state.drivers.remove(&user_id);
            }

            for customer_id in affected {
                if owns_presence {
                    state.send_to_customer(
                        customer_id,
                        ServerEvent::DriverDisconnected { driver_id: user_id },
                    );
                }
                proximity::push_nearby_update(state, customer_id);
            }
            info!(driver_id = user_id, conn_id = %ctx.conn_id, "driver disconnected");
        }
        Role::Customer => {
            let owns_presence = state
                .customers
                .get(&user_id)
                .map(|presence| presence.conn_id == ctx.conn_id)
                .unwrap_or(false);
            if owns_presence {
                state.customers.remove(&user_id);
                state.rooms_mut().clear_customer(user_id);
            }
            info!(customer_id = user_id, conn_id = %ctx.conn_id, "customer disconnected");
        }
        Role::Supervisor => {
            info!(supervisor_id = user_id, conn_id = %ctx.conn_id, "supervisor disconnected");
        }
    }

    state.sync_presence_gauges();
}

/// Memory first, then the store, then group recomputation; the validator
/// reads the persisted stamp, so persisting before refreshing makes a
/// driver's very first update placeable.
pub async fn update_driver_location(
    state: &AppState,
    driver_id: i64,
    location: GeoPoint,
    heading: Option<f64>,
) {
    {
        let Some(mut presence) = state.drivers.get_mut(&driver_id) else {
            return;
        };
        presence.location = Some(location);
        if heading.is_some() {
            presence.heading = heading;
        }
    }

    if let Err(err) = state.store.update_user_location(driver_id, location).await {
        state.metrics.store_failures_total.inc();
        warn!(driver_id, error = %err, "failed to persist driver location");
    }

    proximity::refresh_driver(state, driver_id).await;
}

pub async fn update_driver_availability(state: &AppState, driver_id: i64, available: bool) {
    {
        let Some(mut presence) = state.drivers.get_mut(&driver_id) else {
            return;
        };
        presence.available = available;
    }

    if let Err(err) = state.store.set_driver_available(driver_id, available).await {
        warn!(driver_id, error = %err, "failed to persist driver availability");
    }

    proximity::refresh_driver(state, driver_id).await;
}

/// The driver stays connected but leaves every group and stops being
/// offered work until they flip availability back on.
pub async fn driver_going_offline(state: &AppState, driver_id: i64) {
    let affected = state
        .drivers
        .get(&driver_id)
        .map(|presence| state.rooms().rooms_of(&presence.conn_id))
        .unwrap_or_default();

    update_driver_availability(state, driver_id, false).await;

    for customer_id in affected {
        state.send_to_customer(customer_id, ServerEvent::DriverOffline { driver_id });
    }
    info!(driver_id, "driver went offline");
}

/// Group recomputation is anchored: only movement beyond
/// [`GROUP_REFRESH_METERS`] from the last rebuild position triggers it.
/// Small jitter keeps the current group and sends nothing.
pub async fn update_customer_location(state: &AppState, customer_id: i64, location: GeoPoint) {
    let recompute = {
        let Some(mut presence) = state.customers.get_mut(&customer_id) else {
            return;
        };
        presence.location = Some(location);

        let moved_far = presence
            .group_anchor
            .map(|anchor| crate::geo::distance_meters(&anchor, &location) > GROUP_REFRESH_METERS)
            .unwrap_or(true);
        if moved_far {
            presence.group_anchor = Some(location);
        }
        moved_far
    };

    if let Err(err) = state.store.update_user_location(customer_id, location).await {
        warn!(customer_id, error = %err, "failed to persist customer location");
    }

    if recompute {
        proximity::refresh_customer(state, customer_id).await;
    }
}
