use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::engine::pricing::{self, Quote};
use crate::engine::proximity;
use crate::engine::validator;
use crate::error::AppError;
use crate::geo;
use crate::models::order::{NewOrder, Order, OrderStatus};
use crate::models::presence::{GeoPoint, InspectionLock, PendingApproval};
use crate::protocol::ServerEvent;
use crate::protocol::outbound::{DriverInfo, OrderSummary};
use crate::state::{AppState, ConnCtx};

/// Seconds the customer has to answer a price proposal.
pub const APPROVAL_WINDOW_SECS: u64 = 60;
/// Cadence of driver position pushes for an active order.
const LOCATION_PUSH_SECS: u64 = 10;
/// An inspection lock older than this is presumed abandoned.
const LOCK_MAX_AGE_SECS: i64 = 300;

fn actor(role: Role, user_id: i64) -> String {
    format!("{}:{user_id}", role.as_str())
}

fn record_transition(state: &AppState, status: OrderStatus) {
    state
        .metrics
        .order_transitions_total
        .with_label_values(&[status.as_str()])
        .inc();
}

async fn require_order(state: &AppState, order_id: i64) -> Result<Order, AppError> {
    state
        .store
        .fetch_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
}

fn require_owned_by_customer(order: &Order, customer_id: i64) -> Result<(), AppError> {
    if order.customer_id != customer_id {
        return Err(AppError::Auth("order belongs to another customer".into()));
    }
    Ok(())
}

fn notify_room(state: &AppState, customer_id: i64, exclude: Option<Uuid>, event: &ServerEvent) {
    for conn_id in state.rooms().members_of(customer_id) {
        if Some(conn_id) == exclude {
            continue;
        }
        state.send_to_conn(&conn_id, event.clone());
    }
}

/// Offer fan-out. Room membership only proves a driver was nearby at the
/// last geometry pass; whether they may still be offered work is a store
/// fact that can flip in between. Every offer re-checks eligibility and
/// skips members the store no longer confirms.
async fn offer_to_room(
    state: &AppState,
    customer_id: i64,
    exclude: Option<Uuid>,
    event: &ServerEvent,
) {
    let members = state.rooms().members_of(customer_id);
    let mut targets = Vec::new();
    for conn_id in members {
        if Some(conn_id) == exclude {
            continue;
        }
        if let Some(conn) = state.conns.get(&conn_id) {
            targets.push((conn_id, conn.principal.user_id()));
        }
    }

    let driver_ids: Vec<i64> = targets.iter().map(|(_, driver_id)| *driver_id).collect();
    let eligible = validator::filter_eligible(state, &driver_ids).await;

    for (conn_id, driver_id) in targets {
        if eligible.contains(&driver_id) {
            state.send_to_conn(&conn_id, event.clone());
        }
    }
}

async fn driver_info(state: &AppState, driver_id: i64) -> DriverInfo {
    match state.store.driver_profile(driver_id).await {
        Ok(Some(profile)) => DriverInfo {
            driver_id,
            name: profile.name,
            rating: profile.rating,
            vehicle_type: profile.vehicle_type,
        },
        _ => DriverInfo {
            driver_id,
            name: format!("Driver {driver_id}"),
            rating: 5.0,
            vehicle_type: String::new(),
        },
    }
}

async fn order_quote(state: &AppState, order: &Order, labor_count: u32) -> Result<Quote, AppError> {
    let rule = state
        .store
        .pricing_for(&order.vehicle_type)
        .await?
        .ok_or_else(|| {
            AppError::Validation(format!("unknown vehicle_type: {}", order.vehicle_type))
        })?;
    let distance_km = geo::haversine_km(&order.pickup(), &order.dropoff());
    Ok(pricing::quote(&rule, distance_km, labor_count))
}

/// Frees the driver for new work once their order leaves the active phase.
async fn release_driver(state: &AppState, driver_id: i64) {
    {
        if let Some(mut presence) = state.drivers.get_mut(&driver_id) {
            presence.available = true;
            presence.current_order_id = None;
        }
    }
    if let Err(err) = state.store.set_driver_available(driver_id, true).await {
        warn!(driver_id, error = %err, "failed to persist driver availability");
    }
    proximity::refresh_driver(state, driver_id).await;
}

/// Intake of a new transport request: price an estimate, persist as
/// `pending`, tell the customer its id and offer it to the drivers already
/// in the customer's group.
pub async fn create_order(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    vehicle_type: String,
    pickup: GeoPoint,
    dropoff: GeoPoint,
) -> Result<(), AppError> {
    let customer_id = ctx.principal.user_id();

    let rule = state
        .store
        .pricing_for(&vehicle_type)
        .await?
        .ok_or_else(|| AppError::Validation(format!("unknown vehicle_type: {vehicle_type}")))?;
    let distance_km = geo::haversine_km(&pickup, &dropoff);
    let estimate = pricing::quote(&rule, distance_km, 0);

    let order = state
        .store
        .insert_order(NewOrder {
            customer_id,
            vehicle_type,
            pickup,
            dropoff,
            estimated_price: estimate.total,
        })
        .await?;
    record_transition(state, OrderStatus::Pending);

    state.send_to_customer(
        customer_id,
        ServerEvent::OrderStatusUpdate {
            order_id: order.id,
            status: OrderStatus::Pending,
        },
    );
    offer_to_room(
        state,
        customer_id,
        None,
        &ServerEvent::NewOrderAvailable {
            order: OrderSummary::from_order(&order),
        },
    )
    .await;

    info!(order_id = order.id, customer_id, "order created");
    Ok(())
}

/// Claims a pending order for evaluation. The lock is exclusive; the same
/// driver asking again is a no-op, any other driver gets a conflict.
pub async fn inspect_order(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
) -> Result<(), AppError> {
    let driver_id = ctx.principal.user_id();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    {
        if let Some(lock) = state.inspection_locks.get(&order_id) {
            if lock.driver_id != driver_id {
                return Err(AppError::Conflict(format!(
                    "order {order_id} is being inspected by another driver"
                )));
            }
            return Ok(());
        }
    }

    let order = state
        .store
        .transition_status(
            order_id,
            &[OrderStatus::Pending],
            OrderStatus::Inspecting,
            &actor(Role::Driver, driver_id),
        )
        .await?;
    state.inspection_locks.insert(
        order_id,
        InspectionLock {
            driver_id,
            started_at: Utc::now(),
        },
    );
    record_transition(state, OrderStatus::Inspecting);

    state.send_to_customer(
        order.customer_id,
        ServerEvent::OrderInspectionStarted {
            order_id,
            driver_id,
        },
    );
    notify_room(
        state,
        order.customer_id,
        Some(ctx.conn_id),
        &ServerEvent::OrderLockedForInspection { order_id },
    );

    info!(order_id, driver_id, "inspection started");
    Ok(())
}

/// Releases an inspection claim and offers the order again.
pub async fn stop_inspecting_order(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
) -> Result<(), AppError> {
    let driver_id = ctx.principal.user_id();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    let owns_lock = state
        .inspection_locks
        .get(&order_id)
        .map(|lock| lock.driver_id == driver_id)
        .unwrap_or(false);
    if !owns_lock {
        return Err(AppError::Conflict(format!(
            "driver {driver_id} is not inspecting order {order_id}"
        )));
    }

    let order = state
        .store
        .transition_status(
            order_id,
            &[OrderStatus::Inspecting],
            OrderStatus::Pending,
            &actor(Role::Driver, driver_id),
        )
        .await?;
    state.inspection_locks.remove(&order_id);
    record_transition(state, OrderStatus::Pending);

    state.send_to_customer(
        order.customer_id,
        ServerEvent::OrderInspectionStopped { order_id },
    );
    offer_to_room(
        state,
        order.customer_id,
        Some(ctx.conn_id),
        &ServerEvent::NewOrderAvailable {
            order: OrderSummary::from_order(&order),
        },
    )
    .await;

    info!(order_id, driver_id, "inspection stopped");
    Ok(())
}

/// A driver takes the order at a proposed crew size. Prices the proposal,
/// moves the order to awaiting-customer and opens the 60 s approval window.
pub async fn accept_order_with_labor(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
    labor_count: u32,
) -> Result<(), AppError> {
    let driver_id = ctx.principal.user_id();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    if state.pending_approvals.contains_key(&order_id) {
        return Err(AppError::Conflict(format!(
            "order {order_id} is already awaiting a customer decision"
        )));
    }

    let order = require_order(state, order_id).await?;
    if order.status == OrderStatus::DriverAcceptedAwaitingCustomer {
        return Err(AppError::Conflict(format!(
            "order {order_id} is already awaiting a customer decision"
        )));
    }
    if !order.status.is_acceptable() {
        return Err(AppError::Conflict(format!(
            "order {order_id} is {}, cannot be accepted",
            order.status
        )));
    }
    {
        if let Some(lock) = state.inspection_locks.get(&order_id) {
            if lock.driver_id != driver_id {
                return Err(AppError::Conflict(format!(
                    "order {order_id} is being inspected by another driver"
                )));
            }
        }
    }

    let quote = order_quote(state, &order, labor_count).await?;

    let order = state
        .store
        .transition_status(
            order_id,
            &[OrderStatus::Pending, OrderStatus::Inspecting],
            OrderStatus::DriverAcceptedAwaitingCustomer,
            &actor(Role::Driver, driver_id),
        )
        .await?;
    record_transition(state, OrderStatus::DriverAcceptedAwaitingCustomer);
    state
        .inspection_locks
        .remove_if(&order_id, |_, lock| lock.driver_id == driver_id);

    state.pending_approvals.insert(
        order_id,
        PendingApproval {
            driver_id,
            driver_conn: ctx.conn_id,
            customer_id: order.customer_id,
            labor_count,
            proposed_price: quote.total,
            started_at: Utc::now(),
        },
    );

    let tick_state = Arc::clone(state);
    let tick_conn = ctx.conn_id;
    let expiry_state = Arc::clone(state);
    state.timers.schedule_countdown(
        order_id,
        APPROVAL_WINDOW_SECS,
        move |remaining_secs| {
            tick_state.send_to_conn(
                &tick_conn,
                ServerEvent::PriceCountdown {
                    order_id,
                    remaining_secs,
                },
            );
        },
        async move {
            approval_timeout(&expiry_state, order_id).await;
        },
    );

    let driver = driver_info(state, driver_id).await;
    state.send_to_customer(
        order.customer_id,
        ServerEvent::PriceConfirmationRequested {
            order_id,
            final_price: quote.total,
            original_price: order.original_price,
            difference: pricing::round_money(quote.total - order.original_price),
            labor_count,
            driver,
            breakdown: quote.breakdown,
            timeout_secs: APPROVAL_WINDOW_SECS,
        },
    );

    info!(
        order_id,
        driver_id,
        labor_count,
        price = quote.total,
        "price proposal sent"
    );
    Ok(())
}

/// Re-pushes an open proposal to the customer with the window's remaining
/// time. Changes nothing.
pub async fn confirm_price_with_customer(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
) -> Result<(), AppError> {
    let driver_id = ctx.principal.user_id();

    let approval = state
        .pending_approvals
        .get(&order_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| {
            AppError::NotFound(format!("no pending price confirmation for order {order_id}"))
        })?;
    if approval.driver_id != driver_id {
        return Err(AppError::Conflict(
            "price confirmation belongs to another driver".into(),
        ));
    }

    let elapsed = (Utc::now() - approval.started_at)
        .num_seconds()
        .clamp(0, APPROVAL_WINDOW_SECS as i64) as u64;
    let remaining = APPROVAL_WINDOW_SECS - elapsed;

    let order = require_order(state, order_id).await?;
    let quote = order_quote(state, &order, approval.labor_count).await?;
    let driver = driver_info(state, driver_id).await;

    state.send_to_customer(
        approval.customer_id,
        ServerEvent::PriceConfirmationRequested {
            order_id,
            final_price: approval.proposed_price,
            original_price: order.original_price,
            difference: pricing::round_money(approval.proposed_price - order.original_price),
            labor_count: approval.labor_count,
            driver,
            breakdown: quote.breakdown,
            timeout_secs: remaining,
        },
    );
    Ok(())
}

/// The customer's answer to a proposal. Resolution is exactly-once: the
/// approval entry is removed before anything else happens, and whoever
/// fails to remove it (this handler, a duplicate, or the timeout) backs
/// off.
pub async fn price_confirmation_response(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
    is_accepted: bool,
) -> Result<(), AppError> {
    let customer_id = ctx.principal.user_id();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    {
        let Some(approval) = state.pending_approvals.get(&order_id) else {
            return Err(AppError::Conflict(format!(
                "price confirmation for order {order_id} is already resolved"
            )));
        };
        if approval.customer_id != customer_id {
            return Err(AppError::Conflict(
                "price confirmation belongs to another customer".into(),
            ));
        }
    }

    let Some((_, approval)) = state.pending_approvals.remove(&order_id) else {
        return Err(AppError::Conflict(format!(
            "price confirmation for order {order_id} is already resolved"
        )));
    };
    state.timers.cancel_countdown(order_id);

    if is_accepted {
        resolve_accept(state, order_id, approval).await
    } else {
        resolve_reject(state, order_id, approval).await
    }
}

async fn resolve_accept(
    state: &Arc<AppState>,
    order_id: i64,
    approval: PendingApproval,
) -> Result<(), AppError> {
    state
        .metrics
        .approval_resolutions_total
        .with_label_values(&["accepted"])
        .inc();

    state
        .store
        .approve_price(
            order_id,
            approval.driver_id,
            approval.labor_count,
            approval.proposed_price,
            &actor(Role::Customer, approval.customer_id),
        )
        .await?;
    record_transition(state, OrderStatus::CustomerPriceApproved);

    {
        if let Some(mut presence) = state.drivers.get_mut(&approval.driver_id) {
            presence.available = false;
            presence.current_order_id = Some(order_id);
        }
    }
    if let Err(err) = state
        .store
        .set_driver_available(approval.driver_id, false)
        .await
    {
        warn!(driver_id = approval.driver_id, error = %err, "failed to persist driver availability");
    }

    state.send_to_driver(
        approval.driver_id,
        ServerEvent::PriceAcceptedByCustomer {
            order_id,
            final_price: approval.proposed_price,
        },
    );

    // the group collapses onto the winning driver
    let winner_conn = state
        .drivers
        .get(&approval.driver_id)
        .map(|presence| presence.conn_id);
    {
        let mut rooms = state.rooms_mut();
        let members: HashSet<Uuid> = winner_conn.into_iter().collect();
        rooms.set_members(approval.customer_id, members);
    }
    state.sync_presence_gauges();

    let order = state
        .store
        .transition_status(
            order_id,
            &[OrderStatus::CustomerPriceApproved],
            OrderStatus::DriverGoingToPickup,
            "system",
        )
        .await?;
    record_transition(state, OrderStatus::DriverGoingToPickup);

    let update = ServerEvent::OrderStatusUpdate {
        order_id,
        status: OrderStatus::DriverGoingToPickup,
    };
    state.send_to_customer(order.customer_id, update.clone());
    state.send_to_driver(approval.driver_id, update);

    state
        .timers
        .start_location_pushes(order_id, location_push_loop(Arc::clone(state), order_id));

    info!(
        order_id,
        driver_id = approval.driver_id,
        price = approval.proposed_price,
        "price approved"
    );
    Ok(())
}

async fn resolve_reject(
    state: &Arc<AppState>,
    order_id: i64,
    approval: PendingApproval,
) -> Result<(), AppError> {
    state
        .metrics
        .approval_resolutions_total
        .with_label_values(&["rejected"])
        .inc();

    state.send_to_driver(
        approval.driver_id,
        ServerEvent::PriceRejectedByCustomer { order_id },
    );

    {
        let mut rooms = state.rooms_mut();
        rooms.set_members(approval.customer_id, HashSet::new());
    }
    state.sync_presence_gauges();

    // a rejected price ends the order outright; no re-offer. The rejected
    // status is a waypoint with no exit edge, so both hops go in one
    // transaction.
    state
        .store
        .transition_status_through(
            order_id,
            &[OrderStatus::DriverAcceptedAwaitingCustomer],
            OrderStatus::CustomerPriceRejected,
            OrderStatus::Cancelled,
            &actor(Role::Customer, approval.customer_id),
        )
        .await?;
    record_transition(state, OrderStatus::CustomerPriceRejected);
    record_transition(state, OrderStatus::Cancelled);

    let update = ServerEvent::OrderStatusUpdate {
        order_id,
        status: OrderStatus::Cancelled,
    };
    state.send_to_customer(approval.customer_id, update.clone());
    state.send_to_driver(approval.driver_id, update);

    info!(order_id, driver_id = approval.driver_id, "price rejected");
    Ok(())
}

/// Timer re-entry at the end of the approval window. Removing the entry
/// first makes this a no-op whenever the customer's response won the race.
pub async fn approval_timeout(state: &Arc<AppState>, order_id: i64) {
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    let Some((_, approval)) = state.pending_approvals.remove(&order_id) else {
        return;
    };
    state
        .metrics
        .approval_resolutions_total
        .with_label_values(&["timeout"])
        .inc();

    // the timeout status is a waypoint with no exit edge, so both hops go
    // in one transaction and the order lands back on `pending` or not at all
    let reopened = state
        .store
        .transition_status_through(
            order_id,
            &[OrderStatus::DriverAcceptedAwaitingCustomer],
            OrderStatus::CustomerConfirmationTimeout,
            OrderStatus::Pending,
            "system",
        )
        .await;
    if let Err(err) = reopened {
        warn!(order_id, error = %err, "approval window expired but order had moved on");
        return;
    }
    record_transition(state, OrderStatus::CustomerConfirmationTimeout);
    record_transition(state, OrderStatus::Pending);

    let timeout = ServerEvent::PriceConfirmationTimeout { order_id };
    state.send_to_driver(approval.driver_id, timeout.clone());
    state.send_to_customer(approval.customer_id, timeout);

    // the unanswered driver leaves the group; everyone else may claim again
    let driver_conn = state
        .drivers
        .get(&approval.driver_id)
        .map(|presence| presence.conn_id)
        .unwrap_or(approval.driver_conn);
    {
        let mut rooms = state.rooms_mut();
        let mut members: HashSet<Uuid> =
            rooms.members_of(approval.customer_id).into_iter().collect();
        members.remove(&driver_conn);
        rooms.set_members(approval.customer_id, members);
    }
    state.sync_presence_gauges();

    info!(
        order_id,
        driver_id = approval.driver_id,
        "price confirmation timed out"
    );
}

/// First half of cancellation: compute the fee for the current status and
/// hand the customer a confirmation code. The status does not change until
/// the code comes back.
pub async fn cancel_order(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
) -> Result<(), AppError> {
    let customer_id = ctx.principal.user_id();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    let order = require_order(state, order_id).await?;
    require_owned_by_customer(&order, customer_id)?;
    if order.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "order {order_id} is already finalized"
        )));
    }
    if !order.status.is_cancellable() {
        return Err(AppError::Conflict(format!(
            "order {order_id} is {}, cannot be cancelled",
            order.status
        )));
    }

    let settings = state.settings.current(&state.store).await?;
    let percent = state
        .store
        .cancellation_fee_percent(order.status, settings.default_cancellation_fee_percent)
        .await?;
    let fee = pricing::round_money(order.total_price * percent / 100.0)
        .clamp(0.0, order.total_price);

    let confirm_code = rand::thread_rng().gen_range(1000..=9999).to_string();
    state
        .store
        .set_cancellation_request(order_id, &confirm_code, fee)
        .await?;

    state.send_to_customer(
        customer_id,
        ServerEvent::CancelOrderConfirmationRequired {
            order_id,
            confirm_code,
            cancellation_fee: fee,
        },
    );

    info!(order_id, customer_id, fee, "cancellation requested");
    Ok(())
}

/// Second half: the code must match, the status must still allow it, and
/// the code burns on use so a replay cannot charge twice.
pub async fn cancel_order_with_code(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
    confirm_code: &str,
) -> Result<(), AppError> {
    let customer_id = ctx.principal.user_id();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    let order = require_order(state, order_id).await?;
    require_owned_by_customer(&order, customer_id)?;
    if order.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "order {order_id} is already finalized"
        )));
    }
    if order.cancellation_confirm_code.as_deref() != Some(confirm_code) {
        return Err(AppError::Validation(
            "confirmation code is not valid".into(),
        ));
    }

    let order = state
        .store
        .finalize_cancellation(order_id, &actor(Role::Customer, customer_id))
        .await?;
    record_transition(state, OrderStatus::Cancelled);

    state.inspection_locks.remove(&order_id);
    if state.pending_approvals.remove(&order_id).is_some() {
        state.timers.cancel_countdown(order_id);
        state
            .metrics
            .approval_resolutions_total
            .with_label_values(&["cancelled"])
            .inc();
    }
    state.timers.stop_location_pushes(order_id);

    let update = ServerEvent::OrderStatusUpdate {
        order_id,
        status: OrderStatus::Cancelled,
    };
    state.send_to_customer(customer_id, update.clone());
    notify_room(state, customer_id, None, &update);
    if let Some(driver_id) = order.driver_id {
        state.send_to_driver(driver_id, update);
        release_driver(state, driver_id).await;
    }

    info!(order_id, customer_id, "order cancelled");
    Ok(())
}

/// The assigned driver announces they are en route; pure notification.
pub async fn driver_started_navigation(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
) -> Result<(), AppError> {
    let driver_id = ctx.principal.user_id();
    let order = require_order(state, order_id).await?;

    if order.driver_id != Some(driver_id) {
        return Err(AppError::Conflict(
            "order is assigned to another driver".into(),
        ));
    }
    if order.status != OrderStatus::DriverGoingToPickup {
        return Err(AppError::Conflict(format!(
            "order {order_id} is {}, navigation does not apply",
            order.status
        )));
    }

    state.send_to_customer(
        order.customer_id,
        ServerEvent::OrderPhaseUpdate {
            order_id,
            current_phase: "navigating_to_pickup".to_string(),
        },
    );
    Ok(())
}

/// Delivery progression. Which steps an actor may take is fixed by the
/// transition table; everything else (negotiation, cancellation,
/// inspection) has its own entry point and is refused here.
pub async fn update_order_status(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    order_id: i64,
    new_status: OrderStatus,
) -> Result<(), AppError> {
    let user_id = ctx.principal.user_id();
    let role = ctx.principal.role();
    let serial = state.order_guard(order_id);
    let _serial = serial.lock().await;

    let order = require_order(state, order_id).await?;
    match role {
        Role::Driver if order.driver_id != Some(user_id) => {
            return Err(AppError::Auth("order is assigned to another driver".into()));
        }
        Role::Customer if order.customer_id != user_id => {
            return Err(AppError::Auth("order belongs to another customer".into()));
        }
        _ => {}
    }
    if !order.status.can_progress_to(new_status, role) {
        return Err(AppError::Conflict(format!(
            "cannot move order {order_id} from {} to {new_status}",
            order.status
        )));
    }

    let order = state
        .store
        .transition_status(order_id, &[order.status], new_status, &actor(role, user_id))
        .await?;
    record_transition(state, new_status);

    let update = ServerEvent::OrderStatusUpdate {
        order_id,
        status: new_status,
    };
    state.send_to_customer(order.customer_id, update.clone());
    if let Some(driver_id) = order.driver_id {
        state.send_to_driver(driver_id, update);
    }

    if new_status == OrderStatus::Delivered {
        state.timers.stop_location_pushes(order_id);
        if let Some(driver_id) = order.driver_id {
            release_driver(state, driver_id).await;
        }
    }

    info!(order_id, status = %new_status, by = %actor(role, user_id), "order progressed");
    Ok(())
}

/// Reverts `inspecting` orders whose lock has sat past the age limit.
/// Returns how many locks were expired.
pub async fn expire_stale_locks(state: &AppState) -> usize {
    let now = Utc::now();
    let expired: Vec<(i64, i64)> = state
        .inspection_locks
        .iter()
        .filter(|entry| {
            (now - entry.value().started_at).num_seconds() > LOCK_MAX_AGE_SECS
        })
        .map(|entry| (*entry.key(), entry.value().driver_id))
        .collect();

    let mut reverted = 0;
    for (order_id, driver_id) in expired {
        state
            .inspection_locks
            .remove_if(&order_id, |_, lock| lock.driver_id == driver_id);

        match state
            .store
            .transition_status(
                order_id,
                &[OrderStatus::Inspecting],
                OrderStatus::Pending,
                "system",
            )
            .await
        {
            Ok(order) => {
                record_transition(state, OrderStatus::Pending);
                state.send_to_customer(
                    order.customer_id,
                    ServerEvent::OrderInspectionStopped { order_id },
                );
                offer_to_room(
                    state,
                    order.customer_id,
                    None,
                    &ServerEvent::NewOrderAvailable {
                        order: OrderSummary::from_order(&order),
                    },
                )
                .await;
                warn!(order_id, driver_id, "expired stale inspection lock");
                reverted += 1;
            }
            Err(_) => {
                // the order moved on while locked; dropping the lock is enough
            }
        }
    }
    reverted
}

/// Pushes the driver's position and a straight-line ETA to the customer
/// until the order leaves the en-route phases. The target flips from
/// pickup to dropoff once the cargo is on board.
async fn location_push_loop(state: Arc<AppState>, order_id: i64) {
    let mut ticker = time::interval(Duration::from_secs(LOCATION_PUSH_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let order = match state.store.fetch_order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => break,
            Err(err) => {
                warn!(order_id, error = %err, "location push skipped, store unavailable");
                continue;
            }
        };
        let target = match order.status {
            OrderStatus::DriverGoingToPickup => order.pickup(),
            OrderStatus::PickupCompleted | OrderStatus::InTransit => order.dropoff(),
            _ => break,
        };
        let Some(driver_id) = order.driver_id else {
            break;
        };
        let Some(location) = state.drivers.get(&driver_id).and_then(|p| p.location) else {
            continue;
        };

        state.send_to_customer(
            order.customer_id,
            ServerEvent::DriverLocationUpdate {
                order_id,
                location,
                eta_minutes: geo::eta_minutes(&location, &target),
                target,
            },
        );
    }
}
