use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use haul_dispatch::auth::Principal;
use haul_dispatch::config::Config;
use haul_dispatch::engine::{dispatch, presence};
use haul_dispatch::error::AppError;
use haul_dispatch::models::order::OrderStatus;
use haul_dispatch::models::presence::GeoPoint;
use haul_dispatch::protocol::ServerEvent;
use haul_dispatch::state::{AppState, ConnCtx, ConnectionHandle};
use haul_dispatch::store::Store;

const DEPOT: GeoPoint = GeoPoint {
    lat: 40.98,
    lon: 29.03,
};

async fn harness() -> Arc<AppState> {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    Arc::new(AppState::new(Config::for_tests(), store))
}

fn open_conn(
    state: &AppState,
    principal: Principal,
) -> (ConnCtx, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn_id = Uuid::new_v4();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40_000);
    state.conns.insert(
        conn_id,
        ConnectionHandle {
            tx,
            principal,
            addr,
            kill: Arc::new(Notify::new()),
        },
    );
    (
        ConnCtx {
            conn_id,
            principal,
            addr,
        },
        rx,
    )
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A roster-approved van driver, connected and located at the depot.
async fn connect_driver(
    state: &Arc<AppState>,
    id: i64,
) -> (ConnCtx, mpsc::UnboundedReceiver<ServerEvent>) {
    state
        .store
        .upsert_driver(id, &format!("Driver {id}"), "van", 4.8, true, true)
        .await
        .unwrap();
    let (ctx, mut rx) = open_conn(state, Principal::Driver(id));
    presence::driver_connect(state, &ctx).await;
    presence::update_driver_location(state, id, DEPOT, None).await;
    drain(&mut rx);
    (ctx, rx)
}

async fn connect_customer(
    state: &Arc<AppState>,
    id: i64,
) -> (ConnCtx, mpsc::UnboundedReceiver<ServerEvent>) {
    let (ctx, mut rx) = open_conn(state, Principal::Customer(id));
    presence::customer_connect(state, &ctx);
    presence::update_customer_location(state, id, DEPOT).await;
    drain(&mut rx);
    (ctx, rx)
}

/// Creates a van order at the depot and returns its id from the status
/// event the customer receives.
async fn place_order(
    state: &Arc<AppState>,
    customer: &ConnCtx,
    customer_rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
) -> i64 {
    dispatch::create_order(state, customer, "van".to_string(), DEPOT, DEPOT)
        .await
        .unwrap();
    drain(customer_rx)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::OrderStatusUpdate {
                order_id,
                status: OrderStatus::Pending,
            } => Some(order_id),
            _ => None,
        })
        .expect("customer should be told the new order is pending")
}

async fn order_status(state: &AppState, order_id: i64) -> OrderStatus {
    state
        .store
        .fetch_order(order_id)
        .await
        .unwrap()
        .expect("order should exist")
        .status
}

#[tokio::test]
async fn create_order_broadcasts_to_nearby_drivers() {
    let state = harness().await;
    let (_driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);

    dispatch::create_order(&state, &customer, "van".to_string(), DEPOT, DEPOT)
        .await
        .unwrap();

    let customer_events = drain(&mut customer_rx);
    let order_id = customer_events
        .iter()
        .find_map(|event| match event {
            ServerEvent::OrderStatusUpdate {
                order_id,
                status: OrderStatus::Pending,
            } => Some(*order_id),
            _ => None,
        })
        .expect("customer should see the order as pending");

    let offered = drain(&mut driver_rx).into_iter().find_map(|event| match event {
        ServerEvent::NewOrderAvailable { order } => Some(order),
        _ => None,
    });
    let offered = offered.expect("drivers in the group should be offered the order");
    assert_eq!(offered.order_id, order_id);
    assert_eq!(offered.vehicle_type, "van");
    assert_eq!(offered.estimated_price, 300.0);

    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn drivers_gone_unavailable_are_not_offered_new_orders() {
    let state = harness().await;
    let (_first, mut first_rx) = connect_driver(&state, 5).await;
    let (_second, mut second_rx) = connect_driver(&state, 6).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut first_rx);
    drain(&mut second_rx);

    // the roster flips while both drivers still sit in the customer's group
    state.store.set_driver_available(5, false).await.unwrap();
    assert_eq!(state.rooms().members_of(31).len(), 2);

    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    assert!(
        !drain(&mut first_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::NewOrderAvailable { .. })),
        "a driver the store no longer clears must not be offered work"
    );
    let offered = drain(&mut second_rx).into_iter().find_map(|event| match event {
        ServerEvent::NewOrderAvailable { order } => Some(order.order_id),
        _ => None,
    });
    assert_eq!(offered, Some(order_id));
}

#[tokio::test]
async fn create_order_rejects_unknown_vehicle_types() {
    let state = harness().await;
    let (customer, _customer_rx) = connect_customer(&state, 31).await;

    let err = dispatch::create_order(&state, &customer, "hoverboard".to_string(), DEPOT, DEPOT)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn inspection_is_exclusive_to_one_driver() {
    let state = harness().await;
    let (first, mut first_rx) = connect_driver(&state, 5).await;
    let (second, mut second_rx) = connect_driver(&state, 6).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut first_rx);
    drain(&mut second_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;
    drain(&mut first_rx);
    drain(&mut second_rx);

    dispatch::inspect_order(&state, &first, order_id).await.unwrap();
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Inspecting);
    assert!(
        drain(&mut customer_rx).iter().any(|event| matches!(
            event,
            ServerEvent::OrderInspectionStarted { driver_id: 5, .. }
        ))
    );
    assert!(
        drain(&mut second_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::OrderLockedForInspection { .. }))
    );

    // the same driver asking again is a no-op, anyone else is refused
    dispatch::inspect_order(&state, &first, order_id).await.unwrap();
    let err = dispatch::inspect_order(&state, &second, order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = dispatch::stop_inspecting_order(&state, &second, order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    dispatch::stop_inspecting_order(&state, &first, order_id)
        .await
        .unwrap();
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);
    assert!(state.inspection_locks.is_empty());
    assert!(
        drain(&mut second_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::NewOrderAvailable { .. }))
    );
}

#[tokio::test]
async fn accepting_sends_the_customer_a_priced_proposal() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 4)
        .await
        .unwrap();

    assert_eq!(
        order_status(&state, order_id).await,
        OrderStatus::DriverAcceptedAwaitingCustomer
    );
    assert!(state.pending_approvals.contains_key(&order_id));
    assert_eq!(state.timers.active_countdowns(), 1);

    let events = drain(&mut customer_rx);
    let Some(ServerEvent::PriceConfirmationRequested {
        final_price,
        original_price,
        difference,
        labor_count,
        driver: proposer,
        breakdown,
        timeout_secs,
        ..
    }) = events
        .into_iter()
        .find(|event| matches!(event, ServerEvent::PriceConfirmationRequested { .. }))
    else {
        panic!("customer should receive a price confirmation request");
    };
    assert_eq!(final_price, 400.0);
    assert_eq!(original_price, 300.0);
    assert_eq!(difference, 100.0);
    assert_eq!(labor_count, 4);
    assert_eq!(timeout_secs, 60);
    assert_eq!(proposer.name, "Driver 5");
    assert_eq!(breakdown.labor_component, 400.0);
    assert_eq!(breakdown.base_price, 300.0);

    // the countdown's first tick reaches the proposing driver
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain(&mut driver_rx).iter().any(|event| matches!(
        event,
        ServerEvent::PriceCountdown {
            remaining_secs: 60,
            ..
        }
    )));
}

#[tokio::test]
async fn accept_is_refused_while_another_proposal_is_open() {
    let state = harness().await;
    let (first, mut first_rx) = connect_driver(&state, 5).await;
    let (second, mut second_rx) = connect_driver(&state, 6).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut first_rx);
    drain(&mut second_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &first, order_id, 1)
        .await
        .unwrap();
    let err = dispatch::accept_order_with_labor(&state, &second, order_id, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(
        state.pending_approvals.get(&order_id).unwrap().driver_id,
        5
    );
}

#[tokio::test]
async fn concurrent_accepts_resolve_to_one_winner() {
    let state = harness().await;
    let (first, mut first_rx) = connect_driver(&state, 5).await;
    let (second, mut second_rx) = connect_driver(&state, 6).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut first_rx);
    drain(&mut second_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    let (a, b) = tokio::join!(
        dispatch::accept_order_with_labor(&state, &first, order_id, 1),
        dispatch::accept_order_with_labor(&state, &second, order_id, 2),
    );

    assert_eq!(
        [&a, &b].iter().filter(|result| result.is_ok()).count(),
        1,
        "exactly one driver may win the order"
    );
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser.unwrap_err(), AppError::Conflict(_)));
    assert_eq!(
        order_status(&state, order_id).await,
        OrderStatus::DriverAcceptedAwaitingCustomer
    );
    assert_eq!(state.pending_approvals.len(), 1);
}

#[tokio::test]
async fn customer_acceptance_assigns_the_driver() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 4)
        .await
        .unwrap();
    drain(&mut driver_rx);

    dispatch::price_confirmation_response(&state, &customer, order_id, true)
        .await
        .unwrap();

    let order = state.store.fetch_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::DriverGoingToPickup);
    assert_eq!(order.driver_id, Some(5));
    assert_eq!(order.total_price, 400.0);
    assert_eq!(order.labor_count, 4);

    let driver_events = drain(&mut driver_rx);
    assert!(driver_events.iter().any(|event| matches!(
        event,
        ServerEvent::PriceAcceptedByCustomer {
            final_price,
            ..
        } if *final_price == 400.0
    )));
    assert!(driver_events.iter().any(|event| matches!(
        event,
        ServerEvent::OrderStatusUpdate {
            status: OrderStatus::DriverGoingToPickup,
            ..
        }
    )));

    let presence = state.drivers.get(&5).unwrap();
    assert!(!presence.available);
    assert_eq!(presence.current_order_id, Some(order_id));
    drop(presence);

    // the proximity group collapses onto the winning driver
    assert_eq!(state.rooms().members_of(31), vec![driver.conn_id]);
    assert!(state.pending_approvals.is_empty());
    assert_eq!(state.timers.active_countdowns(), 0);
}

#[tokio::test]
async fn customer_rejection_cancels_the_order() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 2)
        .await
        .unwrap();
    drain(&mut driver_rx);

    dispatch::price_confirmation_response(&state, &customer, order_id, false)
        .await
        .unwrap();

    assert_eq!(order_status(&state, order_id).await, OrderStatus::Cancelled);
    assert!(state.pending_approvals.is_empty());
    assert!(
        drain(&mut driver_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::PriceRejectedByCustomer { .. }))
    );
    assert!(drain(&mut customer_rx).iter().any(|event| matches!(
        event,
        ServerEvent::OrderStatusUpdate {
            status: OrderStatus::Cancelled,
            ..
        }
    )));
    assert!(state.rooms().members_of(31).is_empty());

    // the rejection waypoint is recorded but never left as the status
    let history = state.store.fetch_status_history(order_id).await.unwrap();
    let trail: Vec<&str> = history.iter().map(|change| change.new_status.as_str()).collect();
    assert_eq!(
        trail,
        vec![
            "pending",
            "driver_accepted_awaiting_customer",
            "customer_price_rejected",
            "cancelled",
        ]
    );
}

#[tokio::test]
async fn approval_timeout_reopens_the_order() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 2)
        .await
        .unwrap();
    drain(&mut driver_rx);
    drain(&mut customer_rx);

    dispatch::approval_timeout(&state, order_id).await;

    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);
    assert!(state.pending_approvals.is_empty());
    assert!(
        drain(&mut driver_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::PriceConfirmationTimeout { .. }))
    );
    assert!(
        drain(&mut customer_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::PriceConfirmationTimeout { .. }))
    );
    // the unanswered driver is removed from the group
    assert!(state.rooms().members_of(31).is_empty());

    // firing again after resolution changes nothing
    dispatch::approval_timeout(&state, order_id).await;
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);
    assert!(drain(&mut customer_rx).is_empty());

    // the timeout waypoint is recorded but the order lands back on pending
    let history = state.store.fetch_status_history(order_id).await.unwrap();
    let trail: Vec<&str> = history.iter().map(|change| change.new_status.as_str()).collect();
    assert_eq!(
        trail,
        vec![
            "pending",
            "driver_accepted_awaiting_customer",
            "customer_confirmation_timeout",
            "pending",
        ]
    );
}

#[tokio::test]
async fn late_and_duplicate_responses_are_refused() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 2)
        .await
        .unwrap();
    dispatch::approval_timeout(&state, order_id).await;

    let err = dispatch::price_confirmation_response(&state, &customer, order_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);

    // a fresh proposal resolves once and only once
    dispatch::accept_order_with_labor(&state, &driver, order_id, 2)
        .await
        .unwrap();
    dispatch::price_confirmation_response(&state, &customer, order_id, true)
        .await
        .unwrap();
    let err = dispatch::price_confirmation_response(&state, &customer, order_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(
        order_status(&state, order_id).await,
        OrderStatus::DriverGoingToPickup
    );
}

#[tokio::test]
async fn cancellation_requires_the_confirmation_code() {
    let state = harness().await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::cancel_order(&state, &customer, order_id).await.unwrap();

    let events = drain(&mut customer_rx);
    let Some(ServerEvent::CancelOrderConfirmationRequired {
        confirm_code,
        cancellation_fee,
        ..
    }) = events
        .into_iter()
        .find(|event| matches!(event, ServerEvent::CancelOrderConfirmationRequired { .. }))
    else {
        panic!("customer should receive a cancellation code");
    };
    assert_eq!(cancellation_fee, 0.0);
    assert_eq!(confirm_code.len(), 4);
    // asking for the code does not yet cancel anything
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);

    let err = dispatch::cancel_order_with_code(&state, &customer, order_id, "0000")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);

    dispatch::cancel_order_with_code(&state, &customer, order_id, &confirm_code)
        .await
        .unwrap();
    let order = state.store.fetch_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.cancellation_confirm_code, None);
    assert_eq!(order.cancellation_fee, Some(0.0));

    // the code burns on use
    let err = dispatch::cancel_order_with_code(&state, &customer, order_id, &confirm_code)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn cancellation_fee_follows_the_status_tier() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 4)
        .await
        .unwrap();
    drain(&mut driver_rx);
    drain(&mut customer_rx);

    dispatch::cancel_order(&state, &customer, order_id).await.unwrap();

    let events = drain(&mut customer_rx);
    let Some(ServerEvent::CancelOrderConfirmationRequired {
        confirm_code,
        cancellation_fee,
        ..
    }) = events
        .into_iter()
        .find(|event| matches!(event, ServerEvent::CancelOrderConfirmationRequired { .. }))
    else {
        panic!("customer should receive a cancellation code");
    };
    // 25 percent of the still-unapproved 300.0 estimate
    assert_eq!(cancellation_fee, 75.0);

    dispatch::cancel_order_with_code(&state, &customer, order_id, &confirm_code)
        .await
        .unwrap();
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Cancelled);
    assert!(state.pending_approvals.is_empty());
    assert_eq!(state.timers.active_countdowns(), 0);

    // drivers still in the group hear the cancellation
    assert!(drain(&mut driver_rx).iter().any(|event| matches!(
        event,
        ServerEvent::OrderStatusUpdate {
            status: OrderStatus::Cancelled,
            ..
        }
    )));
}

#[tokio::test]
async fn delivery_progresses_through_the_transition_table() {
    let state = harness().await;
    let (driver, mut driver_rx) = connect_driver(&state, 5).await;
    let (stranger, _stranger_rx) = connect_driver(&state, 6).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut driver_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::accept_order_with_labor(&state, &driver, order_id, 1)
        .await
        .unwrap();
    dispatch::price_confirmation_response(&state, &customer, order_id, true)
        .await
        .unwrap();

    let err = dispatch::driver_started_navigation(&state, &stranger, order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    dispatch::driver_started_navigation(&state, &driver, order_id)
        .await
        .unwrap();
    assert!(drain(&mut customer_rx).iter().any(|event| matches!(
        event,
        ServerEvent::OrderPhaseUpdate { current_phase, .. }
            if current_phase == "navigating_to_pickup"
    )));

    // stages cannot be skipped
    let err = dispatch::update_order_status(&state, &driver, order_id, OrderStatus::InTransit)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    // the customer cannot drive the delivery side
    let err =
        dispatch::update_order_status(&state, &customer, order_id, OrderStatus::PickupCompleted)
            .await
            .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    for status in [
        OrderStatus::PickupCompleted,
        OrderStatus::InTransit,
        OrderStatus::Delivered,
    ] {
        dispatch::update_order_status(&state, &driver, order_id, status)
            .await
            .unwrap();
        assert_eq!(order_status(&state, order_id).await, status);
    }

    // delivery releases the driver for new work
    let presence = state.drivers.get(&5).unwrap();
    assert!(presence.available);
    assert_eq!(presence.current_order_id, None);
    drop(presence);

    // payment confirmation belongs to the customer
    let err =
        dispatch::update_order_status(&state, &driver, order_id, OrderStatus::PaymentCompleted)
            .await
            .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    dispatch::update_order_status(&state, &customer, order_id, OrderStatus::PaymentCompleted)
        .await
        .unwrap();

    let history = state.store.fetch_status_history(order_id).await.unwrap();
    let trail: Vec<&str> = history.iter().map(|change| change.new_status.as_str()).collect();
    assert_eq!(
        trail,
        vec![
            "pending",
            "driver_accepted_awaiting_customer",
            "customer_price_approved",
            "driver_going_to_pickup",
            "pickup_completed",
            "in_transit",
            "delivered",
            "payment_completed",
        ]
    );
}

#[tokio::test]
async fn stale_inspection_locks_expire_back_to_pending() {
    let state = harness().await;
    let (first, mut first_rx) = connect_driver(&state, 5).await;
    let (_second, mut second_rx) = connect_driver(&state, 6).await;
    let (customer, mut customer_rx) = connect_customer(&state, 31).await;
    drain(&mut first_rx);
    drain(&mut second_rx);
    let order_id = place_order(&state, &customer, &mut customer_rx).await;

    dispatch::inspect_order(&state, &first, order_id).await.unwrap();
    drain(&mut second_rx);
    drain(&mut customer_rx);

    // a fresh lock is left alone
    assert_eq!(dispatch::expire_stale_locks(&state).await, 0);

    state
        .inspection_locks
        .get_mut(&order_id)
        .unwrap()
        .started_at -= chrono::Duration::seconds(301);

    assert_eq!(dispatch::expire_stale_locks(&state).await, 1);
    assert_eq!(order_status(&state, order_id).await, OrderStatus::Pending);
    assert!(state.inspection_locks.is_empty());
    assert!(
        drain(&mut customer_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::OrderInspectionStopped { .. }))
    );
    assert!(
        drain(&mut second_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::NewOrderAvailable { .. }))
    );
}
