use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::engine::{dispatch, presence};
use crate::error::AppError;
use crate::guard;
use crate::models::presence::GeoPoint;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::state::{AppState, ConnCtx, ConnectionHandle};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Authenticates before upgrading; a bad token is a plain 401 and no
/// websocket ever opens. A request that passes auth but cannot be
/// upgraded gets 426.
pub async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let handshake = match state.auth.authenticate(&query.token, query.refresh.as_deref()) {
        Ok(handshake) => handshake,
        Err(err) => return err.into_response(),
    };

    let Some(ws) = ws else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake, addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    handshake: crate::auth::Handshake,
    addr: SocketAddr,
) {
    let principal = handshake.principal;
    let conn_id = Uuid::new_v4();
    let ctx = ConnCtx {
        conn_id,
        principal,
        addr,
    };

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let kill = Arc::new(Notify::new());

    state.conns.insert(
        conn_id,
        ConnectionHandle {
            tx: tx.clone(),
            principal,
            addr,
            kill: Arc::clone(&kill),
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize outbound event");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(ServerEvent::Welcome {
        conn_id,
        role: principal.role(),
        server_time: Utc::now(),
    });
    if let Some(access_token) = handshake.refreshed_access {
        let _ = tx.send(ServerEvent::TokenRefreshed { access_token });
    }

    let mut stats_feed = None;
    match principal.role() {
        Role::Driver => presence::driver_connect(&state, &ctx).await,
        Role::Customer => presence::customer_connect(&state, &ctx),
        Role::Supervisor => {
            let _ = tx.send(ServerEvent::DispatchStats {
                snapshot: state.stats_snapshot(),
            });
            let mut stream = BroadcastStream::new(state.stats_tx.subscribe());
            let feed_tx = tx.clone();
            stats_feed = Some(tokio::spawn(async move {
                while let Some(Ok(event)) = stream.next().await {
                    if feed_tx.send(event).is_err() {
                        break;
                    }
                }
            }));
            info!(supervisor_id = principal.user_id(), "supervisor connected");
        }
    }

    loop {
        tokio::select! {
            _ = kill.notified() => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, &ctx, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(conn_id = %conn_id, error = %err, "websocket read failed");
                    break;
                }
            },
        }
    }

    presence::disconnect(&state, &ctx).await;
    if let Some(feed) = stats_feed {
        feed.abort();
    }
    writer.abort();
}

/// One inbound frame through the guard pipeline and into its handler.
/// Guard rejections and handler errors are reported as events on the same
/// socket; only auth problems terminate a session.
async fn handle_text(state: &Arc<AppState>, ctx: &ConnCtx, text: &str) {
    let user_id = ctx.principal.user_id();
    let started = Instant::now();

    if let Err(err) = state.limiter.check_global(user_id, ctx.addr.ip()) {
        reject(state, ctx, &err);
        return;
    }

    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            state
                .metrics
                .events_rejected_total
                .with_label_values(&["parse"])
                .inc();
            state.send_to_conn(
                &ctx.conn_id,
                ServerEvent::ValidationError {
                    message: format!("malformed event: {err}"),
                },
            );
            return;
        }
    };

    let kind = event.kind();
    state
        .metrics
        .client_events_total
        .with_label_values(&[kind.as_str()])
        .inc();

    if let Err(err) = state.spam.check(user_id, kind, text) {
        reject(state, ctx, &err);
        return;
    }
    if let Err(err) = state.limiter.check_event(user_id, ctx.addr.ip(), kind) {
        reject(state, ctx, &err);
        return;
    }
    if let Err(err) = guard::validate_payload(&event) {
        reject(state, ctx, &err);
        return;
    }

    if let Err(err) = route_event(state, ctx, event).await {
        reject(state, ctx, &err);
    }

    state
        .metrics
        .event_handle_seconds
        .with_label_values(&[kind.as_str()])
        .observe(started.elapsed().as_secs_f64());
}

fn reject(state: &AppState, ctx: &ConnCtx, err: &AppError) {
    state
        .metrics
        .events_rejected_total
        .with_label_values(&[err.kind()])
        .inc();

    let event = match err {
        AppError::RateLimited {
            event,
            retry_after_ms,
            remaining,
        } => ServerEvent::RateLimitExceeded {
            event: (*event).to_string(),
            retry_after_ms: *retry_after_ms,
            remaining: *remaining,
        },
        AppError::Spam { event } => ServerEvent::SpamWarning {
            event: (*event).to_string(),
        },
        AppError::Validation(message) => ServerEvent::ValidationError {
            message: message.clone(),
        },
        other => ServerEvent::Error {
            kind: other.kind().to_string(),
            message: other.public_message(),
        },
    };
    state.send_to_conn(&ctx.conn_id, event);
}

/// Role-gated dispatch table. An event a role may not send is refused
/// without reaching the engine.
async fn route_event(
    state: &Arc<AppState>,
    ctx: &ConnCtx,
    event: ClientEvent,
) -> Result<(), AppError> {
    let role = ctx.principal.role();
    let user_id = ctx.principal.user_id();

    match (event, role) {
        (ClientEvent::LocationUpdate { lat, lon, heading }, Role::Driver) => {
            presence::update_driver_location(state, user_id, GeoPoint { lat, lon }, heading).await;
            Ok(())
        }
        (ClientEvent::AvailabilityUpdate { available }, Role::Driver) => {
            presence::update_driver_availability(state, user_id, available).await;
            Ok(())
        }
        (ClientEvent::DriverGoingOffline, Role::Driver) => {
            presence::driver_going_offline(state, user_id).await;
            Ok(())
        }
        (ClientEvent::CustomerLocationUpdate { lat, lon }, Role::Customer) => {
            presence::update_customer_location(state, user_id, GeoPoint { lat, lon }).await;
            Ok(())
        }
        (
            ClientEvent::CreateOrder {
                vehicle_type,
                pickup_lat,
                pickup_lon,
                dropoff_lat,
                dropoff_lon,
            },
            Role::Customer,
        ) => {
            dispatch::create_order(
                state,
                ctx,
                vehicle_type,
                GeoPoint {
                    lat: pickup_lat,
                    lon: pickup_lon,
                },
                GeoPoint {
                    lat: dropoff_lat,
                    lon: dropoff_lon,
                },
            )
            .await
        }
        (ClientEvent::CancelOrder { order_id }, Role::Customer) => {
            dispatch::cancel_order(state, ctx, order_id).await
        }
        (
            ClientEvent::CancelOrderWithCode {
                order_id,
                confirm_code,
            },
            Role::Customer,
        ) => dispatch::cancel_order_with_code(state, ctx, order_id, &confirm_code).await,
        (
            ClientEvent::AcceptOrderWithLabor {
                order_id,
                labor_count,
            },
            Role::Driver,
        ) => dispatch::accept_order_with_labor(state, ctx, order_id, labor_count).await,
        (ClientEvent::ConfirmPriceWithCustomer { order_id }, Role::Driver) => {
            dispatch::confirm_price_with_customer(state, ctx, order_id).await
        }
        (
            ClientEvent::PriceConfirmationResponse {
                order_id,
                is_accepted,
            },
            Role::Customer,
        ) => dispatch::price_confirmation_response(state, ctx, order_id, is_accepted).await,
        (ClientEvent::DriverStartedNavigation { order_id }, Role::Driver) => {
            dispatch::driver_started_navigation(state, ctx, order_id).await
        }
        (ClientEvent::InspectOrder { order_id }, Role::Driver) => {
            dispatch::inspect_order(state, ctx, order_id).await
        }
        (ClientEvent::StopInspectingOrder { order_id }, Role::Driver) => {
            dispatch::stop_inspecting_order(state, ctx, order_id).await
        }
        (ClientEvent::UpdateOrderStatus { order_id, status }, Role::Driver | Role::Customer) => {
            dispatch::update_order_status(state, ctx, order_id, status).await
        }
        (event, role) => Err(AppError::Auth(format!(
            "{} is not allowed for role {}",
            event.kind().as_str(),
            role.as_str()
        ))),
    }
}
