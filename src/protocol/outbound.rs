use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::Role;
use crate::models::order::{Order, OrderStatus};
use crate::models::presence::GeoPoint;

/// Core-to-client events, serialized as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Welcome {
        conn_id: Uuid,
        role: Role,
        server_time: DateTime<Utc>,
    },
    TokenRefreshed {
        access_token: String,
    },
    /// The previous session for the same driver was closed in favor of a
    /// new connection.
    SessionReplaced,
    RequestLocationUpdate,
    NearbyDriversUpdate {
        drivers: Vec<NearbyDriver>,
    },
    NewOrderAvailable {
        order: OrderSummary,
    },
    OrderStatusUpdate {
        order_id: i64,
        status: OrderStatus,
    },
    OrderPhaseUpdate {
        order_id: i64,
        current_phase: String,
    },
    OrderInspectionStarted {
        order_id: i64,
        driver_id: i64,
    },
    OrderInspectionStopped {
        order_id: i64,
    },
    OrderLockedForInspection {
        order_id: i64,
    },
    PriceConfirmationRequested {
        order_id: i64,
        final_price: f64,
        original_price: f64,
        difference: f64,
        labor_count: u32,
        driver: DriverInfo,
        breakdown: PriceBreakdown,
        timeout_secs: u64,
    },
    PriceCountdown {
        order_id: i64,
        remaining_secs: u64,
    },
    PriceAcceptedByCustomer {
        order_id: i64,
        final_price: f64,
    },
    PriceRejectedByCustomer {
        order_id: i64,
    },
    PriceConfirmationTimeout {
        order_id: i64,
    },
    CancelOrderConfirmationRequired {
        order_id: i64,
        confirm_code: String,
        cancellation_fee: f64,
    },
    DriverLocationUpdate {
        order_id: i64,
        location: GeoPoint,
        eta_minutes: f64,
        target: GeoPoint,
    },
    DriverOffline {
        driver_id: i64,
    },
    DriverDisconnected {
        driver_id: i64,
    },
    RateLimitExceeded {
        event: String,
        retry_after_ms: u64,
        remaining: u32,
    },
    ValidationError {
        message: String,
    },
    SpamWarning {
        event: String,
    },
    Error {
        kind: String,
        message: String,
    },
    DispatchStats {
        snapshot: StatsSnapshot,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyDriver {
    pub driver_id: i64,
    pub location: GeoPoint,
    pub heading: Option<f64>,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverInfo {
    pub driver_id: i64,
    pub name: String,
    pub rating: f64,
    pub vehicle_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceBreakdown {
    pub base_price: f64,
    pub distance_km: f64,
    pub distance_component: f64,
    pub labor_component: f64,
}

/// What drivers see when an order is broadcast; enough to decide whether to
/// inspect, nothing customer-identifying beyond the pickup area.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub order_id: i64,
    pub vehicle_type: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub distance_km: f64,
    pub estimated_price: f64,
}

impl OrderSummary {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            vehicle_type: order.vehicle_type.clone(),
            pickup: order.pickup(),
            dropoff: order.dropoff(),
            distance_km: crate::geo::haversine_km(&order.pickup(), &order.dropoff()),
            estimated_price: order.total_price,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub drivers_connected: usize,
    pub customers_connected: usize,
    pub room_memberships: usize,
    pub inspection_locks: usize,
    pub pending_approvals: usize,
    pub taken_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::ServerEvent;
    use crate::models::order::OrderStatus;

    #[test]
    fn events_serialize_with_tag_and_data() {
        let event = ServerEvent::OrderStatusUpdate {
            order_id: 9,
            status: OrderStatus::Inspecting,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "order_status_update");
        assert_eq!(json["data"]["order_id"], 9);
        assert_eq!(json["data"]["status"], "inspecting");
    }

    #[test]
    fn bare_events_serialize_without_data() {
        let json = serde_json::to_value(ServerEvent::RequestLocationUpdate).unwrap();
        assert_eq!(json["event"], "request_location_update");
        assert!(json.get("data").is_none());
    }
}
