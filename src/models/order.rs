use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::auth::Role;
use crate::models::presence::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Inspecting,
    DriverAcceptedAwaitingCustomer,
    CustomerPriceApproved,
    CustomerPriceRejected,
    CustomerConfirmationTimeout,
    DriverGoingToPickup,
    PickupCompleted,
    InTransit,
    Delivered,
    PaymentCompleted,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Inspecting => "inspecting",
            OrderStatus::DriverAcceptedAwaitingCustomer => "driver_accepted_awaiting_customer",
            OrderStatus::CustomerPriceApproved => "customer_price_approved",
            OrderStatus::CustomerPriceRejected => "customer_price_rejected",
            OrderStatus::CustomerConfirmationTimeout => "customer_confirmation_timeout",
            OrderStatus::DriverGoingToPickup => "driver_going_to_pickup",
            OrderStatus::PickupCompleted => "pickup_completed",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Delivered => "delivered",
            OrderStatus::PaymentCompleted => "payment_completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::PaymentCompleted | OrderStatus::Cancelled
        )
    }

    /// Statuses from which the customer may still start a cancellation.
    /// Delivered and paid orders are checked (and refused) before any fee
    /// computation happens.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Inspecting
                | OrderStatus::DriverAcceptedAwaitingCustomer
                | OrderStatus::CustomerPriceApproved
                | OrderStatus::DriverGoingToPickup
                | OrderStatus::PickupCompleted
        )
    }

    /// Statuses a driver may still accept from.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Inspecting)
    }

    /// Delivery progression allowed through `update_order_status`, gated by
    /// who is asking. Everything else goes through a dedicated sub-protocol
    /// (inspection, negotiation, cancellation) and is rejected here.
    pub fn can_progress_to(&self, to: OrderStatus, by: Role) -> bool {
        match (self, to, by) {
            (OrderStatus::DriverGoingToPickup, OrderStatus::PickupCompleted, Role::Driver) => true,
            (OrderStatus::PickupCompleted, OrderStatus::InTransit, Role::Driver) => true,
            (OrderStatus::InTransit, OrderStatus::Delivered, Role::Driver) => true,
            (OrderStatus::Delivered, OrderStatus::PaymentCompleted, Role::Customer) => true,
            _ => false,
        }
    }
}

impl Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "inspecting" => Ok(OrderStatus::Inspecting),
            "driver_accepted_awaiting_customer" => Ok(OrderStatus::DriverAcceptedAwaitingCustomer),
            "customer_price_approved" => Ok(OrderStatus::CustomerPriceApproved),
            "customer_price_rejected" => Ok(OrderStatus::CustomerPriceRejected),
            "customer_confirmation_timeout" => Ok(OrderStatus::CustomerConfirmationTimeout),
            "driver_going_to_pickup" => Ok(OrderStatus::DriverGoingToPickup),
            "pickup_completed" => Ok(OrderStatus::PickupCompleted),
            "in_transit" => Ok(OrderStatus::InTransit),
            "delivered" => Ok(OrderStatus::Delivered),
            "payment_completed" => Ok(OrderStatus::PaymentCompleted),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// An order row as persisted. The dispatch core never owns these; it reads
/// them and writes status/assignment fields through guarded transitions.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Order {
    pub id: i64,
    pub customer_id: i64,
    pub driver_id: Option<i64>,
    pub status: OrderStatus,
    pub vehicle_type: String,
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub dropoff_lat: f64,
    pub dropoff_lon: f64,
    pub total_price: f64,
    pub original_price: f64,
    pub labor_count: i64,
    pub cancellation_confirm_code: Option<String>,
    pub cancellation_fee: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn pickup(&self) -> GeoPoint {
        GeoPoint {
            lat: self.pickup_lat,
            lon: self.pickup_lon,
        }
    }

    pub fn dropoff(&self) -> GeoPoint {
        GeoPoint {
            lat: self.dropoff_lat,
            lon: self.dropoff_lon,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: i64,
    pub vehicle_type: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub estimated_price: f64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatusChange {
    pub id: i64,
    pub order_id: i64,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub changed_by: String,
    pub created_at: DateTime<Utc>,
}
