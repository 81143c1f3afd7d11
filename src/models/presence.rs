use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Live record of a connected driver. This is a latency cache, not a source
/// of truth: matching and broadcast decisions re-check the persisted store
/// through the consistency validator before trusting it.
#[derive(Debug, Clone)]
pub struct DriverPresence {
    pub driver_id: i64,
    pub conn_id: Uuid,
    pub location: Option<GeoPoint>,
    pub heading: Option<f64>,
    pub available: bool,
    pub current_order_id: Option<i64>,
    pub connected_at: DateTime<Utc>,
}

impl DriverPresence {
    pub fn new(driver_id: i64, conn_id: Uuid) -> Self {
        Self {
            driver_id,
            conn_id,
            location: None,
            heading: None,
            // a driver connecting is assumed ready to work
            available: true,
            current_order_id: None,
            connected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CustomerPresence {
    pub customer_id: i64,
    pub conn_id: Uuid,
    pub location: Option<GeoPoint>,
    /// Location at which the proximity group was last rebuilt. Updates that
    /// stay within [`GROUP_REFRESH_METERS`] of this anchor do not trigger a
    /// recompute.
    pub group_anchor: Option<GeoPoint>,
    pub connected_at: DateTime<Utc>,
}

impl CustomerPresence {
    pub fn new(customer_id: i64, conn_id: Uuid) -> Self {
        Self {
            customer_id,
            conn_id,
            location: None,
            group_anchor: None,
            connected_at: Utc::now(),
        }
    }
}

/// Movement below this distance does not rebuild a customer's proximity
/// group; the periodic reconciliation sweep still corrects any drift.
pub const GROUP_REFRESH_METERS: f64 = 100.0;

/// Exclusive, time-boxed claim by one driver to evaluate a pending order.
#[derive(Debug, Clone)]
pub struct InspectionLock {
    pub driver_id: i64,
    pub started_at: DateTime<Utc>,
}

/// A driver's price proposal awaiting the customer's accept / reject /
/// timeout resolution. Keyed by the canonical i64 order id; exactly one may
/// exist per order and exactly one resolution may consume it.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub driver_id: i64,
    pub driver_conn: Uuid,
    pub customer_id: i64,
    pub labor_count: u32,
    pub proposed_price: f64,
    pub started_at: DateTime<Utc>,
}
