use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::models::order::OrderStatus;

/// Client-to-core events. The wire format is `{"event": "...", "data": {...}}`
/// with snake_case names; unknown events fail deserialization and never reach
/// a handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    LocationUpdate {
        lat: f64,
        lon: f64,
        #[serde(default)]
        heading: Option<f64>,
    },
    AvailabilityUpdate {
        available: bool,
    },
    DriverGoingOffline,
    CreateOrder {
        vehicle_type: String,
        pickup_lat: f64,
        pickup_lon: f64,
        dropoff_lat: f64,
        dropoff_lon: f64,
    },
    CancelOrder {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
    },
    CancelOrderWithCode {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
        confirm_code: String,
    },
    AcceptOrderWithLabor {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
        labor_count: u32,
    },
    ConfirmPriceWithCustomer {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
    },
    PriceConfirmationResponse {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
        is_accepted: bool,
    },
    DriverStartedNavigation {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
    },
    InspectOrder {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
    },
    StopInspectingOrder {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
    },
    UpdateOrderStatus {
        #[serde(deserialize_with = "canonical_order_id")]
        order_id: i64,
        status: OrderStatus,
    },
    CustomerLocationUpdate {
        lat: f64,
        lon: f64,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::LocationUpdate { .. } => EventKind::LocationUpdate,
            ClientEvent::AvailabilityUpdate { .. } => EventKind::AvailabilityUpdate,
            ClientEvent::DriverGoingOffline => EventKind::DriverGoingOffline,
            ClientEvent::CreateOrder { .. } => EventKind::CreateOrder,
            ClientEvent::CancelOrder { .. } => EventKind::CancelOrder,
            ClientEvent::CancelOrderWithCode { .. } => EventKind::CancelOrderWithCode,
            ClientEvent::AcceptOrderWithLabor { .. } => EventKind::AcceptOrderWithLabor,
            ClientEvent::ConfirmPriceWithCustomer { .. } => EventKind::ConfirmPriceWithCustomer,
            ClientEvent::PriceConfirmationResponse { .. } => EventKind::PriceConfirmationResponse,
            ClientEvent::DriverStartedNavigation { .. } => EventKind::DriverStartedNavigation,
            ClientEvent::InspectOrder { .. } => EventKind::InspectOrder,
            ClientEvent::StopInspectingOrder { .. } => EventKind::StopInspectingOrder,
            ClientEvent::UpdateOrderStatus { .. } => EventKind::UpdateOrderStatus,
            ClientEvent::CustomerLocationUpdate { .. } => EventKind::CustomerLocationUpdate,
        }
    }
}

/// Event discriminant used for rate-limit windows, spam keys and metric
/// labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LocationUpdate,
    AvailabilityUpdate,
    DriverGoingOffline,
    CreateOrder,
    CancelOrder,
    CancelOrderWithCode,
    AcceptOrderWithLabor,
    ConfirmPriceWithCustomer,
    PriceConfirmationResponse,
    DriverStartedNavigation,
    InspectOrder,
    StopInspectingOrder,
    UpdateOrderStatus,
    CustomerLocationUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LocationUpdate => "location_update",
            EventKind::AvailabilityUpdate => "availability_update",
            EventKind::DriverGoingOffline => "driver_going_offline",
            EventKind::CreateOrder => "create_order",
            EventKind::CancelOrder => "cancel_order",
            EventKind::CancelOrderWithCode => "cancel_order_with_code",
            EventKind::AcceptOrderWithLabor => "accept_order_with_labor",
            EventKind::ConfirmPriceWithCustomer => "confirm_price_with_customer",
            EventKind::PriceConfirmationResponse => "price_confirmation_response",
            EventKind::DriverStartedNavigation => "driver_started_navigation",
            EventKind::InspectOrder => "inspect_order",
            EventKind::StopInspectingOrder => "stop_inspecting_order",
            EventKind::UpdateOrderStatus => "update_order_status",
            EventKind::CustomerLocationUpdate => "customer_location_update",
        }
    }
}

/// Order ids arrive from two client codebases; one sends JSON numbers, the
/// other numeric strings. Both collapse to i64 here so every map in the core
/// is keyed by exactly one representation.
fn canonical_order_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderIdVisitor;

    impl Visitor<'_> for OrderIdVisitor {
        type Value = i64;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("an integer order id or its decimal string form")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(|_| E::custom("order id out of range"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
            v.trim()
                .parse::<i64>()
                .map_err(|_| E::custom(format!("invalid order id: {v:?}")))
        }
    }

    deserializer.deserialize_any(OrderIdVisitor)
}

#[cfg(test)]
mod tests {
    use super::{ClientEvent, EventKind};
    use crate::models::order::OrderStatus;

    fn parse(raw: &str) -> Result<ClientEvent, serde_json::Error> {
        serde_json::from_str(raw)
    }

    #[test]
    fn numeric_and_string_order_ids_both_canonicalize() {
        let from_number = parse(r#"{"event":"inspect_order","data":{"order_id":42}}"#).unwrap();
        let from_string = parse(r#"{"event":"inspect_order","data":{"order_id":"42"}}"#).unwrap();

        for event in [from_number, from_string] {
            match event {
                ClientEvent::InspectOrder { order_id } => assert_eq!(order_id, 42),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn non_numeric_order_id_is_rejected() {
        assert!(parse(r#"{"event":"inspect_order","data":{"order_id":"abc"}}"#).is_err());
        assert!(parse(r#"{"event":"inspect_order","data":{"order_id":null}}"#).is_err());
    }

    #[test]
    fn unknown_events_fail_at_the_boundary() {
        assert!(parse(r#"{"event":"drop_all_tables","data":{}}"#).is_err());
    }

    #[test]
    fn accept_with_labor_parses() {
        let event =
            parse(r#"{"event":"accept_order_with_labor","data":{"order_id":7,"labor_count":2}}"#)
                .unwrap();
        assert_eq!(event.kind(), EventKind::AcceptOrderWithLabor);
        match event {
            ClientEvent::AcceptOrderWithLabor {
                order_id,
                labor_count,
            } => {
                assert_eq!(order_id, 7);
                assert_eq!(labor_count, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn update_order_status_uses_the_typed_status() {
        let event = parse(
            r#"{"event":"update_order_status","data":{"order_id":7,"status":"pickup_completed"}}"#,
        )
        .unwrap();
        match event {
            ClientEvent::UpdateOrderStatus { status, .. } => {
                assert_eq!(status, OrderStatus::PickupCompleted)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(
            parse(r#"{"event":"update_order_status","data":{"order_id":7,"status":"teleported"}}"#)
                .is_err()
        );
    }

    #[test]
    fn bare_events_need_no_data() {
        let event = parse(r#"{"event":"driver_going_offline"}"#).unwrap();
        assert_eq!(event.kind(), EventKind::DriverGoingOffline);
    }
}
