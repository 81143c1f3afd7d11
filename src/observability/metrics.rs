use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub drivers_connected: IntGauge,
    pub customers_connected: IntGauge,
    pub room_memberships: IntGauge,
    pub client_events_total: IntCounterVec,
    pub events_rejected_total: IntCounterVec,
    pub approval_resolutions_total: IntCounterVec,
    pub order_transitions_total: IntCounterVec,
    pub store_failures_total: IntCounter,
    pub event_handle_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let drivers_connected = IntGauge::new("drivers_connected", "Currently connected drivers")
            .expect("valid drivers_connected metric");

        let customers_connected =
            IntGauge::new("customers_connected", "Currently connected customers")
                .expect("valid customers_connected metric");

        let room_memberships = IntGauge::new(
            "room_memberships",
            "Current customer-connection proximity group edges",
        )
        .expect("valid room_memberships metric");

        let client_events_total = IntCounterVec::new(
            Opts::new("client_events_total", "Client events received by type"),
            &["event"],
        )
        .expect("valid client_events_total metric");

        let events_rejected_total = IntCounterVec::new(
            Opts::new("events_rejected_total", "Client events rejected by reason"),
            &["reason"],
        )
        .expect("valid events_rejected_total metric");

        let approval_resolutions_total = IntCounterVec::new(
            Opts::new(
                "approval_resolutions_total",
                "Price approval resolutions by outcome",
            ),
            &["outcome"],
        )
        .expect("valid approval_resolutions_total metric");

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order transitions by new status"),
            &["status"],
        )
        .expect("valid order_transitions_total metric");

        let store_failures_total = IntCounter::new(
            "store_failures_total",
            "Store queries that failed and forced a fail-closed decision",
        )
        .expect("valid store_failures_total metric");

        let event_handle_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "event_handle_seconds",
                "Latency of client event handling in seconds",
            ),
            &["event"],
        )
        .expect("valid event_handle_seconds metric");

        registry
            .register(Box::new(drivers_connected.clone()))
            .expect("register drivers_connected");
        registry
            .register(Box::new(customers_connected.clone()))
            .expect("register customers_connected");
        registry
            .register(Box::new(room_memberships.clone()))
            .expect("register room_memberships");
        registry
            .register(Box::new(client_events_total.clone()))
            .expect("register client_events_total");
        registry
            .register(Box::new(events_rejected_total.clone()))
            .expect("register events_rejected_total");
        registry
            .register(Box::new(approval_resolutions_total.clone()))
            .expect("register approval_resolutions_total");
        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(store_failures_total.clone()))
            .expect("register store_failures_total");
        registry
            .register(Box::new(event_handle_seconds.clone()))
            .expect("register event_handle_seconds");

        Self {
            registry,
            drivers_connected,
            customers_connected,
            room_memberships,
            client_events_total,
            events_rejected_total,
            approval_resolutions_total,
            order_transitions_total,
            store_failures_total,
            event_handle_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
