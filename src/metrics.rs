use {
    lazy_static::lazy_static,
    log::error,
    prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder},
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "chat_sessions_active", "Sessions currently owned by this instance"
    ).unwrap();

    pub static ref SESSIONS_TOTAL: IntCounter = IntCounter::new(
        "chat_sessions_total", "Sessions accepted by this instance"
    ).unwrap();

    pub static ref BUS_SUBSCRIBED: IntGauge = IntGauge::new(
        "chat_bus_subscribed", "1 while bus updates are received, 0 in degraded mode"
    ).unwrap();

    pub static ref BUS_MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("chat_bus_messages_received_total", "Bus messages handled by the broadcaster"),
        &["channel"]
    ).unwrap();

    pub static ref BUS_DECODE_FAILURES: IntCounter = IntCounter::new(
        "chat_bus_decode_failures_total", "Bus messages dropped because they could not be decoded"
    ).unwrap();

    pub static ref MESSAGES_RELAYED: IntCounter = IntCounter::new(
        "chat_messages_relayed_total", "Client messages published to the bus"
    ).unwrap();

    pub static ref MESSAGES_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("chat_messages_dropped_total", "Client messages not published"),
        &["reason"]
    ).unwrap();

    pub static ref EMIT_FAILURES: IntCounter = IntCounter::new(
        "chat_emit_failures_total", "Frames that could not be queued to a local session"
    ).unwrap();

    pub static ref STORE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("chat_store_errors_total", "Failed store operations"),
        &["op"]
    ).unwrap();

    pub static ref RECONCILED_SESSIONS: IntCounter = IntCounter::new(
        "chat_reconciled_sessions_total", "Sessions subtracted from the shared counter at shutdown"
    ).unwrap();
}

pub fn register_metrics() {
    static REGISTER: std::sync::Once = std::sync::Once::new();
    REGISTER.call_once(|| {
        macro_rules! register {
            ($collector:ident) => {
                REGISTRY
                    .register(Box::new($collector.clone()))
                    .expect("collector can't be registered");
            };
        }
        register!(SESSIONS_ACTIVE);
        register!(SESSIONS_TOTAL);
        register!(BUS_SUBSCRIBED);
        register!(BUS_MESSAGES_RECEIVED);
        register!(BUS_DECODE_FAILURES);
        register!(MESSAGES_RELAYED);
        register!(MESSAGES_DROPPED);
        register!(EMIT_FAILURES);
        register!(STORE_ERRORS);
        register!(RECONCILED_SESSIONS);
    });
}

/// Renders the registry in the prometheus text format.
pub fn gather_text() -> String {
    let metric_families = REGISTRY.gather();
    match TextEncoder::new().encode_to_string(&metric_families) {
        Ok(text) => text,
        Err(error) => {
            error!("could not encode custom metrics: {error}");
            String::new()
        }
    }
}
