use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    /// Round trips issued by flood workers, labelled by strategy tag.
    pub static ref REQUESTS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("loadsmith_requests_total", "Total number of flood round trips issued"),
        &["strategy"]
    )
    .expect("metric can be created");
    pub static ref REQUEST_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "loadsmith_request_failures_total",
            "Total number of flood round trips that timed out, failed or returned >= 400"
        ),
        &["strategy"]
    )
    .expect("metric can be created");
    pub static ref FRAGMENTS_SENT: IntCounter = IntCounter::new(
        "loadsmith_hold_fragments_total",
        "Total number of header fragments written to held connections"
    )
    .expect("metric can be created");
    pub static ref CONNECT_FAILURES: IntCounter = IntCounter::new(
        "loadsmith_hold_connect_failures_total",
        "Total number of failed connect attempts by the hold pool"
    )
    .expect("metric can be created");
    pub static ref HELD_CONNECTIONS: Gauge = Gauge::new(
        "loadsmith_held_connections",
        "Number of currently open hold-pool connections"
    )
    .expect("metric can be created");
}

pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(REQUESTS_SENT.clone()));
    let _ = REGISTRY.register(Box::new(REQUEST_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(FRAGMENTS_SENT.clone()));
    let _ = REGISTRY.register(Box::new(CONNECT_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(HELD_CONNECTIONS.clone()));
}

pub fn render_metrics() -> String {
    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| "# Error: Invalid UTF8".to_string())
}
