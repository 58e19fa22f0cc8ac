use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Connection metrics
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "connections_active",
        "Current number of open client connections"
    ).unwrap();

    pub static ref CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "connections_total",
        "Total number of accepted client connections"
    ).unwrap();

    // Framing metrics
    pub static ref FRAMES_RECEIVED: IntCounter = IntCounter::new(
        "frames_received_total",
        "Total number of request frames decoded"
    ).unwrap();

    pub static ref FRAMES_SENT: IntCounter = IntCounter::new(
        "frames_sent_total",
        "Total number of frames written to clients"
    ).unwrap();

    pub static ref FRAME_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("frame_errors_total", "Total number of rejected frames by kind"),
        &["kind"]
    ).unwrap();

    // Transfer metrics
    pub static ref UPLOADS_TOTAL: IntCounter = IntCounter::new(
        "uploads_total",
        "Total number of completed payload transfers"
    ).unwrap();

    pub static ref UPLOADS_INTERRUPTED: IntCounter = IntCounter::new(
        "uploads_interrupted_total",
        "Total number of payload transfers cut short by the peer"
    ).unwrap();

    pub static ref UPLOAD_BYTES: IntCounter = IntCounter::new(
        "upload_bytes_total",
        "Total payload bytes written to storage"
    ).unwrap();

    pub static ref ACKS_SENT: IntCounter = IntCounter::new(
        "chunk_acks_sent_total",
        "Total number of chunk acknowledgements sent"
    ).unwrap();

    // Dispatch metrics
    pub static ref DISPATCH_ATTEMPTS: IntCounter = IntCounter::new(
        "dispatch_attempts_total",
        "Total number of attempts to hand a job to the worker pool"
    ).unwrap();

    pub static ref DISPATCH_FAILURES: IntCounter = IntCounter::new(
        "dispatch_failures_total",
        "Total number of uploads whose dispatch gave up"
    ).unwrap();

    // Routing metrics
    pub static ref RESULTS_DELIVERED: IntCounter = IntCounter::new(
        "results_delivered_total",
        "Total number of results forwarded to a live connection"
    ).unwrap();

    pub static ref DELIVERY_MISSES: IntCounter = IntCounter::new(
        "result_delivery_misses_total",
        "Total number of results whose connection was already gone"
    ).unwrap();

    pub static ref RESULT_TIMEOUTS: IntCounter = IntCounter::new(
        "result_timeouts_total",
        "Total number of result waits that hit the deadline"
    ).unwrap();

    pub static ref SUBMITTER_BUSY: IntCounter = IntCounter::new(
        "submitter_busy_total",
        "Total number of uploads rejected because the submitter already had one in flight"
    ).unwrap();

    pub static ref RESULT_WAIT_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "result_wait_duration_seconds",
            "Time between dispatch and result receipt in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0])
    ).unwrap();

    pub static ref BUS_MESSAGES_DROPPED: IntCounter = IntCounter::new(
        "bus_messages_dropped_total",
        "Total number of bus messages published with no subscriber"
    ).unwrap();

    // Persistence metrics
    pub static ref PERSIST_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "persist_queue_depth",
        "Current number of predictions waiting to be written"
    ).unwrap();

    pub static ref PERSIST_WRITES: IntCounter = IntCounter::new(
        "persist_writes_total",
        "Total number of predictions written"
    ).unwrap();

    pub static ref PERSIST_FAILURES: IntCounter = IntCounter::new(
        "persist_failures_total",
        "Total number of predictions that could not be written"
    ).unwrap();

    pub static ref PERSIST_DROPPED: IntCounter = IntCounter::new(
        "persist_dropped_total",
        "Total number of predictions dropped because the write queue was full"
    ).unwrap();

    // Worker metrics
    pub static ref TASKS_COMPLETED: IntCounter = IntCounter::new(
        "worker_tasks_completed_total",
        "Total number of classification tasks completed by local workers"
    ).unwrap();

    pub static ref HISTORY_QUERIES: IntCounter = IntCounter::new(
        "history_queries_total",
        "Total number of history requests served"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    // Register connection and framing metrics
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).unwrap();
    REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(FRAMES_RECEIVED.clone())).unwrap();
    REGISTRY.register(Box::new(FRAMES_SENT.clone())).unwrap();
    REGISTRY.register(Box::new(FRAME_ERRORS.clone())).unwrap();

    // Register transfer metrics
    REGISTRY.register(Box::new(UPLOADS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(UPLOADS_INTERRUPTED.clone())).unwrap();
    REGISTRY.register(Box::new(UPLOAD_BYTES.clone())).unwrap();
    REGISTRY.register(Box::new(ACKS_SENT.clone())).unwrap();

    // Register dispatch and routing metrics
    REGISTRY.register(Box::new(DISPATCH_ATTEMPTS.clone())).unwrap();
    REGISTRY.register(Box::new(DISPATCH_FAILURES.clone())).unwrap();
    REGISTRY.register(Box::new(RESULTS_DELIVERED.clone())).unwrap();
    REGISTRY.register(Box::new(DELIVERY_MISSES.clone())).unwrap();
    REGISTRY.register(Box::new(RESULT_TIMEOUTS.clone())).unwrap();
    REGISTRY.register(Box::new(SUBMITTER_BUSY.clone())).unwrap();
    REGISTRY.register(Box::new(RESULT_WAIT_LATENCY.clone())).unwrap();
    REGISTRY.register(Box::new(BUS_MESSAGES_DROPPED.clone())).unwrap();

    // Register persistence and worker metrics
    REGISTRY.register(Box::new(PERSIST_QUEUE_DEPTH.clone())).unwrap();
    REGISTRY.register(Box::new(PERSIST_WRITES.clone())).unwrap();
    REGISTRY.register(Box::new(PERSIST_FAILURES.clone())).unwrap();
    REGISTRY.register(Box::new(PERSIST_DROPPED.clone())).unwrap();
    REGISTRY.register(Box::new(TASKS_COMPLETED.clone())).unwrap();
    REGISTRY.register(Box::new(HISTORY_QUERIES.clone())).unwrap();

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
