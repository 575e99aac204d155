//! Process-wide Prometheus registry.
//!
//! One histogram vector per entity class, labelled by operation, plus a
//! counter vector fed by the logging layer. The registry is a process-wide
//! singleton forced once at start-up via [`init`]; nothing on the request
//! path registers collectors lazily.

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, TextEncoder,
};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const NAMESPACE: &str = "kvbus";

static GLOBAL: Lazy<Metrics> = Lazy::new(Metrics::register);

/// Force registration. Call once during process start-up.
pub fn init() {
    Lazy::force(&GLOBAL);
}

pub fn global() -> &'static Metrics {
    &GLOBAL
}

#[derive(Debug)]
pub struct Metrics {
    /// Topic operation latencies, labelled by operation.
    pub topics: HistogramVec,

    /// Subscription operation latencies, labelled by operation.
    pub subscriptions: HistogramVec,

    /// Snapshot operation latencies, labelled by operation.
    pub snapshots: HistogramVec,

    /// Message operation latencies, labelled by operation.
    pub messages: HistogramVec,

    /// Published batch sizes in bytes, labelled by operation.
    pub message_size: HistogramVec,

    /// Log entries, labelled by logger name and level.
    pub log_entries: CounterVec,
}

impl Metrics {
    fn register() -> Self {
        let op_histogram = |name: &str, help: &str| {
            let opts = HistogramOpts::new(name, help)
                .namespace(NAMESPACE)
                .buckets(exponential_buckets(0.0005, 2.0, 20).expect("static bucket layout"));
            let histogram = HistogramVec::new(opts, &["opt"]).expect("static histogram opts");
            prometheus::register(Box::new(histogram.clone())).expect("collector registration");
            histogram
        };

        let log_entries = CounterVec::new(
            Opts::new("logs_entries_total", "Number of logs of certain level")
                .namespace(NAMESPACE),
            &["logger", "level"],
        )
        .expect("static counter opts");
        prometheus::register(Box::new(log_entries.clone())).expect("collector registration");

        Self {
            topics: op_histogram("topics_opt_seconds", "The cost times of topic operations"),
            subscriptions: op_histogram(
                "subscriptions_opt_seconds",
                "The cost times of subscription operations",
            ),
            snapshots: op_histogram(
                "snapshots_opt_seconds",
                "The cost times of snapshot operations",
            ),
            messages: op_histogram(
                "messages_opt_seconds",
                "The cost times of message operations",
            ),
            message_size: op_histogram("messages_size_bytes", "The size of published batches"),
            log_entries,
        }
    }
}

/// Gather the default registry in the Prometheus text format.
pub fn render() -> String {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        tracing::error!(%err, "encoding metrics failed");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Counts every log event into [`Metrics::log_entries`], mirroring what the
/// status page reports about the logger itself.
#[derive(Debug)]
pub struct LogMetricsLayer {
    logger: String,
}

impl LogMetricsLayer {
    pub fn new(logger: impl Into<String>) -> Self {
        Self {
            logger: logger.into(),
        }
    }
}

impl<S: Subscriber> Layer<S> for LogMetricsLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = event.metadata().level().as_str().to_ascii_lowercase();
        global()
            .log_entries
            .with_label_values(&[&self.logger, &level])
            .inc();
    }
}
