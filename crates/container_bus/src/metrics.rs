use std::sync::OnceLock;

use opentelemetry::{
    KeyValue, global,
    metrics::Counter,
};

/// Counters for the substrate. They record into whatever meter provider the
/// owning process installed (a no-op one unless OTLP export is configured).
pub struct BusMetrics {
    pub connection_attempts: Counter<u64>,
    pub connection_failures: Counter<u64>,
    pub published: Counter<u64>,
    pub publish_failures: Counter<u64>,
    pub rpc_calls: Counter<u64>,
    pub rpc_retries: Counter<u64>,
    pub rpc_replies: Counter<u64>,
    pub replies_dropped: Counter<u64>,
    pub deliveries: Counter<u64>,
    pub handler_failures: Counter<u64>,
    pub resource_conflicts: Counter<u64>,
}

static METRICS: OnceLock<BusMetrics> = OnceLock::new();

pub fn metrics() -> &'static BusMetrics {
    METRICS.get_or_init(|| {
        let meter = global::meter("container-bus");
        BusMetrics {
            connection_attempts: meter
                .u64_counter("bus_connection_attempts")
                .with_description("Broker connection attempts")
                .build(),
            connection_failures: meter.u64_counter("bus_connection_failures").build(),
            published: meter
                .u64_counter("bus_published")
                .with_description("Messages confirmed by the broker")
                .build(),
            publish_failures: meter.u64_counter("bus_publish_failures").build(),
            rpc_calls: meter.u64_counter("bus_rpc_calls").build(),
            rpc_retries: meter
                .u64_counter("bus_rpc_retries")
                .with_description("RPC attempts that timed out or failed and were retried")
                .build(),
            rpc_replies: meter.u64_counter("bus_rpc_replies").build(),
            replies_dropped: meter.u64_counter("bus_replies_dropped").build(),
            deliveries: meter.u64_counter("bus_deliveries").build(),
            handler_failures: meter.u64_counter("bus_handler_failures").build(),
            resource_conflicts: meter
                .u64_counter("bus_resource_conflicts")
                .with_description("Exclusive queues found held by another instance")
                .build(),
        }
    })
}

pub(crate) fn queue_attr(queue: &str) -> [KeyValue; 1] {
    [KeyValue::new("queue", queue.to_owned())]
}
