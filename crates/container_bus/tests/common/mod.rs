#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use container_bus::{BusTimings, ContainerBus, MemoryBroker};

pub fn fast_timings() -> BusTimings {
    BusTimings {
        connect_retry_delay: Duration::from_millis(20),
        consumer_retry_delay: Duration::from_millis(20),
        rpc_timeout: Duration::from_secs(1),
        rpc_retry_delay: Duration::from_millis(20),
        confirm_timeout: Duration::from_secs(1),
    }
}

/// A bus with its own connection, as a separate container process would have.
pub fn bus(broker: &MemoryBroker) -> ContainerBus {
    ContainerBus::new(Arc::new(broker.clone()), fast_timings())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
