mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use container_bus::{
    BusError, CallOptions, DispatchRegistry, MemoryBroker,
    broker::{Broker, ConsumeOptions, MessageProperties, Publish, QueueOptions},
    routing::{DEFAULT_EXCHANGE, DIRECT_EXCHANGE, ExchangeKind},
};
use futures_util::{StreamExt, future::join_all};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{bus, eventually, init_tracing};

#[tokio::test]
async fn echo_returns_the_handlers_bytes() {
    init_tracing();
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let client = bus(&broker);

    let consumers = DispatchRegistry::new("svc")
        .rpc("echo", |body: Vec<u8>| async move {
            let request: Value = serde_json::from_slice(&body)?;
            let task_id = request["task_id"].as_i64().ok_or_else(|| anyhow!("no task_id"))?;
            Ok::<_, anyhow::Error>(format!(r#"{{"task_id": {task_id}, "ok": true}}"#).into_bytes())
        })
        .start(&server, &CancellationToken::new());

    let reply = timeout(Duration::from_secs(3), client.call("svc_echo", br#"{"task_id": 42}"#))
        .await
        .expect("call timed out")
        .unwrap();
    assert_eq!(reply, br#"{"task_id": 42, "ok": true}"#);
    assert_eq!(client.pending_calls().await, 0);

    consumers.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_never_cross_talk() {
    init_tracing();
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let client = bus(&broker);

    let consumers = DispatchRegistry::new("svc")
        .rpc("alpha", |body: Vec<u8>| async move {
            let request: Value = serde_json::from_slice(&body)?;
            Ok::<_, anyhow::Error>(serde_json::to_vec(&json!({"n": request["n"], "svc": "alpha"}))?)
        })
        .rpc("beta", |body: Vec<u8>| async move {
            let request: Value = serde_json::from_slice(&body)?;
            Ok::<_, anyhow::Error>(serde_json::to_vec(&json!({"n": request["n"], "svc": "beta"}))?)
        })
        .start(&server, &CancellationToken::new());

    let calls = (0..40).map(|n| {
        let client = client.clone();
        async move {
            let svc = if n % 2 == 0 { "alpha" } else { "beta" };
            let reply: Value = client
                .call_json(&format!("svc_{svc}"), &json!({"n": n}))
                .await
                .unwrap();
            (n, svc, reply)
        }
    });
    let results = timeout(Duration::from_secs(5), join_all(calls)).await.expect("calls timed out");

    for (n, svc, reply) in results {
        assert_eq!(reply, json!({"n": n, "svc": svc}));
    }
    assert_eq!(client.pending_calls().await, 0);
    consumers.shutdown().await;
}

#[tokio::test]
async fn handler_error_becomes_error_reply() {
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let client = bus(&broker);
    let consumers = DispatchRegistry::new("apollo")
        .rpc("payload_build", |_body: Vec<u8>| async move {
            Err::<Vec<u8>, _>(anyhow!("missing build parameter"))
        })
        .rpc("panics", |_body: Vec<u8>| async move {
            if true {
                panic!("handler blew up");
            }
            Ok::<_, anyhow::Error>(Vec::new())
        })
        .start(&server, &CancellationToken::new());

    let reply: Value = client.call_json("apollo_payload_build", &json!({})).await.unwrap();
    assert_eq!(reply, json!({"status": "error", "error": "missing build parameter"}));

    let reply: Value = client.call_json("apollo_panics", &json!({})).await.unwrap();
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error"], "panic: handler blew up");

    // the consumer survived both
    let reply: Value = client.call_json("apollo_payload_build", &json!({})).await.unwrap();
    assert_eq!(reply["status"], "error");
    consumers.shutdown().await;
}

#[tokio::test]
async fn request_without_reply_to_is_dropped() {
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let consumers = DispatchRegistry::new("svc")
        .rpc("echo", move |body: Vec<u8>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(body) }
        })
        .start(&server, &CancellationToken::new());

    eventually("rpc consumer", || async { broker.consumer_count("svc_echo") == 1 }).await;
    // a plain send carries no reply_to
    server.try_send("svc_echo", b"{}").await.unwrap();

    eventually("request settled", || async {
        broker.ready_count("svc_echo") == 0 && broker.unacked_count("svc_echo") == 0
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    consumers.shutdown().await;
}

#[tokio::test]
async fn late_reply_of_timed_out_attempt_is_ignored() {
    init_tracing();
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let client = bus(&broker);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();

    let consumers = DispatchRegistry::new("svc")
        .rpc("slow_once", move |body: Vec<u8>| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Ok::<_, anyhow::Error>(body)
            }
        })
        .start(&server, &CancellationToken::new());

    let options = CallOptions::default().with_timeout(Duration::from_millis(100));
    let reply = timeout(Duration::from_secs(5), client.call_with("svc_slow_once", br#"{"x":1}"#, options))
        .await
        .expect("call timed out")
        .unwrap();
    assert_eq!(reply, br#"{"x":1}"#);
    assert!(invocations.load(Ordering::SeqCst) >= 2);
    assert_eq!(client.pending_calls().await, 0);
    consumers.shutdown().await;
}

#[tokio::test]
async fn deadline_and_cancellation_stop_retrying() {
    let broker = MemoryBroker::new();
    let client = bus(&broker);

    // nobody serves this queue, every attempt comes back unroutable
    let err = client
        .call_with("svc_nobody", b"{}", CallOptions::default().with_deadline(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::DeadlineExceeded(d) if d == Duration::from_millis(200)));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let err = client
        .call_with("svc_nobody", b"{}", CallOptions::default().with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Cancelled));

    eventually("pending table drained", || async { client.pending_calls().await == 0 }).await;
}

#[tokio::test]
async fn shutdown_ends_waiting_and_later_calls() {
    init_tracing();
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let client = bus(&broker);

    // accepts requests and never answers
    let consumers = DispatchRegistry::new("svc")
        .rpc("silent", |_body: Vec<u8>| async move {
            std::future::pending::<()>().await;
            Ok::<_, anyhow::Error>(Vec::new())
        })
        .start(&server, &CancellationToken::new());

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.call("svc_silent", b"{}").await })
    };
    eventually("call registered", || async { client.pending_calls().await == 1 }).await;

    client.shutdown();
    let err = timeout(Duration::from_secs(2), waiting).await.expect("in-flight call kept retrying").unwrap().unwrap_err();
    assert!(matches!(err, BusError::Shutdown));

    let err = timeout(Duration::from_secs(2), client.call("svc_silent", b"{}"))
        .await
        .expect("call after shutdown kept retrying")
        .unwrap_err();
    assert!(matches!(err, BusError::Shutdown));

    consumers.cancel_token().cancel();
}

#[tokio::test]
async fn duplicate_reply_after_redelivery_is_dropped() {
    let broker = MemoryBroker::new();
    let client = bus(&broker);

    // hand-rolled server that replies, nacks, then replies again to the
    // redelivered copy with the same correlation id
    let channel = broker.connect().await.unwrap().open_channel().await.unwrap();
    channel.declare_exchange(DIRECT_EXCHANGE, ExchangeKind::Direct).await.unwrap();
    channel.declare_queue("manual_rpc", QueueOptions::shared()).await.unwrap();
    channel.bind_queue("manual_rpc", DIRECT_EXCHANGE, "manual_rpc").await.unwrap();
    let mut requests = channel.consume("manual_rpc", ConsumeOptions::default()).await.unwrap();

    let server = tokio::spawn(async move {
        let mut seen = Vec::new();
        for body in [&br#"{"reply":"first"}"#[..], &br#"{"reply":"second"}"#[..]] {
            let request = requests.next().await.unwrap().unwrap();
            let reply_to = request.properties.reply_to.clone().unwrap();
            let correlation_id = request.properties.correlation_id.clone().unwrap();
            channel
                .publish(Publish {
                    exchange: DEFAULT_EXCHANGE,
                    routing_key: &reply_to,
                    payload: body,
                    properties: MessageProperties::json().with_correlation_id(correlation_id.as_str()),
                    mandatory: false,
                })
                .await
                .unwrap();
            if seen.is_empty() {
                request.nack(true).await.unwrap();
            } else {
                request.ack().await.unwrap();
            }
            seen.push((correlation_id, request.redelivered));
        }
        seen
    });

    let reply = timeout(Duration::from_secs(3), client.call("manual_rpc", b"{}")).await.unwrap().unwrap();
    assert_eq!(reply, br#"{"reply":"first"}"#);

    let seen = server.await.unwrap();
    assert_eq!(seen[0].0, seen[1].0);
    assert!(!seen[0].1 && seen[1].1);
    assert_eq!(client.pending_calls().await, 0);
}
