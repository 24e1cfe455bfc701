mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::bail;
use container_bus::{
    AckPolicy, DispatchRegistry, MemoryBroker,
    routing::{TOPIC_EXCHANGE, topics},
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use common::{bus, eventually, init_tracing};

#[tokio::test]
async fn failed_direct_handler_gets_the_message_again() {
    init_tracing();
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let consumers = DispatchRegistry::new("apollo")
        .direct("pt_task_process_response", move |body: Vec<u8>| {
            let attempt = {
                let mut seen = record.lock().unwrap();
                seen.push(body);
                seen.len()
            };
            async move {
                if attempt == 1 {
                    bail!("database not ready");
                }
                Ok(())
            }
        })
        .start(&server, &CancellationToken::new());

    eventually("direct consumer", || async {
        broker.consumer_count("apollo_pt_task_process_response") == 1
    })
    .await;
    server
        .try_send("apollo_pt_task_process_response", br#"{"task_id":7}"#)
        .await
        .unwrap();

    eventually("second delivery acked", || async {
        seen.lock().unwrap().len() == 2 && broker.unacked_count("apollo_pt_task_process_response") == 0
    })
    .await;
    // no third delivery after the ack
    sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![br#"{"task_id":7}"#.to_vec(); 2]);
    consumers.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_is_requeued_and_loop_survives() {
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let consumers = DispatchRegistry::new("svc")
        .direct("jobs", move |_body: Vec<u8>| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    panic!("first delivery explodes");
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .start(&server, &CancellationToken::new());

    eventually("direct consumer", || async { broker.consumer_count("svc_jobs") == 1 }).await;
    server.try_send("svc_jobs", b"{}").await.unwrap();
    eventually("redelivery handled", || async {
        calls.load(Ordering::SeqCst) == 2 && broker.unacked_count("svc_jobs") == 0
    })
    .await;
    assert_eq!(broker.consumer_count("svc_jobs"), 1);
    consumers.shutdown().await;
}

#[tokio::test]
async fn ack_on_receipt_does_not_redeliver() {
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let consumers = DispatchRegistry::new("svc")
        .with_ack_policy(AckPolicy::OnReceipt)
        .direct("fire_and_forget", move |_body: Vec<u8>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(anyhow::anyhow!("always fails")) }
        })
        .start(&server, &CancellationToken::new());

    eventually("direct consumer", || async { broker.consumer_count("svc_fire_and_forget") == 1 }).await;
    server.try_send("svc_fire_and_forget", b"{}").await.unwrap();
    eventually("first delivery", || async { calls.load(Ordering::SeqCst) == 1 }).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.ready_count("svc_fire_and_forget"), 0);
    consumers.shutdown().await;
}

#[tokio::test]
async fn topic_broadcast_reaches_every_subscriber_once() {
    init_tracing();
    let broker = MemoryBroker::new();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    // three loggers in three containers
    let mut buses = Vec::new();
    for name in ["logger_a", "logger_b", "logger_c"] {
        let container = bus(&broker);
        let counter = deliveries.clone();
        DispatchRegistry::new(name)
            .topic(topics::LOG_NEW_TASK, move |_body: Vec<u8>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            })
            .start(&container, &cancel);
        buses.push(container);
    }
    eventually("three bindings", || async {
        broker.bound_queues(TOPIC_EXCHANGE, topics::LOG_NEW_TASK) == 3
    })
    .await;

    buses[0]
        .broadcast(topics::LOG_NEW_TASK, br#"{"task_id":1}"#)
        .await
        .unwrap();
    eventually("three deliveries", || async { deliveries.load(Ordering::SeqCst) == 3 }).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);

    // other topics do not reach them
    let _ = buses[0].broadcast(topics::LOG_NEW_CALLBACK, b"{}").await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    cancel.cancel();
}

#[tokio::test]
async fn exclusive_rpc_queue_has_one_active_consumer() {
    init_tracing();
    let broker = MemoryBroker::new();
    let first_bus = bus(&broker);
    let second_bus = bus(&broker);
    let client = bus(&broker);

    let first = DispatchRegistry::new("svc")
        .rpc("whoami", |_body: Vec<u8>| async { Ok::<_, anyhow::Error>(b"\"first\"".to_vec()) })
        .start(&first_bus, &CancellationToken::new());
    let second = DispatchRegistry::new("svc")
        .rpc("whoami", |_body: Vec<u8>| async { Ok::<_, anyhow::Error>(b"\"second\"".to_vec()) })
        .start(&second_bus, &CancellationToken::new());

    eventually("one consumer attached", || async { broker.consumer_count("svc_whoami") == 1 }).await;
    // the loser is refused as resource-locked, again on every retry
    eventually("loser retried after a lock conflict", || async { broker.locked_refusals("svc_whoami") >= 2 }).await;
    assert_eq!(broker.consumer_count("svc_whoami"), 1);

    let active: String = client.call_json("svc_whoami", &()).await.unwrap();
    let (winner, standby, expected) = if active == "first" {
        (first, second, "second")
    } else {
        (second, first, "first")
    };

    winner.shutdown().await;
    let takeover: String = timeout(Duration::from_secs(3), client.call_json("svc_whoami", &()))
        .await
        .expect("standby never took over")
        .unwrap();
    assert_eq!(takeover, expected);
    standby.shutdown().await;
}

#[tokio::test]
async fn call_survives_connection_drop() {
    init_tracing();
    let broker = MemoryBroker::new();
    let server = bus(&broker);
    let client = bus(&broker);
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();

    let consumers = DispatchRegistry::new("svc")
        .rpc("slow_echo", move |body: Vec<u8>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(body)
            }
        })
        .start(&server, &CancellationToken::new());

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("svc_slow_echo", br#"{"task_id":42}"#).await }
    });
    eventually("request in flight", || async { started.load(Ordering::SeqCst) >= 1 }).await;
    broker.sever_connections();

    let reply = timeout(Duration::from_secs(5), call)
        .await
        .expect("call never recovered")
        .unwrap()
        .unwrap();
    assert_eq!(reply, br#"{"task_id":42}"#);
    assert!(broker.connection_count() >= 2);
    assert_eq!(client.pending_calls().await, 0);
    consumers.shutdown().await;
}
