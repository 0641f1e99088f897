// tests/rpc_memory.rs
//
// RPC semantics over the in-memory driver: round trips, remote errors,
// timeouts, and lifecycle interaction with in-flight calls.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use polybus::{
    // ---
    create_memory_driver,
    Error,
    ExecuteProps,
    MemoryDriverOptions,
    Transport,
    TransportBuilder,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    v: i32,
}

async fn build_transport(module: &str) -> Transport {
    // ---
    let driver = create_memory_driver(MemoryDriverOptions::new(module))
        .await
        .expect("failed to create memory driver");

    TransportBuilder::new()
        .driver(driver)
        .build()
        .expect("failed to build transport")
}

#[tokio::test]
async fn rpc_round_trip() {
    // ---
    let transport = build_transport("rpc-round-trip").await;

    transport
        .on("Command.Echo.Send", |req: Echo| async move { Ok(req) })
        .unwrap();

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    let result = transport
        .execute("Command.Echo.Send", json!({"v": 1}))
        .await
        .unwrap();

    assert_eq!(result, json!({"v": 1}));

    transport.dispose().await.unwrap();
}

#[tokio::test]
async fn rpc_remote_error_carries_handler_message() {
    // ---
    let transport = build_transport("rpc-remote-error").await;

    transport
        .on("Command.Echo.Fail", |_req: Value| async move {
            Err::<Value, _>(Error::handler("X"))
        })
        .unwrap();

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    let err = transport
        .execute("Command.Echo.Fail", json!({}))
        .await
        .unwrap_err();

    match err {
        Error::Remote(normalized) => {
            assert_eq!(normalized.message, "X");
            assert_eq!(normalized.kind, "HandlerError");
        }
        other => panic!("unexpected error: {other}"),
    }

    transport.dispose().await.unwrap();
}

#[tokio::test]
async fn rpc_timeout_fires_when_handler_never_replies() {
    // ---
    let transport = build_transport("rpc-timeout").await;

    transport
        .on("Command.Sloth.Nap", |_req: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .unwrap();

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    let started = Instant::now();
    let err = transport
        .execute_with(
            ExecuteProps::new("Command.Sloth.Nap", json!({}))
                .rpc_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::RpcTimeout { .. }), "got: {err}");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(
        elapsed < Duration::from_secs(2),
        "timeout took too long: {elapsed:?}"
    );

    transport.dispose().await.unwrap();
}

#[tokio::test]
async fn execute_against_unhandled_route_times_out() {
    // ---
    let transport = build_transport("rpc-unhandled").await;

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    // Nobody handles this route; the request is dropped and the only
    // exit is the timeout.
    let err = transport
        .execute_with(
            ExecuteProps::new("Query.Ghost.Town", json!({}))
                .rpc_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RpcTimeout { .. }));

    transport.dispose().await.unwrap();
}

#[tokio::test]
async fn dispose_drains_pending_calls() {
    // ---
    let transport = build_transport("rpc-dispose").await;

    transport
        .on("Command.Sloth.Nap", |_req: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .unwrap();

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    let t1 = transport.clone();
    let call1 = tokio::spawn(async move { t1.execute("Command.Sloth.Nap", json!({"n": 1})).await });

    let t2 = transport.clone();
    let call2 = tokio::spawn(async move { t2.execute("Command.Sloth.Nap", json!({"n": 2})).await });

    // Let both calls register before tearing down
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.dispose().await.unwrap();

    let r1 = tokio::time::timeout(Duration::from_secs(1), call1)
        .await
        .expect("first call hung after dispose")
        .unwrap();
    let r2 = tokio::time::timeout(Duration::from_secs(1), call2)
        .await
        .expect("second call hung after dispose")
        .unwrap();

    assert!(matches!(r1, Err(Error::Disposed)), "got: {r1:?}");
    assert!(matches!(r2, Err(Error::Disposed)), "got: {r2:?}");
}

#[tokio::test]
async fn stop_leaves_inflight_calls_to_complete() {
    // ---
    let transport = build_transport("rpc-stop-inflight").await;

    transport
        .on("Command.Slow.Echo", |req: Echo| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(req)
        })
        .unwrap();

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    let t = transport.clone();
    let call = tokio::spawn(async move { t.execute("Command.Slow.Echo", json!({"v": 7})).await });

    // Stop while the handler is still running; the reply channel stays
    // open so the call settles normally.
    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.stop().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("call hung after stop")
        .unwrap()
        .unwrap();

    assert_eq!(result, json!({"v": 7}));

    transport.dispose().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_resolve_to_their_own_callers() {
    // ---
    let transport = build_transport("rpc-concurrent").await;

    transport
        .on("Query.Math.Double", |req: Echo| async move {
            Ok(Echo { v: req.v * 2 })
        })
        .unwrap();

    transport.init().await.unwrap();
    transport.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        // ---
        let t = transport.clone();
        handles.push(tokio::spawn(async move {
            t.execute("Query.Math.Double", json!({"v": i})).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!({"v": (i as i64) * 2}));
    }

    transport.dispose().await.unwrap();
}

#[tokio::test]
async fn disposed_transport_refuses_every_operation() {
    // ---
    let transport = build_transport("rpc-terminal").await;

    transport.init().await.unwrap();
    transport.start().await.unwrap();
    transport.dispose().await.unwrap();

    assert!(matches!(
        transport.publish("Event.After.Dispose", json!({})).await,
        Err(Error::Disposed)
    ));
    assert!(matches!(transport.start().await, Err(Error::Disposed)));
    assert!(matches!(
        transport.on("Command.Late.Handler", |req: Echo| async move { Ok(req) }),
        Err(Error::Disposed)
    ));

    // Double dispose is a no-op
    transport.dispose().await.unwrap();
}
