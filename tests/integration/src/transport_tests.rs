//! Transport and adapter behavior across real connections

mod common;

use common::*;
use scopes_rpc::{MiddlewareError, ObjectAdapter, RequestMode, Servant, Variant, VariantMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

async fn twoway_adapter(runtime: &scopes_rpc::Runtime, name: &str) -> ObjectAdapter {
    runtime
        .create_adapter(name, None, RequestMode::Twoway, None)
        .await
        .unwrap()
}

fn echo_servant() -> Arc<Servant> {
    let mut servant = Servant::new();
    servant.register_operation("echo", |_current, args| async move {
        Ok(args.get("value").cloned().unwrap_or(Variant::Null))
    });
    Arc::new(servant)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_twoway_echo_roundtrip() {
    init_logging();
    let runtime = runtime("transport-echo");
    let adapter = twoway_adapter(&runtime, "echo").await;
    let proxy = adapter.add("echo", echo_servant()).unwrap();

    for i in 0..10i64 {
        let mut args = VariantMap::new();
        args.insert("value".into(), Variant::Int(i));
        let result = proxy.invoke_twoway("echo", args).await.unwrap();
        assert_eq!(result, Variant::Int(i));
    }

    runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_application_error_crosses_the_wire() {
    init_logging();
    let runtime = runtime("transport-error");
    let adapter = twoway_adapter(&runtime, "failing").await;

    let mut servant = Servant::new();
    servant.register_operation("fail", |_current, _args| async move {
        Err::<Variant, _>(MiddlewareError::Resource("factory exploded".into()))
    });
    let proxy = adapter.add("failing", Arc::new(servant)).unwrap();

    let err = proxy
        .invoke_twoway("fail", VariantMap::new())
        .await
        .unwrap_err();
    match err {
        MiddlewareError::Resource(message) => assert!(message.contains("factory exploded")),
        other => panic!("expected resource error, got {:?}", other),
    }

    runtime.destroy().await;
}

/// A twoway call that times out must not poison the endpoint: the broken
/// connection is discarded, and the next call (once the remote is
/// responsive again) succeeds on a fresh connection.
#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_frees_the_connection() {
    init_logging();
    let runtime = runtime("transport-timeout");
    let adapter = twoway_adapter(&runtime, "gated").await;

    let gate = Arc::new(Notify::new());
    let gate_in_servant = Arc::clone(&gate);
    let mut servant = Servant::new();
    servant.register_operation("call", move |_current, _args| {
        let gate = Arc::clone(&gate_in_servant);
        async move {
            gate.notified().await;
            Ok(Variant::from("done"))
        }
    });
    let proxy = adapter
        .add("gated", Arc::new(servant))
        .unwrap()
        .with_timeout(Some(Duration::from_millis(200)));

    // First call: the servant is unresponsive, so the caller times out.
    let err = proxy
        .invoke_twoway("call", VariantMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MiddlewareError::Timeout));

    // Unblock the servant; the stuck first dispatch completes.
    gate.notify_waiters();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // An immediate retry must succeed: the timed-out connection was
    // dropped instead of being reused in a broken state.
    gate.notify_one();
    let result = proxy
        .invoke_twoway("call", VariantMap::new())
        .await
        .unwrap();
    assert_eq!(result, Variant::from("done"));

    runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_answered_by_every_servant() {
    init_logging();
    let runtime = runtime("transport-ping");
    let adapter = twoway_adapter(&runtime, "pingable").await;
    let proxy = adapter.add("object", echo_servant()).unwrap();
    proxy.ping().await.unwrap();
    runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_adapter() {
    init_logging();
    let runtime = runtime("transport-stress");
    let adapter = twoway_adapter(&runtime, "shared").await;
    let proxy = adapter.add("shared", echo_servant()).unwrap();

    const CALLERS: usize = 16;
    const CALLS: usize = 25;

    let mut handles = Vec::new();
    for caller in 0..CALLERS {
        let proxy = proxy.clone();
        handles.push(tokio::spawn(async move {
            for call in 0..CALLS {
                let value = (caller * CALLS + call) as i64;
                let mut args = VariantMap::new();
                args.insert("value".into(), Variant::Int(value));
                let result = proxy.invoke_twoway("echo", args).await.unwrap();
                assert_eq!(result, Variant::Int(value));
            }
        }));
    }
    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    let stats = adapter.stats().snapshot();
    assert!(stats.requests_processed >= (CALLERS * CALLS) as u64);

    runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oneway_and_twoway_use_separate_channels() {
    init_logging();
    let runtime = runtime("transport-channels");

    // A slow twoway servant on one adapter must not delay oneway pushes
    // on another.
    let slow_adapter = twoway_adapter(&runtime, "slow").await;
    let mut slow = Servant::new();
    slow.register_operation("slow", |_current, _args| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Variant::Null)
    });
    let slow_proxy = slow_adapter.add("slow", Arc::new(slow)).unwrap();

    let push_adapter = runtime
        .create_adapter("pushes", None, RequestMode::Oneway, None)
        .await
        .unwrap();
    let delivered = Arc::new(Notify::new());
    let delivered_in_servant = Arc::clone(&delivered);
    let mut sink = Servant::new();
    sink.register_operation("push", move |_current, _args| {
        let delivered = Arc::clone(&delivered_in_servant);
        async move {
            delivered.notify_one();
            Ok(Variant::Null)
        }
    });
    let push_proxy = push_adapter.add("sink", Arc::new(sink)).unwrap();

    let slow_call = tokio::spawn(async move {
        slow_proxy.invoke_twoway("slow", VariantMap::new()).await
    });

    // The push lands while the slow twoway call is still in flight.
    push_proxy.invoke_oneway("push", VariantMap::new()).unwrap();
    tokio::time::timeout(Duration::from_millis(200), delivered.notified())
        .await
        .expect("oneway push was blocked behind twoway traffic");

    slow_call.await.unwrap().unwrap();
    runtime.destroy().await;
}
