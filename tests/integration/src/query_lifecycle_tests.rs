//! Query lifecycle across two runtimes (scope process and shell process)

mod common;

use common::*;
use parking_lot::Mutex;
use scopes_rpc::{
    ActionMetadata, ActivationListener, ActivationResponse, ActivationStatus, CannedQuery,
    Category, CompletionStatus, MiddlewareError, PreviewListener, PreviewQuery, PreviewReply,
    Result, ScopeBase, ScopeResult, SearchListener, SearchMetadata, SearchQuery, SearchReply,
    Variant, VariantArray,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Scope pushing a fixed number of results under one category
struct CountingScope {
    results: usize,
    cancelled: Arc<AtomicUsize>,
}

struct CountingQuery {
    results: usize,
    cancelled: Arc<AtomicUsize>,
}

impl SearchQuery for CountingQuery {
    fn run(&self, reply: SearchReply) {
        reply
            .register_category(&Category::new("all", "Everything"))
            .unwrap();
        for i in 0..self.results {
            let result = ScopeResult::new(format!("scope://item/{}", i), format!("Item {}", i))
                .with_category("all");
            if !reply.push_result(&result).unwrap() {
                return; // cardinality reached or query finished
            }
        }
        reply.finished();
    }

    fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScopeBase for CountingScope {
    fn search(
        &self,
        _query: &CannedQuery,
        _metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>> {
        Ok(Arc::new(CountingQuery {
            results: self.results,
            cancelled: Arc::clone(&self.cancelled),
        }))
    }

    fn preview(
        &self,
        result: &ScopeResult,
        _metadata: &ActionMetadata,
    ) -> Result<Arc<dyn PreviewQuery>> {
        Ok(Arc::new(EchoPreview {
            uri: result.uri.clone(),
        }))
    }
}

struct EchoPreview {
    uri: String,
}

impl PreviewQuery for EchoPreview {
    fn run(&self, reply: PreviewReply) {
        let widgets: VariantArray = vec![Variant::from(self.uri.clone())];
        reply.push_widgets(&widgets);
        reply.finished();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_roundtrip() {
    init_logging();
    let server_runtime = runtime("scope-count");
    let server = server_runtime
        .run_scope(
            Arc::new(CountingScope {
                results: 5,
                cancelled: Arc::new(AtomicUsize::new(0)),
            }),
            None,
        )
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = CollectingListener::new();
    client
        .search(
            &CannedQuery::new("scope-count", "anything"),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();
    listener.wait_finished().await;

    assert_eq!(listener.finish_status(), Some(CompletionStatus::Ok));
    assert_eq!(listener.result_uris().len(), 5);
    assert_eq!(listener.collected.lock().categories[0].id, "all");

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cardinality_limits_results_over_the_wire() {
    init_logging();
    let server_runtime = runtime("scope-many");
    let server = server_runtime
        .run_scope(
            Arc::new(CountingScope {
                results: 50,
                cancelled: Arc::new(AtomicUsize::new(0)),
            }),
            None,
        )
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = CollectingListener::new();
    client
        .search(
            &CannedQuery::new("scope-many", "q"),
            &SearchMetadata::new("en_US", "desktop").with_cardinality(3),
            listener.clone(),
        )
        .await
        .unwrap();
    listener.wait_finished().await;

    assert_eq!(listener.finish_status(), Some(CompletionStatus::Ok));
    assert_eq!(listener.result_uris().len(), 3);

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

/// Factory failure: the scope cannot produce a query object, the caller
/// sees a resource error, and the listener still gets exactly one
/// terminal finished.
struct BrokenScope;

impl ScopeBase for BrokenScope {
    fn search(
        &self,
        _query: &CannedQuery,
        _metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>> {
        Err(MiddlewareError::Resource("search factory is broken".into()))
    }

    fn preview(
        &self,
        _result: &ScopeResult,
        _metadata: &ActionMetadata,
    ) -> Result<Arc<dyn PreviewQuery>> {
        Err(MiddlewareError::Resource("preview factory is broken".into()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_factory_failure_reports_error_finish() {
    init_logging();
    let server_runtime = runtime("scope-broken");
    let server = server_runtime
        .run_scope(Arc::new(BrokenScope), None)
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = CollectingListener::new();
    let created = client
        .search(
            &CannedQuery::new("scope-broken", "q"),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await;
    assert!(matches!(created, Err(MiddlewareError::Resource(_))));

    listener.wait_finished().await;
    let collected = listener.collected.lock();
    assert_eq!(collected.finished.len(), 1);
    assert_eq!(collected.finished[0].0, CompletionStatus::Error);
    drop(collected);

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

/// Scope that pushes slowly until cancelled
struct SlowScope {
    cancelled: Arc<AtomicUsize>,
    started: Arc<Notify>,
}

struct SlowQuery {
    cancelled: Arc<AtomicUsize>,
    started: Arc<Notify>,
}

impl SearchQuery for SlowQuery {
    fn run(&self, reply: SearchReply) {
        self.started.notify_one();
        for i in 0..100 {
            let result = ScopeResult::new(format!("scope://slow/{}", i), "slow");
            match reply.push_result(&result) {
                Ok(true) => std::thread::sleep(Duration::from_millis(20)),
                _ => return, // cancelled() flipped the pushability flag
            }
        }
        reply.finished();
    }

    fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScopeBase for SlowScope {
    fn search(
        &self,
        _query: &CannedQuery,
        _metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>> {
        Ok(Arc::new(SlowQuery {
            cancelled: Arc::clone(&self.cancelled),
            started: Arc::clone(&self.started),
        }))
    }

    fn preview(
        &self,
        _result: &ScopeResult,
        _metadata: &ActionMetadata,
    ) -> Result<Arc<dyn PreviewQuery>> {
        Err(MiddlewareError::Resource("no preview".into()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_is_idempotent_and_stops_the_query() {
    init_logging();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());

    let server_runtime = runtime("scope-slow");
    let server = server_runtime
        .run_scope(
            Arc::new(SlowScope {
                cancelled: Arc::clone(&cancelled),
                started: Arc::clone(&started),
            }),
            None,
        )
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = CollectingListener::new();
    let ctrl = client
        .search(
            &CannedQuery::new("scope-slow", "q"),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("query never started");
    tokio::time::sleep(Duration::from_millis(50)).await;

    ctrl.cancel();
    ctrl.cancel(); // second cancel is a harmless no-op

    listener.wait_finished().await;
    assert_eq!(listener.finish_status(), Some(CompletionStatus::Cancelled));
    assert_eq!(listener.collected.lock().finished.len(), 1);

    // Give the oneway cancel time to reach the query object, then verify
    // the query saw exactly one cancelled() upcall.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

/// Scope whose query holds the reply open forever: the client's reply
/// reaper must synthesize a terminal Error finish.
struct StallingScope {
    parked_reply: Mutex<Option<SearchReply>>,
}

struct StallingQuery {
    parked: Arc<StallingScope>,
}

impl SearchQuery for StallingQuery {
    fn run(&self, reply: SearchReply) {
        let _ = reply.push_result(&ScopeResult::new("scope://stall/0", "first"));
        // Keep the reply alive so no implicit finished is sent.
        *self.parked.parked_reply.lock() = Some(reply);
    }
}

impl ScopeBase for Parked {
    fn search(
        &self,
        _query: &CannedQuery,
        _metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>> {
        Ok(Arc::new(StallingQuery {
            parked: Arc::clone(&self.0),
        }))
    }

    fn preview(
        &self,
        _result: &ScopeResult,
        _metadata: &ActionMetadata,
    ) -> Result<Arc<dyn PreviewQuery>> {
        Err(MiddlewareError::Resource("no preview".into()))
    }
}

struct Parked(Arc<StallingScope>);

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_scope_triggers_synthesized_error_finish() {
    init_logging();
    let stalling = Arc::new(StallingScope {
        parked_reply: Mutex::new(None),
    });

    let server_runtime = runtime("scope-stall");
    let server = server_runtime
        .run_scope(Arc::new(Parked(Arc::clone(&stalling))), None)
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = CollectingListener::new();
    client
        .search(
            &CannedQuery::new("scope-stall", "q"),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();

    // reply_idle_timeout is 2s in the test config; the reaper fires within
    // expiry + reap interval.
    listener.wait_finished_for(Duration::from_secs(8)).await;
    let collected = listener.collected.lock();
    assert_eq!(collected.finished.len(), 1);
    assert_eq!(collected.finished[0].0, CompletionStatus::Error);
    assert_eq!(collected.results.len(), 1);
    drop(collected);

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

struct WidgetListener {
    widgets: Mutex<VariantArray>,
    finished: Mutex<Vec<CompletionStatus>>,
    done: Notify,
}

impl PreviewListener for WidgetListener {
    fn push_widgets(&self, widgets: VariantArray) {
        self.widgets.lock().extend(widgets);
    }
    fn finished(&self, status: CompletionStatus, _message: String) {
        self.finished.lock().push(status);
        self.done.notify_one();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preview_roundtrip() {
    init_logging();
    let server_runtime = runtime("scope-preview");
    let server = server_runtime
        .run_scope(
            Arc::new(CountingScope {
                results: 1,
                cancelled: Arc::new(AtomicUsize::new(0)),
            }),
            None,
        )
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = Arc::new(WidgetListener {
        widgets: Mutex::new(Vec::new()),
        finished: Mutex::new(Vec::new()),
        done: Notify::new(),
    });
    client
        .preview(
            &ScopeResult::new("scope://item/0", "Item 0"),
            &ActionMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), listener.done.notified())
        .await
        .expect("preview never finished");
    assert_eq!(*listener.finished.lock(), vec![CompletionStatus::Ok]);
    assert_eq!(
        *listener.widgets.lock(),
        vec![Variant::from("scope://item/0")]
    );

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

struct ResponseListener {
    response: Mutex<Option<ActivationResponse>>,
    done: Notify,
}

impl ActivationListener for ResponseListener {
    fn response(&self, response: ActivationResponse) {
        *self.response.lock() = Some(response);
    }
    fn finished(&self, _status: CompletionStatus, _message: String) {
        self.done.notify_one();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_activation_defaults_to_not_handled() {
    init_logging();
    let server_runtime = runtime("scope-activate");
    let server = server_runtime
        .run_scope(
            Arc::new(CountingScope {
                results: 1,
                cancelled: Arc::new(AtomicUsize::new(0)),
            }),
            None,
        )
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = Arc::new(ResponseListener {
        response: Mutex::new(None),
        done: Notify::new(),
    });
    client
        .activate(
            &ScopeResult::new("scope://item/0", "Item 0"),
            &ActionMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), listener.done.notified())
        .await
        .expect("activation never finished");
    assert_eq!(
        listener.response.lock().as_ref().unwrap().status,
        ActivationStatus::NotHandled
    );

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_default_impls_only_need_finished() {
    init_logging();

    struct FinishOnly {
        done: Notify,
    }
    impl SearchListener for FinishOnly {
        fn finished(&self, _status: CompletionStatus, _message: String) {
            self.done.notify_one();
        }
    }

    let server_runtime = runtime("scope-min");
    let server = server_runtime
        .run_scope(
            Arc::new(CountingScope {
                results: 2,
                cancelled: Arc::new(AtomicUsize::new(0)),
            }),
            None,
        )
        .await
        .unwrap();

    let client_runtime = runtime("shell");
    let client = client_runtime
        .create_scope_client(server.proxy().clone())
        .await
        .unwrap();

    let listener = Arc::new(FinishOnly {
        done: Notify::new(),
    });
    client
        .search(
            &CannedQuery::new("scope-min", "q"),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), listener.done.notified())
        .await
        .expect("finished not delivered");

    client_runtime.destroy().await;
    server_runtime.destroy().await;
}
