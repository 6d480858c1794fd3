//! Query lifecycle servants
//!
//! One [`QueryObject`] and one control servant exist per in-flight query.
//! The control servant forwards `cancel()` to the query object; the query
//! object runs the user-supplied query code on a dedicated blocking thread
//! and owns the pushability flag consulted by the reply handles.
//!
//! Cancellation is advisory: it flips the pushability flag, delivers the
//! terminal `finished(Cancelled)` to the client, and invokes the user's
//! `cancelled()` callback exactly once. In-flight user code is never
//! forcibly interrupted; stray late pushes are silently dropped.

use crate::cache::SurfacingCache;
use crate::model::CompletionStatus;
use crate::proxy::ReplyProxy;
use crate::reply::{PreviewReply, SearchReply};
use crate::scope::{ActivationQuery, PreviewQuery, SearchQuery};
use crate::servant::Servant;
use scopes_wire::{Variant, VariantMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Pushability flag shared between a query object and its reply handles
pub(crate) struct QueryState {
    pushable: AtomicBool,
}

impl QueryState {
    pub fn new() -> Self {
        Self {
            pushable: AtomicBool::new(true),
        }
    }

    pub fn pushable(&self) -> bool {
        self.pushable.load(Ordering::SeqCst)
    }

    pub fn disable_push(&self) {
        self.pushable.store(false, Ordering::SeqCst);
    }
}

/// The user-code variants a query object can wrap
pub(crate) enum QueryKind {
    Search {
        query: Arc<dyn SearchQuery>,
        cardinality: usize,
        cache: Option<SurfacingCache>,
    },
    Preview {
        query: Arc<dyn PreviewQuery>,
    },
    Activation {
        query: Arc<dyn ActivationQuery>,
    },
}

type Disconnect = Box<dyn FnOnce() + Send>;

/// Server-side wrapper around one in-flight query
pub(crate) struct QueryObject {
    kind: QueryKind,
    state: Arc<QueryState>,
    reply: ReplyProxy,
    cancelled: AtomicBool,
    ctrl_disconnect: parking_lot::Mutex<Option<Disconnect>>,
    query_disconnect: parking_lot::Mutex<Option<Disconnect>>,
}

impl QueryObject {
    pub fn new(kind: QueryKind, state: Arc<QueryState>, reply: ReplyProxy) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state,
            reply,
            cancelled: AtomicBool::new(false),
            ctrl_disconnect: parking_lot::Mutex::new(None),
            query_disconnect: parking_lot::Mutex::new(None),
        })
    }

    pub fn set_ctrl_disconnect(&self, disconnect: impl FnOnce() + Send + 'static) {
        *self.ctrl_disconnect.lock() = Some(Box::new(disconnect));
    }

    pub fn set_query_disconnect(&self, disconnect: impl FnOnce() + Send + 'static) {
        *self.query_disconnect.lock() = Some(Box::new(disconnect));
    }

    /// Cancel this query. Idempotent: only the first call informs the
    /// client and the user code.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.disable_push();

        // Tell the client the query is done. The reply servant dedups
        // against an already delivered terminal finished.
        if let Err(e) = self.reply.finished(CompletionStatus::Cancelled, "") {
            debug!("cannot deliver finished(cancelled): {}", e);
        }

        match &self.kind {
            QueryKind::Search { query, .. } => query.cancelled(),
            QueryKind::Preview { query } => query.cancelled(),
            QueryKind::Activation { query } => query.cancelled(),
        }
    }

    /// Unregister the control and query servants.
    pub fn destroy(&self) {
        if let Some(disconnect) = self.ctrl_disconnect.lock().take() {
            disconnect();
        }
        if let Some(disconnect) = self.query_disconnect.lock().take() {
            disconnect();
        }
    }

    /// Run the wrapped query. User code executes on a dedicated blocking
    /// thread; failures surface as a best-effort `finished(Error)` and
    /// never reach the dispatch loop.
    pub async fn run(self: Arc<Self>, reply_proxy: ReplyProxy) {
        // The query may have been cancelled before this run was
        // dispatched; in that case user code is never invoked.
        if !self.state.pushable() {
            return;
        }

        let query_object = Arc::clone(&self);
        let joined = tokio::task::spawn_blocking(move || {
            query_object.run_blocking(reply_proxy);
        })
        .await;

        if let Err(e) = joined {
            self.state.disable_push();
            warn!("query run thread failed: {}", e);
            if let Err(e) = self
                .reply
                .finished(CompletionStatus::Error, "query run thread failed")
            {
                debug!("cannot deliver finished(error): {}", e);
            }
        }

        // Routing for run() is no longer needed once user code returned;
        // the reply handles keep the query object alive as long as pushes
        // are possible.
        if let Some(disconnect) = self.query_disconnect.lock().take() {
            disconnect();
        }
    }

    fn run_blocking(&self, reply_proxy: ReplyProxy) {
        match &self.kind {
            QueryKind::Search {
                query,
                cardinality,
                cache,
            } => {
                let reply = SearchReply::new(
                    reply_proxy,
                    Arc::clone(&self.state),
                    *cardinality,
                    cache.clone(),
                );
                let run_reply = reply.clone();
                let query = Arc::clone(query);
                if catch_unwind(AssertUnwindSafe(move || query.run(run_reply))).is_err() {
                    self.state.disable_push();
                    warn!("SearchQuery::run() panicked");
                    reply.error("unhandled error in query run()");
                }
                // Dropping the last reply handle finishes the channel if
                // the query did not.
            }
            QueryKind::Preview { query } => {
                let reply = PreviewReply::new(reply_proxy, Arc::clone(&self.state));
                let run_reply = reply.clone();
                let query = Arc::clone(query);
                if catch_unwind(AssertUnwindSafe(move || query.run(run_reply))).is_err() {
                    self.state.disable_push();
                    warn!("PreviewQuery::run() panicked");
                    reply.error("unhandled error in preview run()");
                }
            }
            QueryKind::Activation { query } => {
                let query = Arc::clone(query);
                match catch_unwind(AssertUnwindSafe(move || query.activate())) {
                    Ok(response) => {
                        let mut payload = VariantMap::new();
                        payload
                            .insert("activation_response".into(), Variant::Dict(response.serialize()));
                        if let Err(e) = reply_proxy.push(payload) {
                            debug!("cannot deliver activation response: {}", e);
                        }
                        if let Err(e) = reply_proxy.finished(CompletionStatus::Ok, "") {
                            debug!("cannot deliver finished(ok): {}", e);
                        }
                    }
                    Err(_) => {
                        warn!("ActivationQuery::activate() panicked");
                        if let Err(e) = reply_proxy.finished(
                            CompletionStatus::Error,
                            "unhandled error in activate()",
                        ) {
                            debug!("cannot deliver finished(error): {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Build the servant dispatching `run` to this query object.
    pub fn servant(self: &Arc<Self>) -> Servant {
        let query_object = Arc::clone(self);
        let mut servant = Servant::new();
        servant.register_operation("run", move |current, args| {
            let query_object = Arc::clone(&query_object);
            async move {
                let reply_descriptor = args.get("reply").cloned().unwrap_or(Variant::Null);
                let proxy = crate::proxy::Proxy::from_variant(&current.pool, &reply_descriptor, None)?;
                query_object.run(ReplyProxy::new(proxy)).await;
                Ok(Variant::Null)
            }
        });
        servant
    }
}

/// Build the control servant for a query.
///
/// The target is bound after registration (the control proxy must exist
/// before the query object is created); `cancel`/`destroy` before binding
/// are dropped, which can only happen if query creation itself failed.
pub(crate) fn ctrl_servant(target: Arc<OnceLock<Arc<QueryObject>>>) -> Servant {
    let mut servant = Servant::new();

    let cancel_target = Arc::clone(&target);
    servant.register_operation("cancel", move |_current, _args| {
        let target = Arc::clone(&cancel_target);
        async move {
            if let Some(query_object) = target.get() {
                query_object.cancel();
            }
            Ok(Variant::Null)
        }
    });

    servant.register_operation("destroy", move |_current, _args| {
        let target = Arc::clone(&target);
        async move {
            if let Some(query_object) = target.get() {
                query_object.destroy();
            }
            Ok(Variant::Null)
        }
    });

    servant
}
