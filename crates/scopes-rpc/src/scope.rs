//! Scope capability interface and the scope servant
//!
//! A scope is any value implementing [`ScopeBase`]: `start`/`stop` plus the
//! query factories for search, preview, and activation. How the runtime got
//! hold of the value (in-process registration, subprocess, loader) is not
//! the middleware's concern.
//!
//! The [`ScopeObject`] servant receives `search`/`preview`/`activate`/
//! `perform_action` calls, asks the scope for a query object, wires up the
//! control and query servants, starts the query asynchronously, and
//! returns the control proxy to the caller.

use crate::adapter::ObjectAdapter;
use crate::cache::SurfacingCache;
use crate::error::{MiddlewareError, Result};
use crate::model::{
    ActionMetadata, ActivationResponse, ActivationStatus, CannedQuery, CompletionStatus,
    ScopeResult, SearchMetadata,
};
use crate::proxy::{Proxy, ReplyProxy};
use crate::reply::{PreviewReply, SearchReply};
use crate::query::{ctrl_servant, QueryKind, QueryObject, QueryState};
use crate::servant::{Current, Servant};
use scopes_wire::{RequestMode, Variant, VariantMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Version a scope's `start()` must return for the runtime to accept it
pub const SCOPE_ABI_VERSION: i32 = 1;

/// One in-flight search, supplied by the scope's `search` factory
pub trait SearchQuery: Send + Sync + 'static {
    /// Produce results; runs on a dedicated thread and may block freely.
    fn run(&self, reply: SearchReply);

    /// Advisory cancellation callback; invoked at most once. The query is
    /// expected to stop pushing in a timely fashion.
    fn cancelled(&self) {}
}

/// One in-flight preview
pub trait PreviewQuery: Send + Sync + 'static {
    fn run(&self, reply: PreviewReply);
    fn cancelled(&self) {}
}

/// One in-flight activation
pub trait ActivationQuery: Send + Sync + 'static {
    fn activate(&self) -> ActivationResponse;
    fn cancelled(&self) {}
}

struct NotHandledActivation;

impl ActivationQuery for NotHandledActivation {
    fn activate(&self) -> ActivationResponse {
        ActivationResponse::new(ActivationStatus::NotHandled)
    }
}

/// The capability interface every scope implements
pub trait ScopeBase: Send + Sync + 'static {
    /// Called once before any query; must return [`SCOPE_ABI_VERSION`] or
    /// the runtime refuses to serve the scope.
    fn start(&self, _scope_id: &str) -> i32 {
        SCOPE_ABI_VERSION
    }

    /// Called once during orderly shutdown.
    fn stop(&self) {}

    fn search(
        &self,
        query: &CannedQuery,
        metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>>;

    fn preview(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
    ) -> Result<Arc<dyn PreviewQuery>>;

    /// Result activation; the default is "not handled".
    fn activate(
        &self,
        _result: &ScopeResult,
        _metadata: &ActionMetadata,
    ) -> Result<Arc<dyn ActivationQuery>> {
        Ok(Arc::new(NotHandledActivation))
    }

    /// In-preview action activation; the default is "not handled".
    fn perform_action(
        &self,
        _result: &ScopeResult,
        _metadata: &ActionMetadata,
        _widget_id: &str,
        _action_id: &str,
    ) -> Result<Arc<dyn ActivationQuery>> {
        Ok(Arc::new(NotHandledActivation))
    }
}

/// Servant wrapping one [`ScopeBase`] value
pub(crate) struct ScopeObject {
    scope: Arc<dyn ScopeBase>,
    ctrl_adapter: ObjectAdapter,
    query_adapter: ObjectAdapter,
    /// Per-scope directory holding the surfacing cache
    cache_dir: Option<PathBuf>,
}

impl ScopeObject {
    pub fn new(
        scope: Arc<dyn ScopeBase>,
        ctrl_adapter: ObjectAdapter,
        query_adapter: ObjectAdapter,
        cache_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scope,
            ctrl_adapter,
            query_adapter,
            cache_dir,
        })
    }

    fn reply_proxy(&self, current: &Current, args: &VariantMap) -> Result<ReplyProxy> {
        let descriptor = args.get("reply").cloned().unwrap_or(Variant::Null);
        let proxy = Proxy::from_variant(&current.pool, &descriptor, None)?;
        if proxy.mode() != RequestMode::Oneway {
            return Err(MiddlewareError::Logic(
                "reply proxy must be oneway".into(),
            ));
        }
        Ok(ReplyProxy::new(proxy))
    }

    /// Steps shared by all query-producing operations: allocate the control
    /// servant, wrap the query, register the query servant, kick off the
    /// asynchronous run, and hand the control proxy back to the caller.
    fn start_query(&self, reply: ReplyProxy, state: Arc<QueryState>, kind: QueryKind) -> Result<Variant> {
        let target: Arc<OnceLock<Arc<QueryObject>>> = Arc::new(OnceLock::new());
        let ctrl_proxy = self
            .ctrl_adapter
            .add("", Arc::new(ctrl_servant(Arc::clone(&target))))?;

        let query_object = QueryObject::new(kind, state, reply.clone());
        {
            let adapter = self.ctrl_adapter.clone();
            let identity = ctrl_proxy.identity().to_string();
            query_object.set_ctrl_disconnect(move || {
                let _ = adapter.remove(&identity);
            });
        }
        let _ = target.set(Arc::clone(&query_object));

        let query_proxy = self
            .query_adapter
            .add("", Arc::new(query_object.servant()))?;
        {
            let adapter = self.query_adapter.clone();
            let identity = query_proxy.identity().to_string();
            query_object.set_query_disconnect(move || {
                let _ = adapter.remove(&identity);
            });
        }

        // Invoke run() asynchronously so this dispatch thread never blocks
        // on user code.
        let mut run_args = VariantMap::new();
        run_args.insert("reply".into(), reply.proxy().to_variant());
        if let Err(e) = query_proxy.invoke_oneway("run", run_args) {
            query_object.destroy();
            return Err(e);
        }

        Ok(ctrl_proxy.to_variant())
    }

    /// Report a failed query factory: the caller's reply gets a
    /// best-effort `finished(Error)` and the invocation itself fails with
    /// a resource error.
    fn factory_failed(&self, reply: &ReplyProxy, message: String) -> MiddlewareError {
        warn!("query factory failed: {}", message);
        if let Err(e) = reply.finished(CompletionStatus::Error, &message) {
            warn!("cannot deliver finished(error): {}", e);
        }
        MiddlewareError::Resource(message)
    }

    fn handle_search(&self, current: &Current, args: &VariantMap) -> Result<Variant> {
        let reply = self.reply_proxy(current, args)?;
        let query = args
            .get("query")
            .and_then(Variant::as_dict)
            .ok_or_else(|| MiddlewareError::Logic("search: missing query".into()))
            .and_then(CannedQuery::from_variant)?;
        let metadata = args
            .get("hints")
            .and_then(Variant::as_dict)
            .map(SearchMetadata::from_variant)
            .transpose()?
            .unwrap_or_else(|| SearchMetadata::new("", ""));

        let scope = Arc::clone(&self.scope);
        let produced = catch_unwind(AssertUnwindSafe(|| scope.search(&query, &metadata)));
        let search_query = match produced {
            Ok(Ok(search_query)) => search_query,
            Ok(Err(e)) => return Err(self.factory_failed(&reply, e.to_string())),
            Err(_) => {
                return Err(self.factory_failed(&reply, "search factory panicked".into()))
            }
        };

        let cache = if query.is_surfacing() {
            self.cache_dir
                .as_deref()
                .map(SurfacingCache::new)
        } else {
            None
        };

        self.start_query(
            reply,
            Arc::new(QueryState::new()),
            QueryKind::Search {
                query: search_query,
                cardinality: metadata.cardinality,
                cache,
            },
        )
    }

    fn handle_preview(&self, current: &Current, args: &VariantMap) -> Result<Variant> {
        let reply = self.reply_proxy(current, args)?;
        let result = args
            .get("result")
            .and_then(Variant::as_dict)
            .ok_or_else(|| MiddlewareError::Logic("preview: missing result".into()))
            .and_then(ScopeResult::from_variant)?;
        let metadata = self.action_metadata(args)?;

        let scope = Arc::clone(&self.scope);
        let produced = catch_unwind(AssertUnwindSafe(|| scope.preview(&result, &metadata)));
        let preview_query = match produced {
            Ok(Ok(preview_query)) => preview_query,
            Ok(Err(e)) => return Err(self.factory_failed(&reply, e.to_string())),
            Err(_) => {
                return Err(self.factory_failed(&reply, "preview factory panicked".into()))
            }
        };

        self.start_query(
            reply,
            Arc::new(QueryState::new()),
            QueryKind::Preview {
                query: preview_query,
            },
        )
    }

    fn handle_activation(
        &self,
        current: &Current,
        args: &VariantMap,
        op_name: &str,
    ) -> Result<Variant> {
        let reply = self.reply_proxy(current, args)?;
        let result = args
            .get("result")
            .and_then(Variant::as_dict)
            .ok_or_else(|| MiddlewareError::Logic(format!("{}: missing result", op_name)))
            .and_then(ScopeResult::from_variant)?;
        let metadata = self.action_metadata(args)?;

        let scope = Arc::clone(&self.scope);
        let produced = if op_name == "perform_action" {
            let widget_id = args
                .get("widget_id")
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string();
            let action_id = args
                .get("action_id")
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string();
            catch_unwind(AssertUnwindSafe(|| {
                scope.perform_action(&result, &metadata, &widget_id, &action_id)
            }))
        } else {
            catch_unwind(AssertUnwindSafe(|| scope.activate(&result, &metadata)))
        };

        let activation_query = match produced {
            Ok(Ok(activation_query)) => activation_query,
            Ok(Err(e)) => return Err(self.factory_failed(&reply, e.to_string())),
            Err(_) => {
                return Err(
                    self.factory_failed(&reply, format!("{} factory panicked", op_name))
                )
            }
        };

        self.start_query(
            reply,
            Arc::new(QueryState::new()),
            QueryKind::Activation {
                query: activation_query,
            },
        )
    }

    /// Build the servant exposing this scope on its adapter.
    pub fn servant(self: &Arc<Self>) -> Servant {
        let mut servant = Servant::new();

        let scope_object = Arc::clone(self);
        servant.register_operation("search", move |current, args| {
            let scope_object = Arc::clone(&scope_object);
            async move { scope_object.handle_search(&current, &args) }
        });

        let scope_object = Arc::clone(self);
        servant.register_operation("preview", move |current, args| {
            let scope_object = Arc::clone(&scope_object);
            async move { scope_object.handle_preview(&current, &args) }
        });

        let scope_object = Arc::clone(self);
        servant.register_operation("activate", move |current, args| {
            let scope_object = Arc::clone(&scope_object);
            async move { scope_object.handle_activation(&current, &args, "activate") }
        });

        let scope_object = Arc::clone(self);
        servant.register_operation("perform_action", move |current, args| {
            let scope_object = Arc::clone(&scope_object);
            async move { scope_object.handle_activation(&current, &args, "perform_action") }
        });

        servant
    }

    fn action_metadata(&self, args: &VariantMap) -> Result<ActionMetadata> {
        Ok(args
            .get("hints")
            .and_then(Variant::as_dict)
            .map(ActionMetadata::from_variant)
            .transpose()?
            .unwrap_or_else(|| ActionMetadata::new("", "")))
    }
}
