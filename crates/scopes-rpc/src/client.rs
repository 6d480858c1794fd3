//! Client-side scope access
//!
//! A [`ScopeClient`] wraps a twoway proxy to a remote scope. For every
//! query it registers a reply servant on the client's oneway reply adapter,
//! hands the reply proxy to the scope, and returns a [`QueryCtrlHandle`]
//! for cancellation.
//!
//! The client guarantees exactly one terminal `finished` per query, no
//! matter what happens remotely: a normal finish arrives through the reply
//! servant; a create-query failure or a local cancel is delivered locally;
//! and if the scope goes silent (crash, network loss), the runtime's reply
//! reaper expires the reply servant and synthesizes `finished(Error)`.

use crate::adapter::ObjectAdapter;
use crate::error::Result;
use crate::model::{ActionMetadata, CannedQuery, CompletionStatus, ScopeResult, SearchMetadata};
use crate::proxy::{Proxy, QueryCtrlProxy, ScopeProxy};
use crate::reaper::Reaper;
use crate::reply::{
    activation_reply_servant, preview_reply_servant, search_reply_servant, ActivationListener,
    PreviewListener, ReplyGuard, SearchListener,
};
use crate::servant::Servant;
use std::sync::Arc;
use tracing::debug;

type LocalFinish = Box<dyn Fn(CompletionStatus, String) + Send + Sync>;

/// Control handle for one in-flight query
pub struct QueryCtrlHandle {
    ctrl: QueryCtrlProxy,
    guard: Arc<ReplyGuard>,
    local_finish: LocalFinish,
}

impl QueryCtrlHandle {
    /// Cancel the query. Oneway and idempotent; the listener immediately
    /// receives `finished(Cancelled)` locally, and late pushes from the
    /// scope are dropped.
    pub fn cancel(&self) {
        if let Err(e) = self.ctrl.cancel() {
            debug!("cannot deliver cancel: {}", e);
        }
        if self.guard.try_finish() {
            self.guard.teardown();
            (self.local_finish)(CompletionStatus::Cancelled, String::new());
        }
    }
}

impl Drop for QueryCtrlHandle {
    fn drop(&mut self) {
        // Tell the scope it may release the control and query servants.
        if let Err(e) = self.ctrl.destroy() {
            debug!("cannot deliver destroy: {}", e);
        }
    }
}

/// Client-side handle to one remote scope
pub struct ScopeClient {
    scope: ScopeProxy,
    reply_adapter: ObjectAdapter,
    reply_reaper: Arc<Reaper>,
}

impl ScopeClient {
    pub(crate) fn new(
        scope: ScopeProxy,
        reply_adapter: ObjectAdapter,
        reply_reaper: Arc<Reaper>,
    ) -> Self {
        Self {
            scope,
            reply_adapter,
            reply_reaper,
        }
    }

    pub fn proxy(&self) -> &ScopeProxy {
        &self.scope
    }

    pub async fn ping(&self) -> Result<()> {
        self.scope.ping().await
    }

    /// Register a reply servant wired to `guard`, with idle-expiry through
    /// the reply reaper and a disconnect that unregisters the servant.
    fn register_reply(
        &self,
        servant: Servant,
        guard: &Arc<ReplyGuard>,
        local_finish: &Arc<dyn Fn(CompletionStatus, String) + Send + Sync>,
    ) -> Result<Proxy> {
        let reply_proxy = self.reply_adapter.add("", Arc::new(servant))?;

        let adapter = self.reply_adapter.clone();
        let identity = reply_proxy.identity().to_string();
        guard.set_disconnect(move || {
            let _ = adapter.remove(&identity);
        });

        let expiry_guard = Arc::clone(guard);
        let expiry_finish = Arc::clone(local_finish);
        let item = self.reply_reaper.add(move || {
            if expiry_guard.try_finish() {
                expiry_guard.teardown();
                expiry_finish(
                    CompletionStatus::Error,
                    "timed out waiting for scope activity".into(),
                );
            }
        })?;
        guard.set_reap_item(item);

        Ok(reply_proxy)
    }

    fn finish_query(
        &self,
        created: Result<QueryCtrlProxy>,
        guard: Arc<ReplyGuard>,
        local_finish: Arc<dyn Fn(CompletionStatus, String) + Send + Sync>,
    ) -> Result<QueryCtrlHandle> {
        match created {
            Ok(ctrl) => Ok(QueryCtrlHandle {
                ctrl,
                guard,
                local_finish: Box::new(move |status, message| local_finish(status, message)),
            }),
            Err(e) => {
                // The scope never got a usable query; deliver the terminal
                // finished locally.
                if guard.try_finish() {
                    guard.teardown();
                    local_finish(CompletionStatus::Error, e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Start a search; results stream to `listener`.
    pub async fn search(
        &self,
        query: &CannedQuery,
        metadata: &SearchMetadata,
        listener: Arc<dyn SearchListener>,
    ) -> Result<QueryCtrlHandle> {
        let guard = ReplyGuard::new();
        let servant = search_reply_servant(Arc::clone(&listener), Arc::clone(&guard));
        let finish_listener = Arc::clone(&listener);
        let local_finish: Arc<dyn Fn(CompletionStatus, String) + Send + Sync> =
            Arc::new(move |status, message| finish_listener.finished(status, message));

        let reply_proxy = self.register_reply(servant, &guard, &local_finish)?;
        let created = self.scope.search(query, metadata, &reply_proxy).await;
        self.finish_query(created, guard, local_finish)
    }

    /// Start a preview of `result`.
    pub async fn preview(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
        listener: Arc<dyn PreviewListener>,
    ) -> Result<QueryCtrlHandle> {
        let guard = ReplyGuard::new();
        let servant = preview_reply_servant(Arc::clone(&listener), Arc::clone(&guard));
        let finish_listener = Arc::clone(&listener);
        let local_finish: Arc<dyn Fn(CompletionStatus, String) + Send + Sync> =
            Arc::new(move |status, message| finish_listener.finished(status, message));

        let reply_proxy = self.register_reply(servant, &guard, &local_finish)?;
        let created = self.scope.preview(result, metadata, &reply_proxy).await;
        self.finish_query(created, guard, local_finish)
    }

    /// Activate `result`.
    pub async fn activate(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
        listener: Arc<dyn ActivationListener>,
    ) -> Result<QueryCtrlHandle> {
        let guard = ReplyGuard::new();
        let servant = activation_reply_servant(Arc::clone(&listener), Arc::clone(&guard));
        let finish_listener = Arc::clone(&listener);
        let local_finish: Arc<dyn Fn(CompletionStatus, String) + Send + Sync> =
            Arc::new(move |status, message| finish_listener.finished(status, message));

        let reply_proxy = self.register_reply(servant, &guard, &local_finish)?;
        let created = self.scope.activate(result, metadata, &reply_proxy).await;
        self.finish_query(created, guard, local_finish)
    }

    /// Activate an action within a previewed result.
    pub async fn perform_action(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
        widget_id: &str,
        action_id: &str,
        listener: Arc<dyn ActivationListener>,
    ) -> Result<QueryCtrlHandle> {
        let guard = ReplyGuard::new();
        let servant = activation_reply_servant(Arc::clone(&listener), Arc::clone(&guard));
        let finish_listener = Arc::clone(&listener);
        let local_finish: Arc<dyn Fn(CompletionStatus, String) + Send + Sync> =
            Arc::new(move |status, message| finish_listener.finished(status, message));

        let reply_proxy = self.register_reply(servant, &guard, &local_finish)?;
        let created = self
            .scope
            .perform_action(result, metadata, widget_id, action_id, &reply_proxy)
            .await;
        self.finish_query(created, guard, local_finish)
    }
}
