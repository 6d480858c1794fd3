//! Reply channels
//!
//! The reply channel is an ordered, append-only stream of
//! result/category/department/filter messages terminated by exactly one
//! `finished` (or an implicit finish when the reply is dropped). This
//! module has both halves:
//!
//! - [`SearchReply`] / [`PreviewReply`]: the scope-side handles passed to
//!   user query code. Pushes are oneway and never block; they return `true`
//!   while the channel wants more and `false` once the query was cancelled,
//!   finished, or hit its cardinality limit.
//! - The listener servants registered on the client's reply adapter, which
//!   unmarshal incoming pushes and forward them to an application-supplied
//!   listener, guaranteeing exactly one terminal `finished` call.

use crate::cache::{CacheDocument, SurfacingCache};
use crate::error::{MiddlewareError, Result};
use crate::model::{
    Category, CategoryRegistry, CompletionStatus, Department, Filter, FilterGroup, ScopeResult,
};
use crate::proxy::ReplyProxy;
use crate::query::QueryState;
use crate::reaper::ReapItem;
use crate::servant::Servant;
use scopes_wire::{Variant, VariantArray, VariantMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared scope-side reply logic: pushability checks and the
/// exactly-one-finished guarantee.
struct ReplyCore {
    fwd: ReplyProxy,
    query: Arc<QueryState>,
    finished: AtomicBool,
}

impl ReplyCore {
    fn new(fwd: ReplyProxy, query: Arc<QueryState>) -> Self {
        Self {
            fwd,
            query,
            finished: AtomicBool::new(false),
        }
    }

    fn try_mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }

    fn send_finished(&self, status: CompletionStatus, message: &str) {
        if let Err(e) = self.fwd.finished(status, message) {
            warn!("cannot deliver finished({}): {}", status.as_str(), e);
        }
    }

    fn push_raw(&self, payload: VariantMap) -> bool {
        if !self.query.pushable() {
            // Query was cancelled or failed; late pushes are harmless.
            return false;
        }
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        match self.fwd.push(payload) {
            Ok(()) => true,
            Err(e) => {
                // Only the first thread to hit an error reports it.
                if self.try_mark_finished() {
                    self.send_finished(CompletionStatus::Error, &e.to_string());
                }
                false
            }
        }
    }
}

struct CacheRecorder {
    cache: SurfacingCache,
    document: parking_lot::Mutex<CacheDocument>,
    /// Set while replaying, so a replayed surfacing query does not
    /// overwrite the cache it was replayed from.
    suppress_write: AtomicBool,
}

struct SearchReplyInner {
    core: ReplyCore,
    categories: parking_lot::Mutex<CategoryRegistry>,
    /// 0 means unlimited
    cardinality: usize,
    num_pushes: AtomicUsize,
    recorder: Option<CacheRecorder>,
}

impl SearchReplyInner {
    fn finish_with(&self, status: CompletionStatus, message: &str) {
        if !self.core.try_mark_finished() {
            return;
        }
        // A cancelled or failed query must not overwrite the cache with a
        // partial result set.
        if status == CompletionStatus::Ok && self.core.query.pushable() {
            if let Some(recorder) = &self.recorder {
                if !recorder.suppress_write.load(Ordering::SeqCst) {
                    let document = recorder.document.lock().clone();
                    if let Err(e) = recorder.cache.write(&document) {
                        warn!("cannot write surfacing cache: {}", e);
                    }
                }
            }
        }
        self.core.send_finished(status, message);
    }
}

impl Drop for SearchReplyInner {
    fn drop(&mut self) {
        // Implicit finish when the last handle goes away.
        self.finish_with(CompletionStatus::Ok, "");
    }
}

/// Scope-side reply handle for a search query
#[derive(Clone)]
pub struct SearchReply {
    inner: Arc<SearchReplyInner>,
}

impl SearchReply {
    pub(crate) fn new(
        fwd: ReplyProxy,
        query: Arc<QueryState>,
        cardinality: usize,
        cache: Option<SurfacingCache>,
    ) -> Self {
        Self {
            inner: Arc::new(SearchReplyInner {
                core: ReplyCore::new(fwd, query),
                categories: parking_lot::Mutex::new(CategoryRegistry::new()),
                cardinality,
                num_pushes: AtomicUsize::new(0),
                recorder: cache.map(|cache| CacheRecorder {
                    cache,
                    document: parking_lot::Mutex::new(CacheDocument::default()),
                    suppress_write: AtomicBool::new(false),
                }),
            }),
        }
    }

    /// Register a category. Registering the same id twice is an error.
    pub fn register_category(&self, category: &Category) -> Result<()> {
        self.inner.categories.lock().register(category.clone())?;
        let serialized = category.serialize();
        let mut payload = VariantMap::new();
        payload.insert("category".into(), Variant::Dict(serialized.clone()));
        if self.inner.core.push_raw(payload) {
            if let Some(recorder) = &self.inner.recorder {
                recorder
                    .document
                    .lock()
                    .categories
                    .push(Variant::Dict(serialized));
            }
        }
        Ok(())
    }

    pub fn lookup_category(&self, id: &str) -> Option<Category> {
        self.inner.categories.lock().lookup(id).cloned()
    }

    /// Push the department tree for this query.
    pub fn register_departments(&self, departments: &[Department], current_id: &str) -> bool {
        let payload = Department::serialize_list(departments, current_id);
        let accepted = self.inner.core.push_raw(payload.clone());
        if accepted {
            if let Some(recorder) = &self.inner.recorder {
                recorder
                    .document
                    .lock()
                    .departments
                    .push(Variant::Dict(payload));
            }
        }
        accepted
    }

    /// Push one result.
    ///
    /// Returns `Ok(true)` while the channel wants more results and
    /// `Ok(false)` once no further pushes will be accepted; the push that
    /// reaches the cardinality limit is still delivered, triggers an
    /// implicit `finished()`, and returns `Ok(false)`.
    pub fn push_result(&self, result: &ScopeResult) -> Result<bool> {
        if result.uri.is_empty() {
            return Err(MiddlewareError::Logic(
                "push_result(): result has an empty uri".into(),
            ));
        }

        let serialized = result.serialize();
        let mut payload = VariantMap::new();
        payload.insert("result".into(), Variant::Dict(serialized.clone()));
        if !self.inner.core.push_raw(payload) {
            return Ok(false);
        }
        if let Some(recorder) = &self.inner.recorder {
            recorder
                .document
                .lock()
                .results
                .push(Variant::Dict(serialized));
        }

        // Enforce the cardinality limit (0 means no limit). To the client,
        // a query that exceeds the limit looks like a query that returned
        // the maximum number of results and finished normally. At most one
        // push observes the transition.
        let pushes = self.inner.num_pushes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.cardinality != 0 && pushes == self.inner.cardinality {
            self.inner.finish_with(CompletionStatus::Ok, "");
            return Ok(false); // this was the last accepted push
        }
        Ok(true)
    }

    /// Push filters and their groups.
    pub fn push_filters(&self, filters: &[Filter], groups: &[FilterGroup]) -> bool {
        let payload = Filter::serialize_list(filters, groups);
        let accepted = self.inner.core.push_raw(payload.clone());
        if accepted {
            if let Some(recorder) = &self.inner.recorder {
                let mut document = recorder.document.lock();
                document.filters.push(Variant::Dict(payload));
                for group in groups {
                    document
                        .filter_groups
                        .push(Variant::Dict(group.serialize()));
                }
            }
        }
        accepted
    }

    /// Terminate the channel normally. Idempotent; for a surfacing query
    /// this also writes the accumulated results to the on-disk cache.
    pub fn finished(&self) {
        self.inner.finish_with(CompletionStatus::Ok, "");
    }

    /// Terminate the channel with an error.
    pub fn error(&self, message: &str) {
        self.inner.finish_with(CompletionStatus::Error, message);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.core.finished.load(Ordering::SeqCst)
    }

    /// Replay a previously cached surfacing query instead of running a
    /// live one. A missing or corrupt cache degrades to an immediate empty
    /// `finished()`.
    pub fn push_surfacing_results_from_cache(&self) -> Result<()> {
        let Some(recorder) = &self.inner.recorder else {
            debug!("no surfacing cache configured; finishing empty");
            self.finished();
            return Ok(());
        };
        recorder.suppress_write.store(true, Ordering::SeqCst);

        match recorder.cache.read() {
            Err(e) => {
                debug!("surfacing cache unavailable: {}", e);
            }
            Ok(document) => {
                for category in &document.categories {
                    if let Some(dict) = category.as_dict() {
                        if let Ok(parsed) = Category::from_variant(dict) {
                            // Best effort; a duplicate only means the scope
                            // registered it already.
                            let _ = self.inner.categories.lock().register(parsed);
                        }
                    }
                    let mut payload = VariantMap::new();
                    payload.insert("category".into(), category.clone());
                    self.inner.core.push_raw(payload);
                }
                for departments in &document.departments {
                    if let Some(payload) = departments.as_dict() {
                        self.inner.core.push_raw(payload.clone());
                    }
                }
                for filters in &document.filters {
                    if let Some(payload) = filters.as_dict() {
                        self.inner.core.push_raw(payload.clone());
                    }
                }
                for result in &document.results {
                    let mut payload = VariantMap::new();
                    payload.insert("result".into(), result.clone());
                    self.inner.core.push_raw(payload);
                }
            }
        }

        self.finished();
        Ok(())
    }
}

struct PreviewReplyInner {
    core: ReplyCore,
    layouts_push_disallowed: AtomicBool,
}

impl Drop for PreviewReplyInner {
    fn drop(&mut self) {
        if self.core.try_mark_finished() {
            self.core.send_finished(CompletionStatus::Ok, "");
        }
    }
}

/// Scope-side reply handle for a preview query
#[derive(Clone)]
pub struct PreviewReply {
    inner: Arc<PreviewReplyInner>,
}

impl PreviewReply {
    pub(crate) fn new(fwd: ReplyProxy, query: Arc<QueryState>) -> Self {
        Self {
            inner: Arc::new(PreviewReplyInner {
                core: ReplyCore::new(fwd, query),
                layouts_push_disallowed: AtomicBool::new(false),
            }),
        }
    }

    /// Register column layouts. Only valid before the first widget push.
    pub fn register_layout(&self, layouts: &VariantArray) -> Result<bool> {
        if self.inner.layouts_push_disallowed.load(Ordering::SeqCst) {
            return Err(MiddlewareError::Logic(
                "register_layout(): column layouts must be registered before pushing widgets"
                    .into(),
            ));
        }
        let mut payload = VariantMap::new();
        payload.insert("columns".into(), Variant::Array(layouts.clone()));
        Ok(self.inner.core.push_raw(payload))
    }

    pub fn push_widgets(&self, widgets: &VariantArray) -> bool {
        self.inner
            .layouts_push_disallowed
            .store(true, Ordering::SeqCst);
        let mut payload = VariantMap::new();
        payload.insert("widgets".into(), Variant::Array(widgets.clone()));
        self.inner.core.push_raw(payload)
    }

    pub fn push_data(&self, key: &str, value: Variant) -> bool {
        let mut nested = VariantMap::new();
        nested.insert(key.to_string(), value);
        let mut payload = VariantMap::new();
        payload.insert("preview-data".into(), Variant::Dict(nested));
        self.inner.core.push_raw(payload)
    }

    pub fn finished(&self) {
        if self.inner.core.try_mark_finished() {
            self.inner.core.send_finished(CompletionStatus::Ok, "");
        }
    }

    pub fn error(&self, message: &str) {
        if self.inner.core.try_mark_finished() {
            self.inner
                .core
                .send_finished(CompletionStatus::Error, message);
        }
    }
}

/// Listener for search replies on the client side
///
/// Push callbacks have empty defaults; only `finished` is mandatory.
pub trait SearchListener: Send + Sync + 'static {
    fn push_result(&self, _result: ScopeResult) {}
    fn push_category(&self, _category: Category) {}
    fn push_departments(&self, _departments: Vec<Department>, _current_id: String) {}
    fn push_filters(&self, _filters: Vec<Filter>, _groups: Vec<FilterGroup>) {}
    fn finished(&self, status: CompletionStatus, message: String);
}

/// Listener for preview replies on the client side
pub trait PreviewListener: Send + Sync + 'static {
    fn push_layout(&self, _layouts: VariantArray) {}
    fn push_widgets(&self, _widgets: VariantArray) {}
    fn push_data(&self, _key: String, _value: Variant) {}
    fn finished(&self, status: CompletionStatus, message: String);
}

/// Listener for activation replies on the client side
pub trait ActivationListener: Send + Sync + 'static {
    fn response(&self, _response: crate::model::ActivationResponse) {}
    fn finished(&self, status: CompletionStatus, message: String);
}

/// Client-side per-reply bookkeeping shared between the reply servant, the
/// reaper ticket, and the control handle: whoever delivers the terminal
/// `finished` first wins, and teardown runs once.
pub(crate) struct ReplyGuard {
    finished: AtomicBool,
    reap_item: parking_lot::Mutex<Option<ReapItem>>,
    disconnect: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ReplyGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            finished: AtomicBool::new(false),
            reap_item: parking_lot::Mutex::new(None),
            disconnect: parking_lot::Mutex::new(None),
        })
    }

    pub fn set_reap_item(&self, item: ReapItem) {
        *self.reap_item.lock() = Some(item);
    }

    pub fn set_disconnect(&self, disconnect: impl FnOnce() + Send + 'static) {
        *self.disconnect.lock() = Some(Box::new(disconnect));
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// True for exactly one caller.
    pub fn try_finish(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }

    pub fn refresh(&self) {
        if let Some(item) = &*self.reap_item.lock() {
            item.refresh();
        }
    }

    /// Cancel the idle ticket and unregister the reply servant.
    pub fn teardown(&self) {
        let item = self.reap_item.lock().take();
        if let Some(item) = item {
            item.cancel();
        }
        let disconnect = self.disconnect.lock().take();
        if let Some(disconnect) = disconnect {
            disconnect();
        }
    }
}

fn parse_status(args: &VariantMap) -> (CompletionStatus, String) {
    let status = args
        .get("status")
        .and_then(Variant::as_str)
        .and_then(CompletionStatus::from_str)
        .unwrap_or(CompletionStatus::Error);
    let message = args
        .get("message")
        .and_then(Variant::as_str)
        .unwrap_or_default()
        .to_string();
    (status, message)
}

fn route_search_push(listener: &dyn SearchListener, args: &VariantMap) {
    if let Some(dict) = args.get("result").and_then(Variant::as_dict) {
        match ScopeResult::from_variant(dict) {
            Ok(result) => listener.push_result(result),
            Err(e) => warn!("discarding malformed result push: {}", e),
        }
    }
    if let Some(dict) = args.get("category").and_then(Variant::as_dict) {
        match Category::from_variant(dict) {
            Ok(category) => listener.push_category(category),
            Err(e) => warn!("discarding malformed category push: {}", e),
        }
    }
    if let Some(items) = args.get("departments").and_then(Variant::as_array) {
        let departments: Vec<Department> = items
            .iter()
            .filter_map(Variant::as_dict)
            .filter_map(|d| Department::from_variant(d).ok())
            .collect();
        let current_id = args
            .get("current_department")
            .and_then(Variant::as_str)
            .unwrap_or_default()
            .to_string();
        listener.push_departments(departments, current_id);
    }
    if let Some(items) = args.get("filters").and_then(Variant::as_array) {
        let filters: Vec<Filter> = items
            .iter()
            .filter_map(Variant::as_dict)
            .filter_map(|f| Filter::from_variant(f).ok())
            .collect();
        let groups: Vec<FilterGroup> = args
            .get("filter_groups")
            .and_then(Variant::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Variant::as_dict)
                    .filter_map(|g| FilterGroup::from_variant(g).ok())
                    .collect()
            })
            .unwrap_or_default();
        listener.push_filters(filters, groups);
    }
}

/// Build the servant receiving pushes for one search, forwarding them to
/// `listener`. Late pushes after the terminal `finished` are ignored.
pub(crate) fn search_reply_servant(
    listener: Arc<dyn SearchListener>,
    guard: Arc<ReplyGuard>,
) -> Servant {
    let mut servant = Servant::new();

    let push_listener = Arc::clone(&listener);
    let push_guard = Arc::clone(&guard);
    servant.register_operation("push", move |_current, args| {
        let listener = Arc::clone(&push_listener);
        let guard = Arc::clone(&push_guard);
        async move {
            if !guard.is_finished() {
                guard.refresh();
                route_search_push(&*listener, &args);
            }
            Ok(Variant::Null)
        }
    });

    servant.register_operation("finished", move |_current, args| {
        let listener = Arc::clone(&listener);
        let guard = Arc::clone(&guard);
        async move {
            let (status, message) = parse_status(&args);
            if guard.try_finish() {
                guard.teardown();
                listener.finished(status, message);
            }
            Ok(Variant::Null)
        }
    });

    servant
}

/// Build the servant receiving pushes for one preview.
pub(crate) fn preview_reply_servant(
    listener: Arc<dyn PreviewListener>,
    guard: Arc<ReplyGuard>,
) -> Servant {
    let mut servant = Servant::new();

    let push_listener = Arc::clone(&listener);
    let push_guard = Arc::clone(&guard);
    servant.register_operation("push", move |_current, args| {
        let listener = Arc::clone(&push_listener);
        let guard = Arc::clone(&push_guard);
        async move {
            if !guard.is_finished() {
                guard.refresh();
                if let Some(items) = args.get("columns").and_then(Variant::as_array) {
                    listener.push_layout(items.clone());
                }
                if let Some(items) = args.get("widgets").and_then(Variant::as_array) {
                    listener.push_widgets(items.clone());
                }
                if let Some(dict) = args.get("preview-data").and_then(Variant::as_dict) {
                    for (key, value) in dict {
                        listener.push_data(key.clone(), value.clone());
                    }
                }
            }
            Ok(Variant::Null)
        }
    });

    servant.register_operation("finished", move |_current, args| {
        let listener = Arc::clone(&listener);
        let guard = Arc::clone(&guard);
        async move {
            let (status, message) = parse_status(&args);
            if guard.try_finish() {
                guard.teardown();
                listener.finished(status, message);
            }
            Ok(Variant::Null)
        }
    });

    servant
}

/// Build the servant receiving the activation response.
pub(crate) fn activation_reply_servant(
    listener: Arc<dyn ActivationListener>,
    guard: Arc<ReplyGuard>,
) -> Servant {
    let mut servant = Servant::new();

    let push_listener = Arc::clone(&listener);
    let push_guard = Arc::clone(&guard);
    servant.register_operation("push", move |_current, args| {
        let listener = Arc::clone(&push_listener);
        let guard = Arc::clone(&push_guard);
        async move {
            if !guard.is_finished() {
                guard.refresh();
                if let Some(dict) = args.get("activation_response").and_then(Variant::as_dict) {
                    match crate::model::ActivationResponse::from_variant(dict) {
                        Ok(response) => listener.response(response),
                        Err(e) => warn!("discarding malformed activation response: {}", e),
                    }
                }
            }
            Ok(Variant::Null)
        }
    });

    servant.register_operation("finished", move |_current, args| {
        let listener = Arc::clone(&listener);
        let guard = Arc::clone(&guard);
        async move {
            let (status, message) = parse_status(&args);
            if guard.try_finish() {
                guard.teardown();
                listener.finished(status, message);
            }
            Ok(Variant::Null)
        }
    });

    servant
}
