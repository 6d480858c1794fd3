//! Shared helpers for the integration suite
#![allow(dead_code)]

use parking_lot::Mutex;
use scopes_rpc::{
    Category, CompletionStatus, Department, Filter, FilterGroup, Runtime, RuntimeConfig,
    ScopeResult, SearchListener,
};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::Notify;

static INIT_LOGGING: Once = Once::new();

pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A runtime configuration with short timeouts suitable for tests.
pub fn quick_config() -> RuntimeConfig {
    RuntimeConfig {
        default_twoway_timeout: Duration::from_secs(2),
        reply_idle_timeout: Duration::from_secs(2),
        reap_interval: Duration::from_secs(1),
        ..RuntimeConfig::default()
    }
}

pub fn runtime(scope_id: &str) -> Runtime {
    Runtime::create(scope_id, quick_config()).unwrap()
}

/// Everything one search delivered to the client
#[derive(Default)]
pub struct Collected {
    pub results: Vec<ScopeResult>,
    pub categories: Vec<Category>,
    pub departments: Vec<(Vec<Department>, String)>,
    pub filters: Vec<(Vec<Filter>, Vec<FilterGroup>)>,
    pub finished: Vec<(CompletionStatus, String)>,
}

/// Search listener recording every delivery and signalling the terminal
/// `finished`.
pub struct CollectingListener {
    pub collected: Mutex<Collected>,
    done: Notify,
}

impl CollectingListener {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            collected: Mutex::new(Collected::default()),
            done: Notify::new(),
        })
    }

    pub async fn wait_finished(&self) {
        self.wait_finished_for(Duration::from_secs(10)).await;
    }

    pub async fn wait_finished_for(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.done.notified())
            .await
            .expect("terminal finished not delivered in time");
    }

    pub fn finish_status(&self) -> Option<CompletionStatus> {
        self.collected.lock().finished.first().map(|(status, _)| *status)
    }

    pub fn result_uris(&self) -> Vec<String> {
        self.collected
            .lock()
            .results
            .iter()
            .map(|result| result.uri.clone())
            .collect()
    }
}

impl SearchListener for CollectingListener {
    fn push_result(&self, result: ScopeResult) {
        self.collected.lock().results.push(result);
    }

    fn push_category(&self, category: Category) {
        self.collected.lock().categories.push(category);
    }

    fn push_departments(&self, departments: Vec<Department>, current_id: String) {
        self.collected.lock().departments.push((departments, current_id));
    }

    fn push_filters(&self, filters: Vec<Filter>, groups: Vec<FilterGroup>) {
        self.collected.lock().filters.push((filters, groups));
    }

    fn finished(&self, status: CompletionStatus, message: String) {
        self.collected.lock().finished.push((status, message));
        self.done.notify_one();
    }
}
