//! Surfacing cache behavior across two runtimes

mod common;

use common::*;
use scopes_rpc::{
    ActionMetadata, CannedQuery, Category, CompletionStatus, Filter, FilterGroup,
    MiddlewareError, PreviewQuery, Result, Runtime, RuntimeConfig, ScopeBase, ScopeResult,
    SearchMetadata, SearchQuery, SearchReply,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cached_config(cache_dir: &PathBuf) -> RuntimeConfig {
    RuntimeConfig {
        cache_dir: Some(cache_dir.clone()),
        ..quick_config()
    }
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(scopes_rpc::unique_id("cache-int-test"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scope that serves live surfacing results while "online" and replays the
/// cache while "offline".
struct WeatherScope {
    online: Arc<AtomicBool>,
}

struct WeatherQuery {
    online: bool,
}

impl SearchQuery for WeatherQuery {
    fn run(&self, reply: SearchReply) {
        if !self.online {
            reply.push_surfacing_results_from_cache().unwrap();
            return;
        }
        reply
            .register_category(&Category::new("forecast", "Forecast"))
            .unwrap();
        for (i, city) in ["lisbon", "oslo", "perth"].iter().enumerate() {
            let result = ScopeResult::new(
                format!("weather://{}", city),
                format!("Weather {}", i),
            )
            .with_category("forecast");
            reply.push_result(&result).unwrap();
        }
        reply.push_filters(
            &[Filter::new("unit", "Unit", "option_selector").with_group("display")],
            &[FilterGroup::new("display", "Display")],
        );
        reply.finished();
    }
}

impl ScopeBase for WeatherScope {
    fn search(
        &self,
        _query: &CannedQuery,
        _metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>> {
        Ok(Arc::new(WeatherQuery {
            online: self.online.load(Ordering::SeqCst),
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
async fn test_surfacing_cache_replay_over_the_wire() {
    init_logging();
    let cache_dir = scratch_dir();
    let online = Arc::new(AtomicBool::new(true));

    let server_runtime = Runtime::create("weather", cached_config(&cache_dir)).unwrap();
    let server = server_runtime
        .run_scope(
            Arc::new(WeatherScope {
                online: Arc::clone(&online),
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

    let surfacing = CannedQuery::new("weather", ""); // empty query string
    let metadata = SearchMetadata::new("en_US", "desktop");

    // Online surfacing query populates the cache.
    let listener = CollectingListener::new();
    client
        .search(&surfacing, &metadata, listener.clone())
        .await
        .unwrap();
    listener.wait_finished().await;
    assert_eq!(listener.finish_status(), Some(CompletionStatus::Ok));
    let live_uris = listener.result_uris();
    assert_eq!(live_uris.len(), 3);

    // Wait for the cache file to land (written before finished is sent,
    // but the write is observable only on the server's filesystem).
    let cache_file = cache_dir
        .join("weather")
        .join(scopes_rpc::SURFACING_CACHE_FILENAME);
    for _ in 0..50 {
        if cache_file.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cache_file.exists(), "surfacing cache was not written");

    // Offline: the scope replays the cache instead of running live.
    online.store(false, Ordering::SeqCst);
    let replay_listener = CollectingListener::new();
    client
        .search(&surfacing, &metadata, replay_listener.clone())
        .await
        .unwrap();
    replay_listener.wait_finished().await;

    assert_eq!(replay_listener.finish_status(), Some(CompletionStatus::Ok));
    assert_eq!(replay_listener.result_uris(), live_uris);
    {
        let collected = replay_listener.collected.lock();
        assert_eq!(collected.categories.len(), 1);
        assert_eq!(collected.categories[0].id, "forecast");
        assert_eq!(collected.categories[0].title, "Forecast");
        assert_eq!(collected.filters.len(), 1);
        assert_eq!(collected.filters[0].0[0].id, "unit");
        let titles: Vec<&str> = collected
            .results
            .iter()
            .map(|result| result.title.as_str())
            .collect();
        assert_eq!(titles, ["Weather 0", "Weather 1", "Weather 2"]);
    }

    client_runtime.destroy().await;
    server_runtime.destroy().await;
    std::fs::remove_dir_all(&cache_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_surfacing_query_does_not_write_cache() {
    init_logging();
    let cache_dir = scratch_dir();

    let server_runtime = Runtime::create("weather", cached_config(&cache_dir)).unwrap();
    let server = server_runtime
        .run_scope(
            Arc::new(WeatherScope {
                online: Arc::new(AtomicBool::new(true)),
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
            &CannedQuery::new("weather", "lisbon"), // non-empty: not surfacing
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();
    listener.wait_finished().await;
    assert_eq!(listener.result_uris().len(), 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cache_file = cache_dir
        .join("weather")
        .join(scopes_rpc::SURFACING_CACHE_FILENAME);
    assert!(!cache_file.exists());

    client_runtime.destroy().await;
    server_runtime.destroy().await;
    std::fs::remove_dir_all(&cache_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_cache_degrades_to_empty_finish() {
    init_logging();
    let cache_dir = scratch_dir();

    let server_runtime = Runtime::create("weather", cached_config(&cache_dir)).unwrap();
    let server = server_runtime
        .run_scope(
            Arc::new(WeatherScope {
                online: Arc::new(AtomicBool::new(false)), // offline from the start
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
            &CannedQuery::new("weather", ""),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();
    listener.wait_finished().await;

    assert_eq!(listener.finish_status(), Some(CompletionStatus::Ok));
    assert!(listener.result_uris().is_empty());

    client_runtime.destroy().await;
    server_runtime.destroy().await;
    std::fs::remove_dir_all(&cache_dir).unwrap();
}
