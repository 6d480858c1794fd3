//! Registry service: locate, launch-on-demand, and state notification

mod common;

use common::*;
use scopes_rpc::{
    ActionMetadata, CannedQuery, CompletionStatus, MiddlewareError, PreviewQuery,
    RegistryObject, RegistryProxy, RequestMode, Result, Runtime, RuntimeConfig, ScopeBase,
    ScopeExecData, ScopeLauncher, ScopeMetadata, ScopeProcess, ScopeResult, SearchMetadata,
    SearchQuery, SearchReply,
};
use std::sync::Arc;
use std::time::Duration;

struct OneResultScope;

struct OneResultQuery;

impl SearchQuery for OneResultQuery {
    fn run(&self, reply: SearchReply) {
        let _ = reply.push_result(&ScopeResult::new("scope://launched/0", "Launched"));
        reply.finished();
    }
}

impl ScopeBase for OneResultScope {
    fn search(
        &self,
        _query: &CannedQuery,
        _metadata: &SearchMetadata,
    ) -> Result<Arc<dyn SearchQuery>> {
        Ok(Arc::new(OneResultQuery))
    }

    fn preview(
        &self,
        _result: &ScopeResult,
        _metadata: &ActionMetadata,
    ) -> Result<Arc<dyn PreviewQuery>> {
        Err(MiddlewareError::Resource("no preview".into()))
    }
}

/// Stands in for the external process launcher: "launching" a scope spawns
/// an in-process runtime serving it, then records its endpoint and
/// announces readiness the way a real scope process would. The registry
/// handle is bound after construction since the two reference each other.
struct TaskLauncher {
    registry: parking_lot::Mutex<Option<RegistryObject>>,
}

impl TaskLauncher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: parking_lot::Mutex::new(None),
        })
    }

    fn bind(&self, registry: RegistryObject) {
        *self.registry.lock() = Some(registry);
    }
}

struct TaskProcess {
    runtime: Runtime,
}

impl ScopeProcess for TaskProcess {
    fn kill(&mut self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move { runtime.destroy().await });
    }
}

impl ScopeLauncher for TaskLauncher {
    fn launch(&self, scope_id: &str, _exec: &ScopeExecData) -> Result<Box<dyn ScopeProcess>> {
        let registry = self
            .registry
            .lock()
            .clone()
            .expect("launcher used before bind()");
        let scope_runtime = Runtime::create(scope_id, quick_config())?;
        let scope_id = scope_id.to_string();
        let runtime = scope_runtime.clone();
        tokio::spawn(async move {
            let server = runtime
                .run_scope(Arc::new(OneResultScope), None)
                .await
                .expect("cannot serve launched scope");
            registry.add_local_scope(
                ScopeMetadata::new(scope_id.clone(), "Launched scope")
                    .with_endpoint(server.proxy().endpoint().as_str()),
                Some(exec_data()),
                None,
            );
            registry.set_scope_state(&scope_id, scopes_rpc::ScopeStateUpdate::Ready);
            // Hold the server so the scope keeps serving until the test
            // runtime goes away.
            let _server = server;
            std::future::pending::<()>().await;
        });
        Ok(Box::new(TaskProcess {
            runtime: scope_runtime,
        }))
    }
}

fn exec_data() -> ScopeExecData {
    ScopeExecData {
        program: "scoperunner".into(),
        args: vec!["launched.ini".into()],
    }
}

/// Serve a registry (twoway) and its state receiver (oneway) on a runtime;
/// returns the registry object and the two endpoints.
async fn serve_registry(
    runtime: &Runtime,
    registry: &RegistryObject,
) -> (String, String) {
    let registry_adapter = runtime
        .create_adapter("registry", None, RequestMode::Twoway, None)
        .await
        .unwrap();
    registry_adapter
        .add("registry", Arc::new(registry.servant()))
        .unwrap();

    let state_adapter = runtime
        .create_adapter("registry-state", None, RequestMode::Oneway, None)
        .await
        .unwrap();
    state_adapter
        .add("state", Arc::new(registry.state_servant()))
        .unwrap();

    (
        registry_adapter.endpoint().as_str().to_string(),
        state_adapter.endpoint().as_str().to_string(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_locate_launches_scope_and_search_works() {
    init_logging();
    let registry_runtime = runtime("registry");
    let launcher = TaskLauncher::new();
    let registry = RegistryObject::new(launcher.clone(), None, Duration::from_secs(4));
    launcher.bind(registry.clone());
    let (registry_endpoint, _) = serve_registry(&registry_runtime, &registry).await;

    registry.add_local_scope(
        ScopeMetadata::new("launched", "Launched scope"),
        Some(exec_data()),
        None,
    );

    // Client runtime configured with the registry.
    let client_config = RuntimeConfig {
        registry_identity: "registry".into(),
        registry_endpoint,
        ..quick_config()
    };
    let client_runtime = Runtime::create("shell", client_config).unwrap();
    let registry_proxy: RegistryProxy = client_runtime.registry().unwrap();

    let scope_proxy = registry_proxy.locate("launched").await.unwrap();
    let client = client_runtime
        .create_scope_client(scope_proxy)
        .await
        .unwrap();

    let listener = CollectingListener::new();
    client
        .search(
            &CannedQuery::new("launched", "q"),
            &SearchMetadata::new("en_US", "desktop"),
            listener.clone(),
        )
        .await
        .unwrap();
    listener.wait_finished().await;
    assert_eq!(listener.finish_status(), Some(CompletionStatus::Ok));
    assert_eq!(listener.result_uris(), ["scope://launched/0"]);

    client_runtime.destroy().await;
    registry_runtime.destroy().await;
}

struct NeverLaunch;

impl ScopeLauncher for NeverLaunch {
    fn launch(&self, scope_id: &str, _exec: &ScopeExecData) -> Result<Box<dyn ScopeProcess>> {
        Err(MiddlewareError::Registry(format!(
            "launching {} is not possible here",
            scope_id
        )))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_locate_launch_failure_is_a_registry_error() {
    init_logging();
    let registry_runtime = runtime("registry");
    let registry = RegistryObject::new(Arc::new(NeverLaunch), None, Duration::from_millis(500));
    let (registry_endpoint, _) = serve_registry(&registry_runtime, &registry).await;

    registry.add_local_scope(
        ScopeMetadata::new("unlaunchable", "Unlaunchable"),
        Some(exec_data()),
        None,
    );

    let client_config = RuntimeConfig {
        registry_identity: "registry".into(),
        registry_endpoint,
        ..quick_config()
    };
    let client_runtime = Runtime::create("shell", client_config).unwrap();
    let registry_proxy = client_runtime.registry().unwrap();

    assert!(matches!(
        registry_proxy.locate("unlaunchable").await,
        Err(MiddlewareError::Registry(_))
    ));
    assert!(matches!(
        registry_proxy.locate("never-added").await,
        Err(MiddlewareError::ObjectNotExist(_))
    ));

    client_runtime.destroy().await;
    registry_runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_and_metadata_over_the_wire() {
    init_logging();
    let registry_runtime = runtime("registry");
    let registry = RegistryObject::new(Arc::new(NeverLaunch), None, Duration::from_secs(1));
    let (registry_endpoint, _) = serve_registry(&registry_runtime, &registry).await;

    registry.add_local_scope(
        ScopeMetadata::new("scope-a", "Scope A").with_endpoint("tcp://127.0.0.1:7001"),
        None,
        None,
    );
    registry.add_local_scope(
        ScopeMetadata::new("scope-b", "Scope B").with_endpoint("tcp://127.0.0.1:7002"),
        None,
        None,
    );

    let client_config = RuntimeConfig {
        registry_identity: "registry".into(),
        registry_endpoint,
        ..quick_config()
    };
    let client_runtime = Runtime::create("shell", client_config).unwrap();
    let registry_proxy = client_runtime.registry().unwrap();

    let listed = registry_proxy.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed["scope-a"].display_name, "Scope A");

    let metadata = registry_proxy.get_metadata("scope-b").await.unwrap();
    assert_eq!(metadata.endpoint, "tcp://127.0.0.1:7002");

    assert!(matches!(
        registry_proxy.get_metadata("scope-c").await,
        Err(MiddlewareError::ObjectNotExist(_))
    ));

    client_runtime.destroy().await;
    registry_runtime.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scope_announces_ready_over_state_channel() {
    init_logging();
    let registry_runtime = runtime("registry");
    let registry = RegistryObject::new(Arc::new(NeverLaunch), None, Duration::from_secs(4));
    let (registry_endpoint, state_endpoint) = serve_registry(&registry_runtime, &registry).await;

    registry.add_local_scope(
        ScopeMetadata::new("self-starting", "Self starting"),
        None,
        None,
    );
    assert!(!registry.is_scope_running("self-starting"));

    // A scope runtime configured with the registry announces ScopeReady
    // when run_scope() completes.
    let scope_config = RuntimeConfig {
        registry_identity: "registry".into(),
        registry_endpoint: registry_endpoint.clone(),
        registry_state_endpoint: state_endpoint,
        ..quick_config()
    };
    let scope_runtime = Runtime::create("self-starting", scope_config).unwrap();
    let _server = scope_runtime
        .run_scope(Arc::new(OneResultScope), None)
        .await
        .unwrap();

    // The oneway announcement needs a moment to land.
    for _ in 0..100 {
        if registry.is_scope_running("self-starting") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registry.is_scope_running("self-starting"));

    // And the client can observe it through the twoway interface too.
    let client_config = RuntimeConfig {
        registry_identity: "registry".into(),
        registry_endpoint,
        ..quick_config()
    };
    let client_runtime = Runtime::create("shell", client_config).unwrap();
    let registry_proxy = client_runtime.registry().unwrap();
    assert!(registry_proxy.is_scope_running("self-starting").await.unwrap());

    client_runtime.destroy().await;
    scope_runtime.destroy().await;
    registry_runtime.destroy().await;
}
