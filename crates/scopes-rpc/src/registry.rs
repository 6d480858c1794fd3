//! Registry service
//!
//! The registry is a long-lived servant mapping scope ids to metadata and
//! a launch recipe. `locate` spawns the scope process on demand (through
//! the opaque [`ScopeLauncher`] collaborator) and waits until the new
//! process announces readiness on the registry's oneway state adapter.
//!
//! The scope map is kept in sync with the on-disk scope installations by
//! an external directory watcher feeding [`WatchEvent`]s into
//! [`RegistryObject::handle_watch_event`]; every change bumps a version
//! observable through [`RegistryObject::subscribe_list_updates`].

use crate::error::{MiddlewareError, Result};
use crate::proxy::Proxy;
use crate::servant::Servant;
use scopes_wire::{RequestMode, Variant, VariantMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Descriptive record for one scope
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeMetadata {
    pub scope_id: String,
    pub display_name: String,
    pub description: String,
    pub author: String,
    /// Endpoint of the scope's twoway adapter once running
    pub endpoint: String,
}

impl ScopeMetadata {
    pub fn new(scope_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            display_name: display_name.into(),
            description: String::new(),
            author: String::new(),
            endpoint: String::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn serialize(&self) -> VariantMap {
        let mut map = VariantMap::new();
        map.insert("scope_id".into(), Variant::from(self.scope_id.clone()));
        map.insert(
            "display_name".into(),
            Variant::from(self.display_name.clone()),
        );
        map.insert("description".into(), Variant::from(self.description.clone()));
        map.insert("author".into(), Variant::from(self.author.clone()));
        map.insert("endpoint".into(), Variant::from(self.endpoint.clone()));
        map
    }

    pub fn from_variant(map: &VariantMap) -> Result<Self> {
        let scope_id = map
            .get("scope_id")
            .and_then(Variant::as_str)
            .ok_or_else(|| MiddlewareError::Logic("scope metadata: missing scope_id".into()))?
            .to_string();
        Ok(Self {
            scope_id,
            display_name: map
                .get("display_name")
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string(),
            description: map
                .get("description")
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string(),
            author: map
                .get("author")
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string(),
            endpoint: map
                .get("endpoint")
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Launch recipe for one scope process
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeExecData {
    pub program: String,
    pub args: Vec<String>,
}

/// Handle to a launched scope process
pub trait ScopeProcess: Send {
    fn kill(&mut self);
}

/// Opaque process-launch collaborator
pub trait ScopeLauncher: Send + Sync {
    fn launch(&self, scope_id: &str, exec: &ScopeExecData) -> Result<Box<dyn ScopeProcess>>;
}

/// Collaborator turning an on-disk scope installation into a registry
/// record
pub trait MetadataLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<(ScopeMetadata, Option<ScopeExecData>)>;
}

/// Directory-watch event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Removed,
    Modified,
}

/// What kind of path a watch event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPathKind {
    File,
    Directory,
}

/// One event from the external directory watcher
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path_kind: WatchPathKind,
    pub path: PathBuf,
}

/// Readiness announcements a scope process sends to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStateUpdate {
    Ready,
    Stopping,
}

impl ScopeStateUpdate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeStateUpdate::Ready => "ready",
            ScopeStateUpdate::Stopping => "stopping",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(Self::Ready),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Stopped,
    Starting,
    Running,
}

struct ScopeRecord {
    metadata: ScopeMetadata,
    exec: Option<ScopeExecData>,
    state: ProcessState,
    ready_tx: watch::Sender<bool>,
    process: Option<Box<dyn ScopeProcess>>,
    source_path: Option<PathBuf>,
}

struct RegistryMap {
    scopes: HashMap<String, ScopeRecord>,
    by_path: HashMap<PathBuf, String>,
}

struct RegistryInner {
    launcher: Arc<dyn ScopeLauncher>,
    loader: Option<Arc<dyn MetadataLoader>>,
    process_timeout: Duration,
    map: parking_lot::Mutex<RegistryMap>,
    list_version: watch::Sender<u64>,
}

/// The registry servant state
#[derive(Clone)]
pub struct RegistryObject {
    inner: Arc<RegistryInner>,
}

impl RegistryObject {
    pub fn new(
        launcher: Arc<dyn ScopeLauncher>,
        loader: Option<Arc<dyn MetadataLoader>>,
        process_timeout: Duration,
    ) -> Self {
        let (list_version, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                launcher,
                loader,
                process_timeout,
                map: parking_lot::Mutex::new(RegistryMap {
                    scopes: HashMap::new(),
                    by_path: HashMap::new(),
                }),
                list_version,
            }),
        }
    }

    fn bump_list_version(&self) {
        self.inner.list_version.send_modify(|version| *version += 1);
    }

    /// Observe "list changed" events; the value is a monotonically
    /// increasing version.
    pub fn subscribe_list_updates(&self) -> watch::Receiver<u64> {
        self.inner.list_version.subscribe()
    }

    /// Add or update a scope record.
    pub fn add_local_scope(
        &self,
        metadata: ScopeMetadata,
        exec: Option<ScopeExecData>,
        source_path: Option<PathBuf>,
    ) {
        let scope_id = metadata.scope_id.clone();
        {
            let mut map = self.inner.map.lock();
            if let Some(path) = &source_path {
                map.by_path.insert(path.clone(), scope_id.clone());
            }
            match map.scopes.get_mut(&scope_id) {
                Some(record) => {
                    record.metadata = metadata;
                    record.exec = exec;
                    record.source_path = source_path;
                }
                None => {
                    let (ready_tx, _) = watch::channel(false);
                    map.scopes.insert(
                        scope_id.clone(),
                        ScopeRecord {
                            metadata,
                            exec,
                            state: ProcessState::Stopped,
                            ready_tx,
                            process: None,
                            source_path,
                        },
                    );
                }
            }
        }
        info!("registry: scope {} added/updated", scope_id);
        self.bump_list_version();
    }

    /// Remove a scope record, killing its process if running.
    pub fn remove_local_scope(&self, scope_id: &str) -> Result<()> {
        let removed = {
            let mut map = self.inner.map.lock();
            let record = map.scopes.remove(scope_id);
            if let Some(record) = &record {
                if let Some(path) = &record.source_path {
                    map.by_path.remove(path);
                }
            }
            record
        };
        match removed {
            Some(mut record) => {
                if let Some(process) = record.process.as_mut() {
                    process.kill();
                }
                info!("registry: scope {} removed", scope_id);
                self.bump_list_version();
                Ok(())
            }
            None => Err(MiddlewareError::ObjectNotExist(scope_id.to_string())),
        }
    }

    pub fn get_metadata(&self, scope_id: &str) -> Result<ScopeMetadata> {
        self.inner
            .map
            .lock()
            .scopes
            .get(scope_id)
            .map(|record| record.metadata.clone())
            .ok_or_else(|| MiddlewareError::ObjectNotExist(scope_id.to_string()))
    }

    pub fn list(&self) -> Vec<ScopeMetadata> {
        self.inner
            .map
            .lock()
            .scopes
            .values()
            .map(|record| record.metadata.clone())
            .collect()
    }

    pub fn is_scope_running(&self, scope_id: &str) -> bool {
        self.inner
            .map
            .lock()
            .scopes
            .get(scope_id)
            .map(|record| record.state == ProcessState::Running)
            .unwrap_or(false)
    }

    /// Record a state announcement from a scope process (or the local
    /// process supervisor).
    pub fn set_scope_state(&self, scope_id: &str, update: ScopeStateUpdate) {
        let mut map = self.inner.map.lock();
        let Some(record) = map.scopes.get_mut(scope_id) else {
            debug!("state update for unknown scope {}", scope_id);
            return;
        };
        match update {
            ScopeStateUpdate::Ready => {
                record.state = ProcessState::Running;
                record.ready_tx.send_replace(true);
            }
            ScopeStateUpdate::Stopping => {
                record.state = ProcessState::Stopped;
                record.process = None;
                record.ready_tx.send_replace(false);
            }
        }
    }

    /// The external process supervisor observed the scope's death.
    pub fn on_process_death(&self, scope_id: &str) {
        warn!("registry: scope {} process died", scope_id);
        self.set_scope_state(scope_id, ScopeStateUpdate::Stopping);
    }

    /// Return a proxy to the scope, launching its process first if needed.
    /// Blocks (bounded by the configured process timeout) until the scope
    /// announces readiness.
    pub async fn locate(&self, scope_id: &str) -> Result<ScopeMetadata> {
        if scope_id.is_empty() {
            return Err(MiddlewareError::Logic(
                "locate(): cannot locate scope with empty id".into(),
            ));
        }

        let mut ready_rx = {
            let mut map = self.inner.map.lock();
            let record = map
                .scopes
                .get_mut(scope_id)
                .ok_or_else(|| MiddlewareError::ObjectNotExist(scope_id.to_string()))?;
            match record.state {
                ProcessState::Running => return Ok(record.metadata.clone()),
                ProcessState::Starting => record.ready_tx.subscribe(),
                ProcessState::Stopped => {
                    let exec = record.exec.clone().ok_or_else(|| {
                        MiddlewareError::Registry(format!(
                            "locate(): scope {} has no launch recipe",
                            scope_id
                        ))
                    })?;
                    let process =
                        self.inner
                            .launcher
                            .launch(scope_id, &exec)
                            .map_err(|e| {
                                MiddlewareError::Registry(format!(
                                    "locate(): cannot launch scope {}: {}",
                                    scope_id, e
                                ))
                            })?;
                    record.process = Some(process);
                    record.state = ProcessState::Starting;
                    record.ready_tx.subscribe()
                }
            }
        };

        // Wait for the ScopeReady announcement outside the lock.
        let waited = tokio::time::timeout(
            self.inner.process_timeout,
            ready_rx.wait_for(|ready| *ready),
        )
        .await;

        match waited {
            Ok(Ok(_)) => {
                let map = self.inner.map.lock();
                map.scopes
                    .get(scope_id)
                    .filter(|record| record.state == ProcessState::Running)
                    .map(|record| record.metadata.clone())
                    .ok_or_else(|| {
                        MiddlewareError::Registry(format!(
                            "locate(): scope {} disappeared while starting",
                            scope_id
                        ))
                    })
            }
            Ok(Err(_)) => Err(MiddlewareError::Registry(format!(
                "locate(): scope {} was removed while starting",
                scope_id
            ))),
            Err(_) => {
                let mut map = self.inner.map.lock();
                if let Some(record) = map.scopes.get_mut(scope_id) {
                    record.state = ProcessState::Stopped;
                    if let Some(mut process) = record.process.take() {
                        process.kill();
                    }
                }
                Err(MiddlewareError::Registry(format!(
                    "locate(): scope {} did not announce readiness in time",
                    scope_id
                )))
            }
        }
    }

    /// Consume one event from the external directory watcher.
    pub fn handle_watch_event(&self, event: WatchEvent) {
        match (event.kind, event.path_kind) {
            (WatchEventKind::Added | WatchEventKind::Modified, WatchPathKind::File) => {
                let Some(loader) = self.inner.loader.clone() else {
                    debug!("watch event ignored: no metadata loader configured");
                    return;
                };
                match loader.load(&event.path) {
                    Ok((metadata, exec)) => {
                        self.add_local_scope(metadata, exec, Some(event.path));
                    }
                    Err(e) => {
                        // Not every file in the scopes directory is a scope
                        // installation.
                        debug!("cannot load scope from {}: {}", event.path.display(), e);
                    }
                }
            }
            (WatchEventKind::Removed, WatchPathKind::File) => {
                let scope_id = self.inner.map.lock().by_path.get(&event.path).cloned();
                if let Some(scope_id) = scope_id {
                    let _ = self.remove_local_scope(&scope_id);
                }
            }
            (WatchEventKind::Removed, WatchPathKind::Directory) => {
                let affected: Vec<String> = {
                    let map = self.inner.map.lock();
                    map.scopes
                        .values()
                        .filter(|record| {
                            record
                                .source_path
                                .as_ref()
                                .is_some_and(|path| path.starts_with(&event.path))
                        })
                        .map(|record| record.metadata.scope_id.clone())
                        .collect()
                };
                for scope_id in affected {
                    let _ = self.remove_local_scope(&scope_id);
                }
            }
            _ => {}
        }
    }

    /// Build the twoway servant exposing the registry.
    pub fn servant(&self) -> Servant {
        let mut servant = Servant::new();

        let registry = self.clone();
        servant.register_operation("get_metadata", move |_current, args| {
            let registry = registry.clone();
            async move {
                let scope_id = required_scope_id(&args)?;
                Ok(Variant::Dict(registry.get_metadata(&scope_id)?.serialize()))
            }
        });

        let registry = self.clone();
        servant.register_operation("list", move |_current, _args| {
            let registry = registry.clone();
            async move {
                let mut map = VariantMap::new();
                for metadata in registry.list() {
                    map.insert(metadata.scope_id.clone(), Variant::Dict(metadata.serialize()));
                }
                Ok(Variant::Dict(map))
            }
        });

        let registry = self.clone();
        servant.register_operation("is_scope_running", move |_current, args| {
            let registry = registry.clone();
            async move {
                let scope_id = required_scope_id(&args)?;
                Ok(Variant::Bool(registry.is_scope_running(&scope_id)))
            }
        });

        let registry = self.clone();
        servant.register_operation("locate", move |current, args| {
            let registry = registry.clone();
            async move {
                let scope_id = required_scope_id(&args)?;
                let metadata = registry.locate(&scope_id).await?;
                // Hand back a proxy descriptor for the scope's adapter.
                let endpoint = crate::proxy::Endpoint::new(&metadata.endpoint)?;
                let proxy = Proxy::new(
                    current.pool.clone(),
                    endpoint,
                    metadata.scope_id,
                    RequestMode::Twoway,
                    None,
                );
                Ok(proxy.to_variant())
            }
        });

        servant
    }

    /// Build the oneway servant receiving scope state announcements.
    pub fn state_servant(&self) -> Servant {
        let registry = self.clone();
        let mut servant = Servant::new();
        servant.register_operation("push_state", move |_current, args| {
            let registry = registry.clone();
            async move {
                let scope_id = required_scope_id(&args)?;
                let update = args
                    .get("state")
                    .and_then(Variant::as_str)
                    .and_then(ScopeStateUpdate::from_str)
                    .ok_or_else(|| {
                        MiddlewareError::Logic("push_state: missing or invalid state".into())
                    })?;
                registry.set_scope_state(&scope_id, update);
                Ok(Variant::Null)
            }
        });
        servant
    }
}

fn required_scope_id(args: &VariantMap) -> Result<String> {
    args.get("scope_id")
        .and_then(Variant::as_str)
        .map(str::to_string)
        .ok_or_else(|| MiddlewareError::Logic("missing scope_id argument".into()))
}

/// Typed client proxy for the registry (twoway)
#[derive(Clone, Debug)]
pub struct RegistryProxy {
    proxy: Proxy,
}

impl RegistryProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn get_metadata(&self, scope_id: &str) -> Result<ScopeMetadata> {
        let mut args = VariantMap::new();
        args.insert("scope_id".into(), Variant::from(scope_id));
        let payload = self.proxy.invoke_twoway("get_metadata", args).await?;
        payload
            .as_dict()
            .ok_or_else(|| MiddlewareError::Logic("get_metadata: malformed response".into()))
            .and_then(ScopeMetadata::from_variant)
    }

    pub async fn list(&self) -> Result<HashMap<String, ScopeMetadata>> {
        let payload = self.proxy.invoke_twoway("list", VariantMap::new()).await?;
        let dict = payload
            .as_dict()
            .ok_or_else(|| MiddlewareError::Logic("list: malformed response".into()))?;
        let mut scopes = HashMap::new();
        for (scope_id, value) in dict {
            let metadata = value
                .as_dict()
                .ok_or_else(|| MiddlewareError::Logic("list: malformed entry".into()))
                .and_then(ScopeMetadata::from_variant)?;
            scopes.insert(scope_id.clone(), metadata);
        }
        Ok(scopes)
    }

    pub async fn is_scope_running(&self, scope_id: &str) -> Result<bool> {
        let mut args = VariantMap::new();
        args.insert("scope_id".into(), Variant::from(scope_id));
        let payload = self.proxy.invoke_twoway("is_scope_running", args).await?;
        payload
            .as_bool()
            .ok_or_else(|| MiddlewareError::Logic("is_scope_running: malformed response".into()))
    }

    /// Locate (and if necessary launch) a scope; returns a twoway proxy to
    /// it, inheriting this proxy's timeout.
    pub async fn locate(&self, scope_id: &str) -> Result<Proxy> {
        let mut args = VariantMap::new();
        args.insert("scope_id".into(), Variant::from(scope_id));
        let payload = self.proxy.invoke_twoway("locate", args).await?;
        Proxy::from_variant(self.proxy.pool(), &payload, self.proxy.timeout())
    }
}

/// Typed client proxy for the registry's state adapter (oneway)
#[derive(Clone, Debug)]
pub struct StateReceiverProxy {
    proxy: Proxy,
}

impl StateReceiverProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn push_state(&self, scope_id: &str, update: ScopeStateUpdate) -> Result<()> {
        let mut args = VariantMap::new();
        args.insert("scope_id".into(), Variant::from(scope_id));
        args.insert("state".into(), Variant::from(update.as_str()));
        self.proxy.invoke_oneway("push_state", args)
    }
}
