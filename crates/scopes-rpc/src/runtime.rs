//! Runtime lifecycle
//!
//! A [`Runtime`] owns everything one process needs to speak the middleware
//! protocol: the connection pool, the object adapters, a lazily created
//! reply reaper, an async-invocation waiter that observes fire-and-forget
//! task failures, and the registry proxy. Nothing is process-global;
//! multiple runtimes can coexist in one process.
//!
//! `destroy()` is idempotent and ordered: stop accepting async work, drain
//! outstanding invocations, join the waiter, deactivate the adapters, drop
//! the registry proxy, and stop the reaper. The adapters must outlive the
//! drained invocations, which may still send through them.

use crate::adapter::ObjectAdapter;
use crate::client::ScopeClient;
use crate::config::RuntimeConfig;
use crate::error::{MiddlewareError, Result};
use crate::proxy::{ConnectionPool, Endpoint, Proxy, ScopeProxy};
use crate::reaper::{DestroyPolicy, Reaper};
use crate::registry::{RegistryProxy, ScopeStateUpdate, StateReceiverProxy};
use crate::scope::{ScopeBase, ScopeObject, SCOPE_ABI_VERSION};
use crate::unique_id::unique_id;
use scopes_wire::RequestMode;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RuntimeInner {
    scope_id: String,
    config: RuntimeConfig,
    pool: ConnectionPool,
    adapters: parking_lot::Mutex<Vec<ObjectAdapter>>,
    reply_reaper: parking_lot::Mutex<Option<Arc<Reaper>>>,
    client_reply_adapter: tokio::sync::Mutex<Option<ObjectAdapter>>,
    invoke_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<JoinHandle<()>>>>,
    waiter: parking_lot::Mutex<Option<JoinHandle<()>>>,
    registry: parking_lot::Mutex<Option<RegistryProxy>>,
    destroyed: AtomicBool,
}

/// Per-process middleware runtime
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime for `scope_id` (a generated id if empty). Must be
    /// called from within a tokio runtime.
    pub fn create(scope_id: &str, config: RuntimeConfig) -> Result<Runtime> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| {
            MiddlewareError::Config(
                "Runtime::create() must be called from within a tokio runtime".into(),
            )
        })?;

        let scope_id = if scope_id.is_empty() {
            unique_id("c")
        } else {
            scope_id.to_string()
        };

        let pool = ConnectionPool::new(handle.clone());

        // The waiter drains completed async invocations so failures in
        // fire-and-forget calls are observed instead of leaking.
        let (invoke_tx, mut invoke_rx) = mpsc::unbounded_channel::<JoinHandle<()>>();
        let waiter = handle.spawn(async move {
            while let Some(task) = invoke_rx.recv().await {
                if let Err(e) = task.await {
                    warn!("async invocation failed: {}", e);
                }
            }
        });

        let registry = if config.registry_endpoint.is_empty()
            || config.registry_identity.is_empty()
        {
            debug!("runtime {}: no registry configured", scope_id);
            None
        } else {
            let endpoint = Endpoint::new(&config.registry_endpoint)?;
            let timeout = if config.debug_mode {
                None
            } else {
                Some(config.default_twoway_timeout)
            };
            Some(RegistryProxy::new(Proxy::new(
                pool.clone(),
                endpoint,
                &config.registry_identity,
                RequestMode::Twoway,
                timeout,
            )))
        };

        info!("runtime created for {}", scope_id);
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                scope_id,
                config,
                pool,
                adapters: parking_lot::Mutex::new(Vec::new()),
                reply_reaper: parking_lot::Mutex::new(None),
                client_reply_adapter: tokio::sync::Mutex::new(None),
                invoke_tx: parking_lot::Mutex::new(Some(invoke_tx)),
                waiter: parking_lot::Mutex::new(Some(waiter)),
                registry: parking_lot::Mutex::new(registry),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn scope_id(&self) -> &str {
        &self.inner.scope_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Connection pool for minting proxies by hand.
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    fn check_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MiddlewareError::Logic(
                "runtime has already been destroyed".into(),
            ));
        }
        Ok(())
    }

    /// Proxy to the configured registry.
    pub fn registry(&self) -> Result<RegistryProxy> {
        self.check_alive()?;
        self.inner
            .registry
            .lock()
            .clone()
            .ok_or_else(|| MiddlewareError::Config("no registry configured".into()))
    }

    /// Oneway proxy to the registry's state-notification adapter.
    pub fn state_receiver(&self) -> Result<StateReceiverProxy> {
        self.check_alive()?;
        if self.inner.config.registry_state_endpoint.is_empty() {
            return Err(MiddlewareError::Config(
                "no registry state endpoint configured".into(),
            ));
        }
        let endpoint = Endpoint::new(&self.inner.config.registry_state_endpoint)?;
        Ok(StateReceiverProxy::new(Proxy::new(
            self.inner.pool.clone(),
            endpoint,
            "state",
            RequestMode::Oneway,
            None,
        )))
    }

    /// The reaper expiring idle reply channels; created on first use.
    pub fn reply_reaper(&self) -> Result<Arc<Reaper>> {
        self.check_alive()?;
        let mut reaper = self.inner.reply_reaper.lock();
        if reaper.is_none() {
            *reaper = Some(Reaper::new(
                self.inner.config.reap_interval,
                self.inner.config.reply_idle_timeout,
                DestroyPolicy::NoCallbackOnDestroy,
            )?);
        }
        Ok(Arc::clone(reaper.as_ref().expect("created above")))
    }

    /// Hand a fire-and-forget task to the waiter so its outcome is
    /// observed.
    pub fn submit(&self, task: JoinHandle<()>) -> Result<()> {
        let invoke_tx = self.inner.invoke_tx.lock();
        match &*invoke_tx {
            Some(tx) => tx
                .send(task)
                .map_err(|_| MiddlewareError::Logic("runtime waiter is gone".into())),
            None => Err(MiddlewareError::Logic(
                "runtime has already been destroyed".into(),
            )),
        }
    }

    /// Bind and activate a new adapter owned by this runtime.
    pub async fn create_adapter(
        &self,
        name: impl Into<String>,
        endpoint: Option<&str>,
        mode: RequestMode,
        pool_size: Option<usize>,
    ) -> Result<ObjectAdapter> {
        self.check_alive()?;
        let timeout = match mode {
            RequestMode::Twoway if !self.inner.config.debug_mode => {
                Some(self.inner.config.default_twoway_timeout)
            }
            _ => None,
        };
        let adapter = ObjectAdapter::bind(
            name,
            endpoint.unwrap_or("tcp://127.0.0.1:0"),
            mode,
            timeout,
            pool_size.unwrap_or(self.inner.config.adapter_pool_size),
            self.inner.pool.clone(),
        )
        .await?;
        adapter.activate()?;
        self.inner.adapters.lock().push(adapter.clone());
        Ok(adapter)
    }

    /// The process-wide oneway adapter hosting client-side reply servants;
    /// bound on first use.
    async fn client_reply_adapter(&self) -> Result<ObjectAdapter> {
        let mut guard = self.inner.client_reply_adapter.lock().await;
        if let Some(adapter) = &*guard {
            return Ok(adapter.clone());
        }
        let adapter = self
            .create_adapter(
                format!("{}-reply", self.inner.scope_id),
                None,
                RequestMode::Oneway,
                None,
            )
            .await?;
        *guard = Some(adapter.clone());
        Ok(adapter)
    }

    /// Create a client handle for the scope behind `scope_proxy`. The
    /// proxy is re-minted into this runtime's connection pool with this
    /// runtime's timeout policy.
    pub async fn create_scope_client(&self, scope_proxy: Proxy) -> Result<ScopeClient> {
        self.check_alive()?;
        if scope_proxy.mode() != RequestMode::Twoway {
            return Err(MiddlewareError::Logic(
                "scope proxies must be twoway".into(),
            ));
        }
        let timeout = if self.inner.config.debug_mode {
            None
        } else {
            Some(self.inner.config.default_twoway_timeout)
        };
        let scope_proxy = Proxy::new(
            self.inner.pool.clone(),
            scope_proxy.endpoint().clone(),
            scope_proxy.identity(),
            RequestMode::Twoway,
            timeout,
        );
        let reply_adapter = self.client_reply_adapter().await?;
        let reply_reaper = self.reply_reaper()?;
        Ok(ScopeClient::new(
            ScopeProxy::new(scope_proxy),
            reply_adapter,
            reply_reaper,
        ))
    }

    /// Serve `scope` on this runtime: checks the ABI version, binds the
    /// scope/ctrl/query adapters, registers the scope servant, and
    /// announces readiness to the registry when one is configured.
    pub async fn run_scope(
        &self,
        scope: Arc<dyn ScopeBase>,
        endpoint: Option<&str>,
    ) -> Result<ScopeServer> {
        self.check_alive()?;
        let scope_id = self.inner.scope_id.clone();

        let version = scope.start(&scope_id);
        if version != SCOPE_ABI_VERSION {
            return Err(MiddlewareError::Config(format!(
                "scope {} reports ABI version {} (expected {})",
                scope_id, version, SCOPE_ABI_VERSION
            )));
        }

        let scope_adapter = self
            .create_adapter(scope_id.clone(), endpoint, RequestMode::Twoway, None)
            .await?;
        let ctrl_adapter = self
            .create_adapter(format!("{}-ctrl", scope_id), None, RequestMode::Oneway, None)
            .await?;
        let query_adapter = self
            .create_adapter(format!("{}-query", scope_id), None, RequestMode::Oneway, None)
            .await?;

        let cache_dir = self
            .inner
            .config
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(&scope_id));
        let scope_object = ScopeObject::new(
            Arc::clone(&scope),
            ctrl_adapter,
            query_adapter,
            cache_dir,
        );
        let scope_proxy = scope_adapter.add(&scope_id, Arc::new(scope_object.servant()))?;

        if let Ok(state_receiver) = self.state_receiver() {
            if let Err(e) = state_receiver.push_state(&scope_id, ScopeStateUpdate::Ready) {
                warn!("cannot announce readiness for {}: {}", scope_id, e);
            }
        }

        info!("scope {} serving on {}", scope_id, scope_proxy.endpoint());
        Ok(ScopeServer {
            scope,
            scope_id,
            proxy: scope_proxy,
            stopped: AtomicBool::new(false),
        })
    }

    /// Tear down the runtime. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("runtime {}: destroying", self.inner.scope_id);

        // Stop accepting async work, then drain what is already in flight.
        drop(self.inner.invoke_tx.lock().take());
        let waiter = self.inner.waiter.lock().take();
        if let Some(waiter) = waiter {
            let _ = waiter.await;
        }

        // Only now is it safe to stop the transport; no invocation can
        // still be trying to go through it.
        let adapters: Vec<ObjectAdapter> = self.inner.adapters.lock().drain(..).collect();
        for adapter in adapters {
            adapter.shutdown().await;
        }
        *self.inner.client_reply_adapter.lock().await = None;

        *self.inner.registry.lock() = None;

        let reaper = self.inner.reply_reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.destroy();
        }
        info!("runtime {} destroyed", self.inner.scope_id);
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            debug!(
                "runtime {} dropped without destroy(); resources unwind with the process",
                self.scope_id
            );
        }
    }
}

/// A scope being served by a runtime
pub struct ScopeServer {
    scope: Arc<dyn ScopeBase>,
    scope_id: String,
    proxy: Proxy,
    stopped: AtomicBool,
}

impl ScopeServer {
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Twoway proxy for the served scope.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Invoke the scope's `stop()`. Idempotent; failures are logged since
    /// there is no caller to report to during teardown.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let scope = Arc::clone(&self.scope);
        if catch_unwind(AssertUnwindSafe(move || scope.stop())).is_err() {
            warn!("scope {}: stop() panicked", self.scope_id);
        }
    }
}

impl Drop for ScopeServer {
    fn drop(&mut self) {
        self.stop();
    }
}
