//! Object adapter
//!
//! An adapter owns one endpoint, accepts incoming connections, and routes
//! request frames to servants registered by identity. Dispatch runs on a
//! fixed-size worker pool fed from a single queue; with the default pool
//! size of 1 every channel observes in-order delivery. Each accepted
//! connection runs in its own task; responses for twoway requests travel
//! back over a per-connection write queue.
//!
//! Handler results never propagate into the dispatch loop: failures are
//! marshalled into exception frames (twoway) or logged (oneway).

use crate::error::{MiddlewareError, Result};
use crate::proxy::{ConnectionPool, Endpoint, Proxy};
use crate::servant::{Current, Servant};
use crate::transport::FrameTransport;
use crate::unique_id::UniqueId;
use bytes::Bytes;
use scopes_wire::{Frame, RequestFrame, RequestMode, ResponseFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Adapter statistics
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub connections_accepted: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_processed: AtomicU64,
    pub requests_failed: AtomicU64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of adapter statistics
#[derive(Debug, Clone)]
pub struct AdapterStatsSnapshot {
    pub connections_accepted: u64,
    pub requests_received: u64,
    pub requests_processed: u64,
    pub requests_failed: u64,
}

struct DispatchItem {
    request: RequestFrame,
    respond: Option<mpsc::UnboundedSender<Bytes>>,
}

#[derive(Debug, PartialEq, Eq)]
enum LifecycleState {
    Inactive,
    Active,
    Destroyed,
}

struct AdapterState {
    lifecycle: LifecycleState,
    listener: Option<TcpListener>,
    dispatch_tx: Option<mpsc::UnboundedSender<DispatchItem>>,
    tasks: Vec<JoinHandle<()>>,
}

struct AdapterInner {
    name: String,
    endpoint: Endpoint,
    mode: RequestMode,
    default_timeout: Option<Duration>,
    pool_size: usize,
    pool: ConnectionPool,
    servants: parking_lot::RwLock<HashMap<String, Arc<Servant>>>,
    id_gen: UniqueId,
    stats: Arc<AdapterStats>,
    state: parking_lot::Mutex<AdapterState>,
    shutdown_tx: watch::Sender<bool>,
}

/// The per-endpoint dispatch unit binding identities to servants
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl ObjectAdapter {
    /// Bind `endpoint` (which may carry port 0 for an ephemeral port) and
    /// return an inactive adapter. Proxies minted by [`add`](Self::add)
    /// carry `mode` and `default_timeout`.
    pub async fn bind(
        name: impl Into<String>,
        endpoint: &str,
        mode: RequestMode,
        default_timeout: Option<Duration>,
        pool_size: usize,
        pool: ConnectionPool,
    ) -> Result<ObjectAdapter> {
        if pool_size == 0 {
            return Err(MiddlewareError::Config(
                "adapter pool size must be at least 1".into(),
            ));
        }
        let name = name.into();
        let requested = Endpoint::new(endpoint)?;
        let listener = TcpListener::bind(requested.socket_addr()).await?;
        let endpoint = Endpoint::from_socket_addr(listener.local_addr()?);
        debug!("adapter {} bound to {}", name, endpoint);

        let (shutdown_tx, _) = watch::channel(false);
        Ok(ObjectAdapter {
            inner: Arc::new(AdapterInner {
                name,
                endpoint,
                mode,
                default_timeout,
                pool_size,
                pool,
                servants: parking_lot::RwLock::new(HashMap::new()),
                id_gen: UniqueId::new(),
                stats: Arc::new(AdapterStats::default()),
                state: parking_lot::Mutex::new(AdapterState {
                    lifecycle: LifecycleState::Inactive,
                    listener: Some(listener),
                    dispatch_tx: None,
                    tasks: Vec::new(),
                }),
                shutdown_tx,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Actual endpoint after binding
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn stats(&self) -> &Arc<AdapterStats> {
        &self.inner.stats
    }

    /// Start the accept loop and the dispatch workers.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.lifecycle {
            LifecycleState::Active => return Ok(()),
            LifecycleState::Destroyed => return Err(MiddlewareError::AdapterStopped),
            LifecycleState::Inactive => {}
        }
        let listener = state
            .listener
            .take()
            .ok_or(MiddlewareError::AdapterStopped)?;

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        for _ in 0..self.inner.pool_size {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&dispatch_rx);
            state.tasks.push(tokio::spawn(worker_loop(inner, rx)));
        }

        let inner = Arc::clone(&self.inner);
        let accept_dispatch_tx = dispatch_tx.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        state.tasks.push(tokio::spawn(accept_loop(
            inner,
            listener,
            accept_dispatch_tx,
            shutdown_rx,
        )));

        state.dispatch_tx = Some(dispatch_tx);
        state.lifecycle = LifecycleState::Active;
        info!(
            "adapter {} active on {} ({} worker{})",
            self.inner.name,
            self.inner.endpoint,
            self.inner.pool_size,
            if self.inner.pool_size == 1 { "" } else { "s" }
        );
        Ok(())
    }

    /// Register a servant. An empty identity gets a generated one.
    /// Returns a proxy for the new registration.
    pub fn add(&self, identity: &str, servant: Arc<Servant>) -> Result<Proxy> {
        if self.inner.state.lock().lifecycle == LifecycleState::Destroyed {
            return Err(MiddlewareError::AdapterStopped);
        }
        let identity = if identity.is_empty() {
            self.inner.id_gen.gen()
        } else {
            identity.to_string()
        };
        {
            let mut servants = self.inner.servants.write();
            if servants.contains_key(&identity) {
                return Err(MiddlewareError::DuplicateIdentity(identity));
            }
            servants.insert(identity.clone(), servant);
        }
        Ok(self.proxy_for(&identity))
    }

    /// Unregister a servant; subsequent dispatches fail with ObjectNotExist.
    pub fn remove(&self, identity: &str) -> Result<()> {
        match self.inner.servants.write().remove(identity) {
            Some(_) => Ok(()),
            None => Err(MiddlewareError::ObjectNotExist(identity.to_string())),
        }
    }

    pub fn find(&self, identity: &str) -> Option<Arc<Servant>> {
        self.inner.servants.read().get(identity).cloned()
    }

    /// Mint a proxy for an identity registered (or to be registered) on
    /// this adapter.
    pub fn proxy_for(&self, identity: &str) -> Proxy {
        Proxy::new(
            self.inner.pool.clone(),
            self.inner.endpoint.clone(),
            identity,
            self.inner.mode,
            self.inner.default_timeout,
        )
    }

    /// Stop accepting connections, drain the dispatch queue, and drop all
    /// servants. Idempotent.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == LifecycleState::Destroyed {
                return;
            }
            state.lifecycle = LifecycleState::Destroyed;
            state.listener = None;
            state.dispatch_tx = None;
            std::mem::take(&mut state.tasks)
        };
        let _ = self.inner.shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        self.inner.servants.write().clear();
        info!("adapter {} deactivated", self.inner.name);
    }
}

async fn worker_loop(
    inner: Arc<AdapterInner>,
    dispatch_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DispatchItem>>>,
) {
    loop {
        let item = {
            let mut rx = dispatch_rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            break;
        };
        dispatch_item(&inner, item).await;
    }
}

async fn dispatch_item(inner: &Arc<AdapterInner>, item: DispatchItem) {
    let RequestFrame {
        mode,
        correlation_id,
        identity,
        op_name,
        args,
    } = item.request;

    // Clone the servant out and release the lock before invoking the
    // handler, so handlers can add/remove servants on this adapter.
    let servant = inner.servants.read().get(&identity).cloned();
    let current = Current {
        identity: identity.clone(),
        op_name: op_name.clone(),
        adapter_name: inner.name.clone(),
        mode,
        pool: inner.pool.clone(),
    };

    let result = match servant {
        Some(servant) => servant.dispatch(current, args).await,
        None => Err(MiddlewareError::ObjectNotExist(identity.clone())),
    };

    if let Some(respond) = item.respond {
        let frame = match result {
            Ok(payload) => {
                inner.stats.requests_processed.fetch_add(1, Ordering::Relaxed);
                ResponseFrame::success(correlation_id, payload)
            }
            Err(e) => {
                inner.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "adapter {}: {}::{} failed: {}",
                    inner.name, identity, op_name, e
                );
                ResponseFrame::exception(correlation_id, e.to_exception_info())
            }
        };
        let _ = respond.send(frame.encode());
    } else {
        match result {
            Ok(_) => {
                inner.stats.requests_processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // No caller to report to on a oneway invocation.
                inner.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "adapter {}: oneway {}::{} failed: {}",
                    inner.name, identity, op_name, e
                );
            }
        }
    }
}

async fn accept_loop(
    inner: Arc<AdapterInner>,
    listener: TcpListener,
    dispatch_tx: mpsc::UnboundedSender<DispatchItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    inner
                        .stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("adapter {} accepted connection from {}", inner.name, peer_addr);
                    tokio::spawn(serve_connection(
                        Arc::clone(&inner),
                        stream,
                        dispatch_tx.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    warn!("adapter {} accept error: {}", inner.name, e);
                }
            },
        }
    }
}

async fn serve_connection(
    inner: Arc<AdapterInner>,
    stream: TcpStream,
    dispatch_tx: mpsc::UnboundedSender<DispatchItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameTransport::new(read_half);
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer_task = tokio::spawn(async move {
        let mut writer = FrameTransport::new(write_half);
        while let Some(data) = write_rx.recv().await {
            if let Err(e) = writer.write_frame(&data).await {
                debug!("response write failed: {}", e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = reader.read_frame_decoded() => match frame {
                Ok(Frame::Request(request)) => {
                    inner.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                    let respond =
                        (request.mode == RequestMode::Twoway).then(|| write_tx.clone());
                    if dispatch_tx.send(DispatchItem { request, respond }).is_err() {
                        break;
                    }
                }
                Ok(Frame::Response(_)) => {
                    warn!("adapter {}: unexpected response frame", inner.name);
                }
                Err(MiddlewareError::ConnectionClosed) => {
                    debug!("adapter {}: connection closed", inner.name);
                    break;
                }
                Err(e) => {
                    // Framing is unrecoverable on a byte stream; drop the
                    // connection.
                    warn!("adapter {}: framing error: {}", inner.name, e);
                    break;
                }
            },
        }
    }

    drop(write_tx);
    let _ = writer_task.await;
}
