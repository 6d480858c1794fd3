//! Proxies and client-side connections
//!
//! A [`Proxy`] is an immutable value combining endpoint, identity,
//! invocation mode, and timeout. Invocations go through a per-runtime
//! [`ConnectionPool`] that keeps one multiplexed connection per endpoint.
//!
//! A twoway invocation blocks (with a timeout unless the target runs in
//! debug mode) for the correlated response frame. When the timeout expires
//! the pooled connection is discarded, so a later retry connects fresh
//! instead of reusing a half-dead connection.
//!
//! A oneway invocation returns as soon as the frame is queued on the
//! connection's send queue; it never blocks, which is what the reply push
//! path requires.

use crate::error::{MiddlewareError, Result};
use crate::model::{ActionMetadata, CannedQuery, CompletionStatus, ScopeResult, SearchMetadata};
use crate::transport::FrameTransport;
use bytes::Bytes;
use scopes_wire::{Frame, RequestFrame, RequestMode, ResponseBody, ResponseFrame, Variant, VariantMap};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const ENDPOINT_SCHEME: &str = "tcp://";

/// Transport-level address of one adapter
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let rest = endpoint
            .strip_prefix(ENDPOINT_SCHEME)
            .ok_or_else(|| MiddlewareError::InvalidEndpoint(endpoint.clone()))?;
        rest.parse::<SocketAddr>()
            .map_err(|_| MiddlewareError::InvalidEndpoint(endpoint.clone()))?;
        Ok(Self(endpoint))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(format!("{}{}", ENDPOINT_SCHEME, addr))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        // Validated in new()/from_socket_addr()
        self.0[ENDPOINT_SCHEME.len()..].parse().unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

enum ConnCmd {
    Invoke {
        frame: Bytes,
        correlation_id: u64,
        reply: Option<oneshot::Sender<Result<ResponseFrame>>>,
    },
}

struct PoolInner {
    handle: Handle,
    conns: parking_lot::Mutex<HashMap<Endpoint, (u64, mpsc::UnboundedSender<ConnCmd>)>>,
    correlation: AtomicU64,
    generation: AtomicU64,
}

/// One multiplexed outgoing connection per endpoint
///
/// Connections are created lazily on first use and discarded on timeout or
/// transport failure; the next invocation then reconnects.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handle,
                conns: parking_lot::Mutex::new(HashMap::new()),
                correlation: AtomicU64::new(1),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn next_correlation_id(&self) -> u64 {
        self.inner.correlation.fetch_add(1, Ordering::SeqCst)
    }

    /// Return the send queue for `endpoint`, connecting lazily.
    fn sender(&self, endpoint: &Endpoint) -> mpsc::UnboundedSender<ConnCmd> {
        let mut conns = self.inner.conns.lock();
        if let Some((_, tx)) = conns.get(endpoint) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        conns.insert(endpoint.clone(), (generation, tx.clone()));
        self.inner.handle.spawn(run_connection(
            endpoint.clone(),
            rx,
            Arc::downgrade(&self.inner),
            generation,
        ));
        tx
    }

    /// Drop the pooled connection for `endpoint`, if any.
    ///
    /// The next invocation against the endpoint connects fresh.
    pub fn discard(&self, endpoint: &Endpoint) {
        self.inner.conns.lock().remove(endpoint);
    }
}

fn remove_generation(pool: &Weak<PoolInner>, endpoint: &Endpoint, generation: u64) {
    if let Some(pool) = pool.upgrade() {
        let mut conns = pool.conns.lock();
        if conns.get(endpoint).map(|(g, _)| *g) == Some(generation) {
            conns.remove(endpoint);
        }
    }
}

async fn run_connection(
    endpoint: Endpoint,
    mut rx: mpsc::UnboundedReceiver<ConnCmd>,
    pool: Weak<PoolInner>,
    generation: u64,
) {
    let stream = match TcpStream::connect(endpoint.socket_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("connect to {} failed: {}", endpoint, e);
            remove_generation(&pool, &endpoint, generation);
            // Fail everything queued (and everything still arriving from
            // senders already handed out) with ConnectionRefused.
            while let Some(ConnCmd::Invoke { reply, .. }) = rx.recv().await {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(MiddlewareError::ConnectionRefused(e.to_string())));
                }
            }
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameTransport::new(read_half);
    let mut writer = FrameTransport::new(write_half);
    let mut pending: HashMap<u64, oneshot::Sender<Result<ResponseFrame>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(ConnCmd::Invoke { frame, correlation_id, reply }) => {
                    if let Some(reply) = reply {
                        pending.insert(correlation_id, reply);
                    }
                    if let Err(e) = writer.write_frame(&frame).await {
                        debug!("write to {} failed: {}", endpoint, e);
                        break;
                    }
                }
                None => break, // all proxies for this endpoint are gone
            },
            frame = reader.read_frame_decoded() => match frame {
                Ok(Frame::Response(response)) => {
                    match pending.remove(&response.correlation_id) {
                        Some(reply) => {
                            let _ = reply.send(Ok(response));
                        }
                        None => {
                            // Caller timed out and gave up on this call.
                            debug!(
                                "stale response from {} (correlation id {})",
                                endpoint, response.correlation_id
                            );
                        }
                    }
                }
                Ok(Frame::Request(_)) => {
                    warn!("unexpected request frame on outgoing connection to {}", endpoint);
                }
                Err(MiddlewareError::ConnectionClosed) => break,
                Err(e) => {
                    debug!("read from {} failed: {}", endpoint, e);
                    break;
                }
            },
        }
    }

    remove_generation(&pool, &endpoint, generation);
    // Dropping the pending senders makes the waiting callers observe
    // ConnectionClosed.
    drop(pending);
    rx.close();
    while let Ok(ConnCmd::Invoke { reply, .. }) = rx.try_recv() {
        if let Some(reply) = reply {
            let _ = reply.send(Err(MiddlewareError::ConnectionClosed));
        }
    }
}

fn mode_str(mode: RequestMode) -> &'static str {
    match mode {
        RequestMode::Oneway => "oneway",
        RequestMode::Twoway => "twoway",
    }
}

fn mode_from_str(value: &str) -> Option<RequestMode> {
    match value {
        "oneway" => Some(RequestMode::Oneway),
        "twoway" => Some(RequestMode::Twoway),
        _ => None,
    }
}

/// Client-side handle referencing a remote object by identity and endpoint
///
/// Proxies are cheap to clone and do not own the remote object's lifetime.
#[derive(Clone)]
pub struct Proxy {
    endpoint: Endpoint,
    identity: String,
    mode: RequestMode,
    /// `None` means wait forever (debug mode)
    timeout: Option<Duration>,
    pool: ConnectionPool,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Proxy {
    pub fn new(
        pool: ConnectionPool,
        endpoint: Endpoint,
        identity: impl Into<String>,
        mode: RequestMode,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint,
            identity: identity.into(),
            mode,
            timeout,
            pool,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marshal this proxy into a variant for embedding in request arguments.
    pub fn to_variant(&self) -> Variant {
        let mut map = VariantMap::new();
        map.insert("endpoint".into(), Variant::from(self.endpoint.as_str()));
        map.insert("identity".into(), Variant::from(self.identity.clone()));
        map.insert("mode".into(), Variant::from(mode_str(self.mode)));
        Variant::Dict(map)
    }

    /// Unmarshal a proxy descriptor received in request arguments.
    pub fn from_variant(
        pool: &ConnectionPool,
        value: &Variant,
        timeout: Option<Duration>,
    ) -> Result<Proxy> {
        let map = value
            .as_dict()
            .ok_or_else(|| MiddlewareError::Logic("null or malformed proxy descriptor".into()))?;
        let endpoint = map
            .get("endpoint")
            .and_then(Variant::as_str)
            .ok_or_else(|| MiddlewareError::Logic("proxy descriptor: missing endpoint".into()))?;
        let identity = map
            .get("identity")
            .and_then(Variant::as_str)
            .ok_or_else(|| MiddlewareError::Logic("proxy descriptor: missing identity".into()))?;
        let mode = map
            .get("mode")
            .and_then(Variant::as_str)
            .and_then(mode_from_str)
            .ok_or_else(|| MiddlewareError::Logic("proxy descriptor: missing mode".into()))?;
        Ok(Proxy::new(
            pool.clone(),
            Endpoint::new(endpoint)?,
            identity,
            mode,
            timeout,
        ))
    }

    fn send_cmd(&self, mut cmd: ConnCmd) -> Result<()> {
        // The pooled connection task may have died since the sender was
        // handed out; retry once on a fresh connection.
        for _ in 0..2 {
            let sender = self.pool.sender(&self.endpoint);
            match sender.send(cmd) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    cmd = returned;
                    self.pool.discard(&self.endpoint);
                }
            }
        }
        Err(MiddlewareError::ConnectionClosed)
    }

    /// Invoke `op_name` and wait for the correlated response.
    pub async fn invoke_twoway(&self, op_name: &str, args: VariantMap) -> Result<Variant> {
        if self.mode != RequestMode::Twoway {
            return Err(MiddlewareError::Logic(format!(
                "invoke_twoway() on oneway proxy {}",
                self.identity
            )));
        }

        let correlation_id = self.pool.next_correlation_id();
        let frame = RequestFrame {
            mode: RequestMode::Twoway,
            correlation_id,
            identity: self.identity.clone(),
            op_name: op_name.to_string(),
            args,
        }
        .encode();

        let (tx, rx) = oneshot::channel();
        self.send_cmd(ConnCmd::Invoke {
            frame,
            correlation_id,
            reply: Some(tx),
        })?;

        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // The connection is now unusable for correlation; throw
                    // it away so a retry starts clean.
                    self.pool.discard(&self.endpoint);
                    return Err(MiddlewareError::Timeout);
                }
            },
            None => rx.await,
        };

        let response = match received {
            Ok(result) => result?,
            Err(_) => {
                self.pool.discard(&self.endpoint);
                return Err(MiddlewareError::ConnectionClosed);
            }
        };

        match response.body {
            ResponseBody::Success(payload) => Ok(payload),
            ResponseBody::Exception(info) => Err(MiddlewareError::from_exception_info(info)),
        }
    }

    /// Queue `op_name` for sending and return immediately.
    pub fn invoke_oneway(&self, op_name: &str, args: VariantMap) -> Result<()> {
        if self.mode != RequestMode::Oneway {
            return Err(MiddlewareError::Logic(format!(
                "invoke_oneway() on twoway proxy {}",
                self.identity
            )));
        }

        let correlation_id = self.pool.next_correlation_id();
        let frame = RequestFrame {
            mode: RequestMode::Oneway,
            correlation_id,
            identity: self.identity.clone(),
            op_name: op_name.to_string(),
            args,
        }
        .encode();

        self.send_cmd(ConnCmd::Invoke {
            frame,
            correlation_id,
            reply: None,
        })
    }

    /// Reachability probe; answered by every servant.
    pub async fn ping(&self) -> Result<()> {
        self.invoke_twoway("ping", VariantMap::new()).await?;
        Ok(())
    }
}

/// Typed proxy for a reply channel (oneway)
#[derive(Clone, Debug)]
pub struct ReplyProxy {
    proxy: Proxy,
}

impl ReplyProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn push(&self, payload: VariantMap) -> Result<()> {
        self.proxy.invoke_oneway("push", payload)
    }

    pub fn finished(&self, status: CompletionStatus, message: &str) -> Result<()> {
        let mut args = VariantMap::new();
        args.insert("status".into(), Variant::from(status.as_str()));
        args.insert("message".into(), Variant::from(message));
        self.proxy.invoke_oneway("finished", args)
    }
}

/// Typed proxy for a query control object (oneway)
#[derive(Clone, Debug)]
pub struct QueryCtrlProxy {
    proxy: Proxy,
}

impl QueryCtrlProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn cancel(&self) -> Result<()> {
        self.proxy.invoke_oneway("cancel", VariantMap::new())
    }

    pub fn destroy(&self) -> Result<()> {
        self.proxy.invoke_oneway("destroy", VariantMap::new())
    }
}

/// Typed proxy for a scope servant (twoway)
#[derive(Clone, Debug)]
pub struct ScopeProxy {
    proxy: Proxy,
}

impl ScopeProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    async fn create_query(&self, op_name: &str, args: VariantMap) -> Result<QueryCtrlProxy> {
        let payload = self.proxy.invoke_twoway(op_name, args).await?;
        let ctrl = Proxy::from_variant(self.proxy.pool(), &payload, None)?;
        Ok(QueryCtrlProxy::new(ctrl))
    }

    pub async fn search(
        &self,
        query: &CannedQuery,
        metadata: &SearchMetadata,
        reply: &Proxy,
    ) -> Result<QueryCtrlProxy> {
        let mut args = VariantMap::new();
        args.insert("query".into(), Variant::Dict(query.serialize()));
        args.insert("hints".into(), Variant::Dict(metadata.serialize()));
        args.insert("reply".into(), reply.to_variant());
        self.create_query("search", args).await
    }

    pub async fn preview(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
        reply: &Proxy,
    ) -> Result<QueryCtrlProxy> {
        let mut args = VariantMap::new();
        args.insert("result".into(), Variant::Dict(result.serialize()));
        args.insert("hints".into(), Variant::Dict(metadata.serialize()));
        args.insert("reply".into(), reply.to_variant());
        self.create_query("preview", args).await
    }

    pub async fn activate(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
        reply: &Proxy,
    ) -> Result<QueryCtrlProxy> {
        let mut args = VariantMap::new();
        args.insert("result".into(), Variant::Dict(result.serialize()));
        args.insert("hints".into(), Variant::Dict(metadata.serialize()));
        args.insert("reply".into(), reply.to_variant());
        self.create_query("activate", args).await
    }

    pub async fn perform_action(
        &self,
        result: &ScopeResult,
        metadata: &ActionMetadata,
        widget_id: &str,
        action_id: &str,
        reply: &Proxy,
    ) -> Result<QueryCtrlProxy> {
        let mut args = VariantMap::new();
        args.insert("result".into(), Variant::Dict(result.serialize()));
        args.insert("hints".into(), Variant::Dict(metadata.serialize()));
        args.insert("widget_id".into(), Variant::from(widget_id));
        args.insert("action_id".into(), Variant::from(action_id));
        args.insert("reply".into(), reply.to_variant());
        self.create_query("perform_action", args).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.proxy.ping().await
    }
}
