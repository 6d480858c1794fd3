//! RPC middleware runtime for isolated scope processes
//!
//! This crate lets independent "scope" processes (search providers) be
//! invoked by a shell process, and lets scopes recursively invoke other
//! scopes. The pieces, leaves first:
//!
//! - [`FrameTransport`]: length-prefixed frame I/O over a byte stream.
//! - [`ObjectAdapter`]: one endpoint, a servant map keyed by identity, and
//!   a fixed-size dispatch pool. Oneway and twoway traffic use separate
//!   adapters so pushes never queue behind slow twoway calls.
//! - [`Proxy`] / [`Servant`]: the two halves of a call across a process
//!   boundary. Twoway calls block with a timeout and discard their
//!   connection on expiry; oneway calls return once the frame is queued.
//! - [`Reaper`] / [`ReapItem`]: a generic idle-timeout manager with a
//!   strict cancel-vs-expiry happens-before guarantee.
//! - [`SearchReply`] and friends: the push/finished protocol, cardinality
//!   limiting, and the on-disk surfacing cache.
//! - [`Runtime`]: per-process lifecycle owner; [`ScopeClient`] for the
//!   calling side, [`ScopeBase`] plus [`Runtime::run_scope`] for the
//!   serving side.
//! - [`RegistryObject`]: the registry service tracking scopes, launching
//!   their processes on demand, and following directory-watch events.
//!
//! # Example
//!
//! ```no_run
//! use scopes_rpc::{
//!     CannedQuery, CompletionStatus, Result, Runtime, RuntimeConfig, ScopeBase, ScopeResult,
//!     SearchListener, SearchMetadata, SearchQuery, SearchReply,
//! };
//! use std::sync::Arc;
//!
//! struct EchoQuery(String);
//!
//! impl SearchQuery for EchoQuery {
//!     fn run(&self, reply: SearchReply) {
//!         let result = ScopeResult::new(format!("echo://{}", self.0), self.0.clone());
//!         let _ = reply.push_result(&result);
//!         reply.finished();
//!     }
//! }
//!
//! struct EchoScope;
//!
//! impl ScopeBase for EchoScope {
//!     fn search(
//!         &self,
//!         query: &CannedQuery,
//!         _metadata: &SearchMetadata,
//!     ) -> Result<Arc<dyn SearchQuery>> {
//!         Ok(Arc::new(EchoQuery(query.query_string.clone())))
//!     }
//!
//!     fn preview(
//!         &self,
//!         _result: &ScopeResult,
//!         _metadata: &scopes_rpc::ActionMetadata,
//!     ) -> Result<Arc<dyn scopes_rpc::PreviewQuery>> {
//!         Err(scopes_rpc::MiddlewareError::Resource("no preview".into()))
//!     }
//! }
//!
//! struct PrintListener;
//!
//! impl SearchListener for PrintListener {
//!     fn push_result(&self, result: ScopeResult) {
//!         println!("{}: {}", result.uri, result.title);
//!     }
//!     fn finished(&self, status: CompletionStatus, message: String) {
//!         println!("finished: {} {}", status.as_str(), message);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Server side (normally its own process).
//!     let server_runtime = Runtime::create("echo-scope", RuntimeConfig::default())?;
//!     let server = server_runtime.run_scope(Arc::new(EchoScope), None).await?;
//!
//!     // Client side.
//!     let client_runtime = Runtime::create("shell", RuntimeConfig::default())?;
//!     let client = client_runtime
//!         .create_scope_client(server.proxy().clone())
//!         .await?;
//!     client
//!         .search(
//!             &CannedQuery::new("echo-scope", "hello"),
//!             &SearchMetadata::new("en_US", "desktop"),
//!             Arc::new(PrintListener),
//!         )
//!         .await?;
//!
//!     client_runtime.destroy().await;
//!     server_runtime.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod reply;
pub mod runtime;
pub mod scope;
pub mod servant;
pub mod transport;
pub mod unique_id;

mod query;

// Re-export error types
pub use error::{MiddlewareError, Result};

// Wire-level re-exports
pub use scopes_wire::{
    ExceptionInfo, ExceptionKind, RequestMode, Variant, VariantArray, VariantMap,
};

// Transport and adapter exports
pub use adapter::{AdapterStats, AdapterStatsSnapshot, ObjectAdapter};
pub use transport::FrameTransport;

// Proxy/servant exports
pub use proxy::{
    ConnectionPool, Endpoint, Proxy, QueryCtrlProxy, ReplyProxy, ScopeProxy,
};
pub use servant::{Current, OperationHandler, Servant};

// Reaper exports
pub use reaper::{DestroyPolicy, ReapItem, Reaper};

// Data model exports
pub use model::{
    ActionMetadata, ActivationResponse, ActivationStatus, CannedQuery, Category,
    CategoryRegistry, CompletionStatus, Department, Filter, FilterGroup, ScopeResult,
    SearchMetadata,
};

// Reply channel exports
pub use cache::{CacheDocument, SurfacingCache, SURFACING_CACHE_FILENAME};
pub use reply::{
    ActivationListener, PreviewListener, PreviewReply, SearchListener, SearchReply,
};

// Scope and client exports
pub use client::{QueryCtrlHandle, ScopeClient};
pub use scope::{
    ActivationQuery, PreviewQuery, ScopeBase, SearchQuery, SCOPE_ABI_VERSION,
};

// Runtime exports
pub use config::{RegistryConfig, RuntimeConfig, MAX_REPLY_IDLE_TIMEOUT, MIN_REPLY_IDLE_TIMEOUT};
pub use runtime::{Runtime, ScopeServer};

// Registry service exports
pub use registry::{
    MetadataLoader, RegistryObject, RegistryProxy, ScopeExecData, ScopeLauncher, ScopeMetadata,
    ScopeProcess, ScopeStateUpdate, StateReceiverProxy, WatchEvent, WatchEventKind, WatchPathKind,
};
pub use unique_id::{unique_id, UniqueId};
