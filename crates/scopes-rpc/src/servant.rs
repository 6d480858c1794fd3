//! Servants and operation dispatch
//!
//! A servant is the server-side half of the proxy/servant pair: a dispatch
//! table mapping operation names to handlers. The adapter looks the servant
//! up by identity and invokes [`Servant::dispatch`] on a worker; the
//! handler receives a [`Current`] context naming the adapter, identity, and
//! operation that triggered the call.

use crate::error::{MiddlewareError, Result};
use crate::proxy::ConnectionPool;
use scopes_wire::{RequestMode, Variant, VariantMap};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Context passed to every operation handler
#[derive(Clone)]
pub struct Current {
    /// Identity the request was addressed to
    pub identity: String,
    /// Operation being invoked
    pub op_name: String,
    /// Name of the adapter that received the call
    pub adapter_name: String,
    /// Invocation mode of the request
    pub mode: RequestMode,
    /// Connection pool of the receiving runtime, for minting proxies out
    /// of marshalled proxy descriptors
    pub pool: ConnectionPool,
}

/// Operation handler function type
pub type OperationHandler = Arc<
    dyn Fn(Current, VariantMap) -> Pin<Box<dyn Future<Output = Result<Variant>> + Send>>
        + Send
        + Sync,
>;

/// A dispatch table for one server-side object
pub struct Servant {
    operations: HashMap<String, OperationHandler>,
}

impl Servant {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Register an operation handler
    pub fn register_operation<F, Fut>(&mut self, op_name: impl Into<String>, handler: F)
    where
        F: Fn(Current, VariantMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Variant>> + Send + 'static,
    {
        self.operations.insert(
            op_name.into(),
            Arc::new(move |current, args| Box::pin(handler(current, args))),
        );
    }

    pub fn has_operation(&self, op_name: &str) -> bool {
        self.operations.contains_key(op_name)
    }

    /// Dispatch an incoming invocation.
    ///
    /// Every servant answers `ping` even when the application did not
    /// register a handler for it.
    pub async fn dispatch(&self, current: Current, args: VariantMap) -> Result<Variant> {
        let handler = match self.operations.get(&current.op_name) {
            Some(handler) => Arc::clone(handler),
            None if current.op_name == "ping" => return Ok(Variant::Null),
            None => {
                return Err(MiddlewareError::OperationNotExist(format!(
                    "{}: unknown operation '{}'",
                    current.identity, current.op_name
                )))
            }
        };
        handler(current, args).await
    }
}

impl Default for Servant {
    fn default() -> Self {
        Self::new()
    }
}
