//! Runtime and registry configuration
//!
//! Configuration file parsing is an external collaborator; these structs
//! are the parsed form handed to [`Runtime::create`](crate::Runtime::create).

use crate::error::{MiddlewareError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Lower bound for the per-reply idle timeout
pub const MIN_REPLY_IDLE_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound for the per-reply idle timeout
pub const MAX_REPLY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Transport kind; only `tcp` is currently supported
    pub default_transport: String,
    /// Identity of the registry servant; empty means no registry
    pub registry_identity: String,
    /// Endpoint of the registry adapter; empty means no registry
    pub registry_endpoint: String,
    /// Endpoint of the registry's oneway state-notification adapter
    pub registry_state_endpoint: String,
    /// Default timeout for twoway invocations
    pub default_twoway_timeout: Duration,
    /// How long a reply channel may stay idle before it is expired
    /// (bounded to 1–300 s)
    pub reply_idle_timeout: Duration,
    /// Minimum interval between reaping passes over idle reply channels
    pub reap_interval: Duration,
    /// Worker pool size per object adapter; ordering per channel is only
    /// guaranteed for size 1
    pub adapter_pool_size: usize,
    /// Directory holding per-scope surfacing caches; `None` disables caching
    pub cache_dir: Option<PathBuf>,
    /// Debug mode: twoway invocations wait without a timeout
    pub debug_mode: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_transport: "tcp".to_string(),
            registry_identity: String::new(),
            registry_endpoint: String::new(),
            registry_state_endpoint: String::new(),
            default_twoway_timeout: Duration::from_secs(2),
            reply_idle_timeout: Duration::from_secs(45),
            reap_interval: Duration::from_secs(10),
            adapter_pool_size: 1,
            cache_dir: None,
            debug_mode: false,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_transport != "tcp" {
            return Err(MiddlewareError::Config(format!(
                "unsupported transport kind: {}",
                self.default_transport
            )));
        }
        if self.reply_idle_timeout < MIN_REPLY_IDLE_TIMEOUT
            || self.reply_idle_timeout > MAX_REPLY_IDLE_TIMEOUT
        {
            return Err(MiddlewareError::Config(format!(
                "reply_idle_timeout must be within {:?}..={:?}, got {:?}",
                MIN_REPLY_IDLE_TIMEOUT, MAX_REPLY_IDLE_TIMEOUT, self.reply_idle_timeout
            )));
        }
        if self.reap_interval.is_zero() {
            return Err(MiddlewareError::Config(
                "reap_interval must be greater than zero".into(),
            ));
        }
        if self.reap_interval > self.reply_idle_timeout {
            return Err(MiddlewareError::Config(format!(
                "reap_interval ({:?}) must not exceed reply_idle_timeout ({:?})",
                self.reap_interval, self.reply_idle_timeout
            )));
        }
        if self.adapter_pool_size == 0 {
            return Err(MiddlewareError::Config(
                "adapter_pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Registry service configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Identity under which the registry servant is registered
    pub identity: String,
    /// Endpoint of the registry's twoway adapter
    pub endpoint: String,
    /// Endpoint of the registry's oneway state-notification adapter
    pub state_endpoint: String,
    /// How long `locate` waits for a launched scope to announce readiness
    pub process_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            identity: "registry".to_string(),
            endpoint: String::new(),
            state_endpoint: String::new(),
            process_timeout: Duration::from_secs(4),
        }
    }
}
