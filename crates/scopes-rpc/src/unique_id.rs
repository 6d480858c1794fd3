//! Collision-resistant identity generation
//!
//! Identities combine a random component with a process-wide counter, so
//! two generators in the same process (or two processes sharing an
//! endpoint directory) cannot hand out the same identity.

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity generator
#[derive(Debug, Default)]
pub struct UniqueId {}

impl UniqueId {
    pub fn new() -> Self {
        Self {}
    }

    /// Generate a fresh identity string.
    pub fn gen(&self) -> String {
        let random: u64 = rand::random();
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{:08x}", random, counter)
    }
}

/// Generate a fresh identity string with a prefix.
pub fn unique_id(prefix: &str) -> String {
    let id = UniqueId::new().gen();
    if prefix.is_empty() {
        id
    } else {
        format!("{}-{}", prefix, id)
    }
}
