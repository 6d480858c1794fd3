//! On-disk surfacing cache
//!
//! Results of the distinguished surfacing query (empty query string) are
//! accumulated while the query runs and written out when it finishes, so a
//! later query can replay them when the scope has no connectivity. The
//! cache is a single JSON document per scope, written to a temporary file
//! and atomically renamed over the previous one. A missing or corrupt
//! cache is not an error; replay degrades to an immediate empty finish.

use crate::error::{MiddlewareError, Result};
use scopes_wire::VariantArray;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the per-scope surfacing cache
pub const SURFACING_CACHE_FILENAME: &str = "surfacing-results.json";

/// Accumulated payloads of one successful surfacing query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    /// One serialized department-list payload per `register_departments`
    pub departments: VariantArray,
    /// Serialized category records, in registration order
    pub categories: VariantArray,
    /// Serialized filter-group records
    pub filter_groups: VariantArray,
    /// One serialized filter-list payload per `push_filters`
    pub filters: VariantArray,
    /// Serialized result records, in push order
    pub results: VariantArray,
}

impl CacheDocument {
    pub fn is_empty(&self) -> bool {
        self.departments.is_empty()
            && self.categories.is_empty()
            && self.filter_groups.is_empty()
            && self.filters.is_empty()
            && self.results.is_empty()
    }
}

/// Handle to one scope's surfacing cache file
#[derive(Debug, Clone)]
pub struct SurfacingCache {
    path: PathBuf,
}

impl SurfacingCache {
    /// Cache handle for the scope directory `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SURFACING_CACHE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `document`, replacing any previous cache atomically.
    pub fn write(&self, document: &CacheDocument) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| MiddlewareError::Resource("cache path has no parent".into()))?;
        fs::create_dir_all(parent)?;

        let bytes = serde_json::to_vec(document)
            .map_err(|e| MiddlewareError::Resource(format!("cannot serialize cache: {}", e)))?;

        // Temp file plus rename keeps a reader from ever seeing a partial
        // write.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        debug!("surfacing cache written to {}", self.path.display());
        Ok(())
    }

    /// Read the cache back. Missing or corrupt caches report an error the
    /// caller is expected to treat as "nothing cached".
    pub fn read(&self) -> Result<CacheDocument> {
        let bytes = fs::read(&self.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| MiddlewareError::Resource(format!("corrupt surfacing cache: {}", e)))
    }
}
