//! On-disk cache of a server's advertised tool schemas.
//!
//! Written after every successful `list_tools`; read is advisory only — the
//! runtime never consults it in place of a live connection unless a caller
//! explicitly asks for `cached_schema` (see `runtime::Runtime::cached_schema`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCache {
    pub updated_at: DateTime<Utc>,
    pub tools: HashMap<String, serde_json::Value>,
}

fn cache_path(dir: &Path) -> PathBuf {
    dir.join("schema.json")
}

/// Persist a server's tool schemas. Creates the cache directory if absent.
pub fn write(dir: &Path, tools: &HashMap<String, serde_json::Value>) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let cache = SchemaCache {
        updated_at: Utc::now(),
        tools: tools.clone(),
    };
    let body = serde_json::to_vec_pretty(&cache)?;
    std::fs::write(cache_path(dir), body)
}

/// Read a previously written cache. Missing files and malformed content both
/// resolve to `None` rather than an error — callers treat absence as "no cache".
pub fn read(dir: &Path) -> Option<SchemaCache> {
    let body = std::fs::read(cache_path(dir)).ok()?;
    serde_json::from_slice(&body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut tools = HashMap::new();
        tools.insert("search".to_string(), serde_json::json!({"type": "object"}));
        write(dir.path(), &tools).unwrap();

        let cache = read(dir.path()).unwrap();
        assert_eq!(cache.tools.len(), 1);
        assert!(cache.tools.contains_key("search"));
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempdir().unwrap();
        assert!(read(dir.path()).is_none());
    }

    #[test]
    fn malformed_file_returns_none_not_error() {
        let dir = tempdir().unwrap();
        std::fs::write(cache_path(dir.path()), b"not json at all").unwrap();
        assert!(read(dir.path()).is_none());
    }
}
