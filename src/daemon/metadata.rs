//! The daemon metadata file: `~/.mcporter/daemon/<hash>.meta.json`.
//!
//! Presence is best-effort evidence a daemon is running — callers MUST probe
//! the socket itself (see `daemon::client::probe_status`) before trusting it.
//! Grounded on the teacher's config-driven path derivation (`PorterConfig`'s
//! use of a stable path under the user's home directory).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonMetadata {
    pub pid: u32,
    pub socket_path: PathBuf,
    pub config_path: PathBuf,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub log_path: Option<PathBuf>,
}

/// Directory the daemon's socket and metadata files live under: `~/.mcporter/daemon/`.
pub fn daemon_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mcporter").join("daemon"))
}

/// A short, stable filesystem-safe tag derived from the catalog path, used so
/// distinct catalogs under the same user get distinct daemons.
pub fn config_hash(config_path: &Path) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    config_path.to_string_lossy().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn socket_path(config_path: &Path) -> Option<PathBuf> {
    let hash = config_hash(config_path);
    #[cfg(unix)]
    {
        daemon_dir().map(|dir| dir.join(format!("{hash}.sock")))
    }
    #[cfg(windows)]
    {
        let _ = daemon_dir();
        Some(PathBuf::from(format!(r"\\.\pipe\mcporter-{hash}")))
    }
}

pub fn metadata_path(config_path: &Path) -> Option<PathBuf> {
    let hash = config_hash(config_path);
    daemon_dir().map(|dir| dir.join(format!("{hash}.meta.json")))
}

/// Write the metadata file, creating parent directories as needed.
pub fn write(path: &Path, metadata: &DaemonMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(metadata)?;
    std::fs::write(path, body)?;
    Ok(())
}

/// Read the metadata file. Missing or malformed content both resolve to `None`.
pub fn read(path: &Path) -> Option<DaemonMetadata> {
    let body = std::fs::read(path).ok()?;
    serde_json::from_slice(&body).ok()
}

/// Remove the metadata file. Missing files are not an error.
pub fn unlink(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_hash_is_stable_for_the_same_path() {
        let a = config_hash(Path::new("/home/u/.mcporter/catalog.toml"));
        let b = config_hash(Path::new("/home/u/.mcporter/catalog.toml"));
        assert_eq!(a, b);
    }

    #[test]
    fn config_hash_differs_across_paths() {
        let a = config_hash(Path::new("/home/u/catalog-a.toml"));
        let b = config_hash(Path::new("/home/u/catalog-b.toml"));
        assert_ne!(a, b);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.meta.json");
        let metadata = DaemonMetadata {
            pid: 1234,
            socket_path: dir.path().join("x.sock"),
            config_path: PathBuf::from("/cfg.toml"),
            started_at: chrono::Utc::now(),
            log_path: None,
        };
        write(&path, &metadata).unwrap();
        let read_back = read(&path).unwrap();
        assert_eq!(read_back.pid, 1234);
    }

    #[test]
    fn read_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(read(&dir.path().join("absent.json")).is_none());
    }

    #[test]
    fn unlink_missing_file_does_not_error() {
        let dir = tempdir().unwrap();
        unlink(&dir.path().join("absent.json"));
    }
}
