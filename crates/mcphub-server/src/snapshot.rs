//! Registry snapshot persistence.
//!
//! The hub can persist the list of mounted server specs to the working
//! directory and remount them at the next startup. Writes go through a
//! temp file plus rename so a crash never leaves a torn snapshot.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use mcphub_core::{HubError, Result};

/// Persisted registry snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Mounted server specs, in mount order
    pub servers: Vec<ServerConfig>,
}

impl RegistrySnapshot {
    /// Load a snapshot from disk; a missing file is an empty snapshot
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                HubError::config(format!(
                    "registry snapshot at {} is corrupt: {e}",
                    path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(HubError::from(e)),
        }
    }

    /// Persist the snapshot atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        let tmp: PathBuf = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: &str) -> ServerConfig {
        ServerConfig::Local {
            id: id.to_string(),
            command: "mcp-server".to_string(),
            args: vec![],
            env: Default::default(),
            cwd: None,
            auto_restart: true,
            max_restarts: 5,
            restart_delay_ms: 1000,
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let snapshot = RegistrySnapshot {
            servers: vec![local("a"), local("b")],
        };
        snapshot.save(&path).unwrap();

        let loaded = RegistrySnapshot::load(&path).unwrap();
        assert_eq!(loaded.servers.len(), 2);
        assert_eq!(loaded.servers[0].id(), "a");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = RegistrySnapshot::load(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.servers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = RegistrySnapshot::load(&path).unwrap_err();
        assert_eq!(err.kind, mcphub_core::ErrorKind::Config);
    }
}
