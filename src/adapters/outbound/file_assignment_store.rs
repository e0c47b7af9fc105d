//! File Assignment Store
//!
//! Implements AssignmentStore as a single JSON document on local disk.

use crate::domain::entities::{epoch_millis, PersistedAssignment};
use crate::domain::ports::{AssignmentStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    written_at_ms: u64,
    assignments: Vec<PersistedAssignment>,
}

/// JSON snapshot file, replaced atomically on every save.
///
/// Writes go to `<path>.tmp`, are fsynced, and are then renamed over
/// `path`, so a crash mid-write leaves the previous snapshot intact.
pub struct FileAssignmentStore {
    path: PathBuf,
}

impl FileAssignmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl AssignmentStore for FileAssignmentStore {
    async fn load(&self) -> Result<Vec<PersistedAssignment>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no assignment file at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version(snapshot.version));
        }
        Ok(snapshot.assignments)
    }

    async fn save(&self, rows: &[PersistedAssignment]) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            written_at_ms: epoch_millis(),
            assignments: rows.to_vec(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        // Data must be on disk before the rename makes it visible
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::value_objects::AssignReason;

    fn row(metric: &str, host: &str) -> PersistedAssignment {
        PersistedAssignment {
            metric: metric.to_string(),
            host: host.to_string(),
            tcp_port: 4241,
            reason: AssignReason::RoundRobin,
            assigned_at_ms: 1_700_000_000_000,
            rate: 2.5,
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssignmentStore::new(dir.path().join("assignments.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssignmentStore::new(dir.path().join("nested/assignments.json"));

        let rows = vec![row("sys.cpu.user", "a"), row("sys.mem.free", "b")];
        store.save(&rows).await.unwrap();

        assert_eq!(store.load().await.unwrap(), rows);
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_stale_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssignmentStore::new(dir.path().join("assignments.json"));
        // Leftover from a write that never reached the rename
        std::fs::write(store.tmp_path(), "x".repeat(64 * 1024)).unwrap();

        let rows = vec![row("sys.cpu.user", "a")];
        store.save(&rows).await.unwrap();

        assert_eq!(store.load().await.unwrap(), rows);
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssignmentStore::new(dir.path().join("assignments.json"));

        store.save(&[row("a", "h1"), row("b", "h1")]).await.unwrap();
        store.save(&[row("c", "h2")]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].metric, "c");
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        let store = FileAssignmentStore::new(&path);
        store.save(&[row("sys.cpu.user", "a")]).await.unwrap();

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["written_at_ms"].as_u64().unwrap() > 0);
        assert_eq!(json["assignments"][0]["metric"], "sys.cpu.user");
        assert_eq!(json["assignments"][0]["reason"], "ROUND_ROBIN");
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        std::fs::write(&path, r#"{"version":7,"written_at_ms":0,"assignments":[]}"#).unwrap();

        let store = FileAssignmentStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Version(7))));
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileAssignmentStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Format(_))));
    }
}
