use crate::{FactoryError, RunSnapshot};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Persistence for run records. The engine saves after every advance and
/// archives once a run reaches a terminal state.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), FactoryError>;
    async fn archive(&self, snapshot: &RunSnapshot) -> Result<(), FactoryError>;
    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>, FactoryError>;
}

#[derive(Clone, Default)]
pub struct MemoryRunStore {
    active: Arc<RwLock<BTreeMap<String, RunSnapshot>>>,
    archived: Arc<RwLock<BTreeMap<String, RunSnapshot>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active
            .read()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn archived_ids(&self) -> Vec<String> {
        self.archived
            .read()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned() -> FactoryError {
    FactoryError::Storage("run store lock poisoned".to_string())
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), FactoryError> {
        self.active
            .write()
            .map_err(|_| poisoned())?
            .insert(snapshot.run.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn archive(&self, snapshot: &RunSnapshot) -> Result<(), FactoryError> {
        self.active
            .write()
            .map_err(|_| poisoned())?
            .remove(&snapshot.run.id);
        self.archived
            .write()
            .map_err(|_| poisoned())?
            .insert(snapshot.run.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>, FactoryError> {
        if let Some(snapshot) = self.active.read().map_err(|_| poisoned())?.get(run_id) {
            return Ok(Some(snapshot.clone()));
        }
        Ok(self
            .archived
            .read()
            .map_err(|_| poisoned())?
            .get(run_id)
            .cloned())
    }
}

/// One pretty-printed JSON file per run under `active/` or `archive/`.
#[derive(Clone, Debug)]
pub struct JsonFileRunStore {
    root: PathBuf,
}

impl JsonFileRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn active_path(&self, run_id: &str) -> PathBuf {
        self.root.join("active").join(format!("{run_id}.json"))
    }

    fn archive_path(&self, run_id: &str) -> PathBuf {
        self.root.join("archive").join(format!("{run_id}.json"))
    }

    /// Writes through a sibling temp file so readers never see a partial
    /// snapshot.
    async fn write_atomic(path: &Path, snapshot: &RunSnapshot) -> Result<(), FactoryError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|error| FactoryError::Storage(format!("serialize run: {error}")))?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), FactoryError> {
            let parent = path.parent().ok_or_else(|| {
                FactoryError::Storage(format!("'{}' has no parent directory", path.display()))
            })?;
            std::fs::create_dir_all(parent).map_err(|error| storage_error("create", parent, error))?;
            let mut temp = tempfile::NamedTempFile::new_in(parent)
                .map_err(|error| storage_error("create temp file in", parent, error))?;
            temp.write_all(&bytes)
                .and_then(|()| temp.as_file().sync_all())
                .map_err(|error| storage_error("write", temp.path(), error))?;
            temp.persist(&path)
                .map_err(|error| storage_error("rename", &path, error.error))?;
            Ok(())
        })
        .await
        .map_err(|error| FactoryError::Storage(format!("write task failed: {error}")))?
    }

    async fn read(path: &Path) -> Result<Option<RunSnapshot>, FactoryError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|error| FactoryError::Storage(format!("decode '{}': {error}", path.display()))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(storage_error("read", path, error)),
        }
    }
}

fn storage_error(action: &str, path: &Path, error: std::io::Error) -> FactoryError {
    FactoryError::Storage(format!("failed to {action} '{}': {error}", path.display()))
}

#[async_trait]
impl RunStore for JsonFileRunStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), FactoryError> {
        Self::write_atomic(&self.active_path(&snapshot.run.id), snapshot).await
    }

    async fn archive(&self, snapshot: &RunSnapshot) -> Result<(), FactoryError> {
        Self::write_atomic(&self.archive_path(&snapshot.run.id), snapshot).await?;
        match tokio::fs::remove_file(self.active_path(&snapshot.run.id)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(storage_error(
                "remove",
                &self.active_path(&snapshot.run.id),
                error,
            )),
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>, FactoryError> {
        if let Some(snapshot) = Self::read(&self.active_path(run_id)).await? {
            return Ok(Some(snapshot));
        }
        Self::read(&self.archive_path(run_id)).await
    }
}
