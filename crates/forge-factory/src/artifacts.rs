//! Append-only artifact storage keyed by run, scope and attempt.
//!
//! Content is hashed with blake3. Re-putting identical bytes under an existing
//! key returns the existing reference; different bytes under the same key are
//! rejected, so concurrent runs never overwrite one another.

use crate::FactoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;

const ARTIFACT_REFERENCE_PREFIX: &str = "artifact://";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub run_id: String,
    /// Stage name, or `task` for run-level inputs.
    pub scope: String,
    pub attempt: u32,
    pub name: String,
}

impl ArtifactKey {
    pub fn task(run_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            scope: "task".to_string(),
            attempt: 0,
            name: name.into(),
        }
    }

    pub fn attempt(
        run_id: impl Into<String>,
        stage: impl Into<String>,
        attempt: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scope: stage.into(),
            attempt,
            name: name.into(),
        }
    }

    pub fn path(&self) -> Result<String, FactoryError> {
        for segment in [&self.run_id, &self.scope, &self.name] {
            validate_segment(segment)?;
        }
        Ok(format!(
            "runs/{}/{}/{}/{}",
            self.run_id, self.scope, self.attempt, self.name
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub content_hash: String,
    pub size_bytes: usize,
}

impl ArtifactRef {
    pub fn uri(&self) -> String {
        format!("{ARTIFACT_REFERENCE_PREFIX}{}#{}", self.path, self.content_hash)
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<ArtifactRef, FactoryError>;
    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, FactoryError>;
}

pub async fn put_json(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
    value: &Value,
) -> Result<ArtifactRef, FactoryError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|error| {
        FactoryError::Artifact(format!("failed to serialize artifact '{}': {error}", key.name))
    })?;
    store.put(key, bytes).await
}

pub async fn get_json(
    store: &dyn ArtifactStore,
    reference: &ArtifactRef,
) -> Result<Value, FactoryError> {
    let bytes = store.get(reference).await?;
    serde_json::from_slice(&bytes).map_err(|error| {
        FactoryError::Artifact(format!("artifact '{}' is not JSON: {error}", reference.path))
    })
}

#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    entries: Arc<RwLock<BTreeMap<String, (String, Arc<Vec<u8>>)>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<ArtifactRef, FactoryError> {
        let path = key.path()?;
        let hash = content_hash(&bytes);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| FactoryError::Artifact("artifact write lock poisoned".to_string()))?;
        if let Some((existing, _)) = entries.get(&path) {
            ensure_same_content(&path, existing, &hash)?;
        } else {
            entries.insert(path.clone(), (hash.clone(), Arc::new(bytes.clone())));
        }
        Ok(ArtifactRef {
            path,
            content_hash: hash,
            size_bytes: bytes.len(),
        })
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, FactoryError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| FactoryError::Artifact("artifact read lock poisoned".to_string()))?;
        let (hash, bytes) = entries.get(&reference.path).ok_or_else(|| {
            FactoryError::Artifact(format!("artifact '{}' not found", reference.path))
        })?;
        ensure_same_content(&reference.path, hash, &reference.content_hash)?;
        Ok(bytes.as_ref().clone())
    }
}

/// Stores each artifact as a file under `root`, created exclusively.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<ArtifactRef, FactoryError> {
        let path = key.path()?;
        let hash = content_hash(&bytes);
        let file_path = self.root.join(&path);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| io_error("create artifact directory", &path, error))?;
        }

        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)
            .await;
        match created {
            Ok(mut file) => {
                file.write_all(&bytes)
                    .await
                    .map_err(|error| io_error("write artifact", &path, error))?;
                file.flush()
                    .await
                    .map_err(|error| io_error("flush artifact", &path, error))?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = tokio::fs::read(&file_path)
                    .await
                    .map_err(|error| io_error("read artifact", &path, error))?;
                ensure_same_content(&path, &content_hash(&existing), &hash)?;
            }
            Err(error) => return Err(io_error("create artifact", &path, error)),
        }

        Ok(ArtifactRef {
            path,
            content_hash: hash,
            size_bytes: bytes.len(),
        })
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, FactoryError> {
        let bytes = tokio::fs::read(self.root.join(&reference.path))
            .await
            .map_err(|error| io_error("read artifact", &reference.path, error))?;
        ensure_same_content(&reference.path, &content_hash(&bytes), &reference.content_hash)?;
        Ok(bytes)
    }
}

fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn ensure_same_content(path: &str, stored: &str, expected: &str) -> Result<(), FactoryError> {
    if stored == expected {
        Ok(())
    } else {
        Err(FactoryError::Artifact(format!(
            "artifact '{path}' already holds different content (stored {stored}, got {expected})"
        )))
    }
}

fn validate_segment(segment: &str) -> Result<(), FactoryError> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FactoryError::Artifact(format!(
            "invalid artifact key segment '{segment}'"
        )))
    }
}

fn io_error(action: &str, path: &str, error: std::io::Error) -> FactoryError {
    FactoryError::Artifact(format!("failed to {action} '{path}': {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(flavor = "current_thread")]
    async fn memory_put_same_key_same_content_expected_idempotent_reference() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::attempt("run-1", "developer", 1, "payload.json");
        let first = put_json(&store, &key, &json!({"code": "fn a() {}"}))
            .await
            .expect("first put");
        let second = put_json(&store, &key, &json!({"code": "fn a() {}"}))
            .await
            .expect("identical put");
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert!(first.uri().starts_with("artifact://runs/run-1/developer/1/payload.json#"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_put_same_key_different_content_expected_error() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::task("run-1", "requirement.json");
        store.put(&key, b"one".to_vec()).await.expect("first put");
        let error = store
            .put(&key, b"two".to_vec())
            .await
            .expect_err("overwrite should fail");
        assert!(matches!(error, FactoryError::Artifact(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_put_and_get_expected_round_trip_and_append_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::attempt("run-2", "tester", 3, "report.json");

        let reference = put_json(&store, &key, &json!({"failed": 0}))
            .await
            .expect("put should succeed");
        assert!(dir.path().join(&reference.path).exists());
        assert_eq!(
            get_json(&store, &reference).await.expect("get"),
            json!({"failed": 0})
        );
        assert!(put_json(&store, &key, &json!({"failed": 1})).await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_tampered_hash_expected_error() {
        let store = MemoryArtifactStore::new();
        let mut reference = store
            .put(&ArtifactKey::task("r", "a"), b"bytes".to_vec())
            .await
            .expect("put");
        reference.content_hash = content_hash(b"other");
        assert!(store.get(&reference).await.is_err());
    }

    #[test]
    fn key_path_traversal_segment_expected_error() {
        let key = ArtifactKey::attempt("run", "..", 1, "x");
        assert!(key.path().is_err());
    }
}
