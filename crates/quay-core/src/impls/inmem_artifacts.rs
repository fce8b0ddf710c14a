//! InMemoryArtifactStore - 開発用の artifact メタ情報 + object 置き場

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

use crate::domain::{Artifact, ArtifactError};
use crate::ports::ArtifactStore;

#[derive(Default)]
struct Contents {
    /// storage key -> metadata
    metadata: BTreeMap<String, Artifact>,
    /// storage keys that have bytes behind them
    objects: BTreeSet<String>,
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    contents: Mutex<Contents>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an artifact; s3/azure kinds also get a stored object.
    pub async fn put(&self, artifact: Artifact) {
        let mut contents = self.contents.lock().await;
        let key = artifact.storage_key();
        if artifact.kind.has_stored_object() {
            contents.objects.insert(key.clone());
        }
        contents.metadata.insert(key, artifact);
    }

    pub async fn contains(&self, artifact: &Artifact) -> bool {
        self.contents
            .lock()
            .await
            .metadata
            .contains_key(&artifact.storage_key())
    }

    pub async fn object_count(&self) -> usize {
        self.contents.lock().await.objects.len()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>, ArtifactError> {
        let contents = self.contents.lock().await;
        Ok(contents
            .metadata
            .values()
            .filter(|a| a.expires <= now)
            .cloned()
            .collect())
    }

    async fn delete_object(&self, artifact: &Artifact) -> Result<(), ArtifactError> {
        let mut contents = self.contents.lock().await;
        if contents.objects.remove(&artifact.storage_key()) {
            Ok(())
        } else {
            Err(ArtifactError::NotFound(artifact.storage_key()))
        }
    }

    async fn remove(&self, artifact: &Artifact) -> Result<(), ArtifactError> {
        let mut contents = self.contents.lock().await;
        contents
            .metadata
            .remove(&artifact.storage_key())
            .map(|_| ())
            .ok_or_else(|| ArtifactError::NotFound(artifact.storage_key()))
    }
}
