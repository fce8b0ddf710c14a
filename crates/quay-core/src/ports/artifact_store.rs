//! ArtifactStore port - artifact のメタ情報と Blob（S3/Azure）
//!
//! キュー本体は artifact の中身を読み書きしません。
//! 期限切れの回収（`app::gc_loop`）だけがこの port を使います。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Artifact, ArtifactError};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Artifacts whose `expires <= now`.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>, ArtifactError>;

    /// Delete the stored bytes (s3 / azure kinds only).
    async fn delete_object(&self, artifact: &Artifact) -> Result<(), ArtifactError>;

    /// Drop the metadata entry.
    async fn remove(&self, artifact: &Artifact) -> Result<(), ArtifactError>;
}
