//! ArtifactGc - 期限切れ artifact の回収
//!
//! s3 / azure は Blob を消してからメタ情報を消す。error / redirect はメタ情報だけ。
//! 失敗は数えてログに出し、残りの artifact は続けて処理します（次の sweep で再挑戦）。

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::domain::{ArtifactError, QuayError};
use crate::ports::ArtifactStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub expired: usize,
    pub removed: usize,
    pub errors: usize,
}

pub struct ArtifactGc {
    artifacts: Arc<dyn ArtifactStore>,
}

impl ArtifactGc {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<GcReport, QuayError> {
        let expired = self.artifacts.expired(now).await?;
        let mut report = GcReport {
            expired: expired.len(),
            ..GcReport::default()
        };
        for artifact in &expired {
            if artifact.kind.has_stored_object() {
                match self.artifacts.delete_object(artifact).await {
                    // already gone; only the metadata is left
                    Ok(()) | Err(ArtifactError::NotFound(_)) => {}
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(%artifact, error = %e, "failed to delete artifact object");
                        continue;
                    }
                }
            }
            match self.artifacts.remove(artifact).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(%artifact, error = %e, "failed to remove artifact");
                }
            }
        }
        if report.expired > 0 {
            tracing::info!(
                expired = report.expired,
                removed = report.removed,
                errors = report.errors,
                "artifact gc finished"
            );
        }
        Ok(report)
    }
}
