//! Artifact metadata.
//!
//! The queue never touches artifact bytes. It only keeps enough metadata to
//! route deletion to the right backing store when the artifact expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{RunId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    S3,
    Azure,
    /// Placeholder recording that the worker failed to upload.
    Error,
    /// Points somewhere else; nothing stored by us.
    Redirect,
}

impl ArtifactKind {
    /// Kinds whose bytes live in a store we must clean up.
    pub fn has_stored_object(self) -> bool {
        matches!(self, ArtifactKind::S3 | ArtifactKind::Azure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub name: String,
    pub kind: ArtifactKind,
    pub content_type: String,
    pub expires: DateTime<Utc>,
}

impl Artifact {
    /// `<taskId>/<runId>/<name>`, the key objects are stored under.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.task_id, self.run_id, self.name)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}
