//! Pool - (provisionerId, workerType) の組と worker の識別子
//!
//! キュー・HintPoller はこの組ごとに 1 つずつ存在します。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::QuayError;

/// Identifiers are used as routing keys downstream, so they stay short and dot-free.
pub const IDENTIFIER_MAX_LENGTH: usize = 22;

/// Check `^[a-zA-Z0-9-_]{1,22}$`.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), QuayError> {
    let ok = !value.is_empty()
        && value.len() <= IDENTIFIER_MAX_LENGTH
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(QuayError::InvalidTask(format!(
            "{field} {value:?} must match ^[a-zA-Z0-9-_]{{1,{IDENTIFIER_MAX_LENGTH}}}$"
        )))
    }
}

/// The (provisionerId, workerType) pair tasks are scheduled against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolKey {
    pub provisioner_id: String,
    pub worker_type: String,
}

impl PoolKey {
    pub fn new(provisioner_id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            provisioner_id: provisioner_id.into(),
            worker_type: worker_type.into(),
        }
    }

    pub fn validate(&self) -> Result<(), QuayError> {
        validate_identifier("provisionerId", &self.provisioner_id)?;
        validate_identifier("workerType", &self.worker_type)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provisioner_id, self.worker_type)
    }
}

/// The worker a run gets bound to on claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub worker_group: String,
    pub worker_id: String,
}

impl WorkerIdentity {
    pub fn new(worker_group: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            worker_group: worker_group.into(),
            worker_id: worker_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), QuayError> {
        validate_identifier("workerGroup", &self.worker_group)?;
        validate_identifier("workerId", &self.worker_id)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worker_group, self.worker_id)
    }
}
