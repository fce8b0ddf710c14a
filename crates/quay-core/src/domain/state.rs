//! State - run の状態と遷移理由
//!
//! # 状態遷移
//! - pending → running（claim のみ）
//! - running → completed / failed / exception（resolve・cancel・reaper）
//! - pending → failed（cancel・deadline 超過）
//!
//! terminal な run は二度と変化しません。再実行は新しい run の追加で表現します。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

impl RunState {
    /// pending か running なら active
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Pending | RunState::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Exception => "exception",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCreated {
    NewTask,
    /// Automatic retry after an infrastructure failure.
    Retry,
    /// Operator-initiated rerun.
    Rerun,
    /// Retry requested by the worker itself.
    TaskRetry,
}

/// Why a run reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonResolved {
    Completed,
    Failed,
    DeadlineExceeded,
    Canceled,
    ClaimExpired,
    WorkerShutdown,
}

impl fmt::Display for ReasonResolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonResolved::Completed => "completed",
            ReasonResolved::Failed => "failed",
            ReasonResolved::DeadlineExceeded => "deadline-exceeded",
            ReasonResolved::Canceled => "canceled",
            ReasonResolved::ClaimExpired => "claim-expired",
            ReasonResolved::WorkerShutdown => "worker-shutdown",
        };
        f.write_str(s)
    }
}

/// Priority tier. Each tier is backed by its own queue per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Poll order: highest tier first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_and_running_are_active() {
        assert!(RunState::Pending.is_active());
        assert!(RunState::Running.is_active());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Exception.is_terminal());
    }

    #[test]
    fn reasons_serialize_kebab_case() {
        let json = serde_json::to_string(&ReasonResolved::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline-exceeded\"");
        let json = serde_json::to_string(&ReasonCreated::TaskRetry).unwrap();
        assert_eq!(json, "\"task-retry\"");
    }

    #[test]
    fn priority_tiers_poll_high_first() {
        assert_eq!(Priority::ALL[0], Priority::High);
        assert!(Priority::High < Priority::Low);
    }
}
