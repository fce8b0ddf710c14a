//! Hint - 「この run は claim できるかもしれない」というキューメッセージ
//!
//! hint は over-approximation です:
//! - run が pending なら、その hint がどこかのキューにある
//! - hint があっても、run が pending とは限らない
//!
//! hint を消費しても得られるのは claim を試す権利だけで、lock ではありません。

use serde::{Deserialize, Serialize};

use super::ids::{MessageId, PopReceipt, RunId, TaskId};

/// JSON body stored in the queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintBody {
    pub task_id: TaskId,
    pub run_id: RunId,
}

/// A leased hint: body plus what is needed to delete or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub task_id: TaskId,
    pub run_id: RunId,
    /// Name of the backing queue the message was polled from.
    pub queue: String,
    pub message_id: MessageId,
    pub receipt: PopReceipt,
}

impl Hint {
    pub fn body(&self) -> HintBody {
        HintBody {
            task_id: self.task_id,
            run_id: self.run_id,
        }
    }
}
