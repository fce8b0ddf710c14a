//! Domain model (IDs, tasks and runs, hints, events, errors).
//!
//! I/O はここには置きません。状態遷移は `task` の純粋なメソッドで表現し、
//! 永続化と条件付き書き込みは `app::task_store` が担当します。

pub mod artifact;
pub mod errors;
pub mod events;
pub mod hint;
pub mod ids;
pub mod pool;
pub mod state;
pub mod task;

pub use self::artifact::{Artifact, ArtifactKind};
pub use self::errors::{ArtifactError, ErrorKind, QuayError, QueueError, TableError};
pub use self::events::DomainEvent;
pub use self::hint::{Hint, HintBody};
pub use self::ids::{MAX_RUN_ID, MessageId, PopReceipt, RunId, TaskId};
pub use self::pool::{PoolKey, WorkerIdentity};
pub use self::state::{Priority, ReasonCreated, ReasonResolved, RunState};
pub use self::task::{Expiry, Resolution, Resolved, Run, Task, TaskDefinition};
