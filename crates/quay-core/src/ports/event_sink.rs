//! EventSink port - ライフサイクルイベントの通知先
//!
//! 書き込みが成功した後にだけ呼ばれます。失敗しても状態遷移は巻き戻しません。

use crate::domain::DomainEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}
