//! EventSink の実装
//!
//! - NoopEventSink: 何もしない
//! - TracingEventSink: debug ログに流す
//! - RecordingEventSink: メモリに溜める（テスト用）

use std::sync::Mutex;

use crate::domain::DomainEvent;
use crate::ports::EventSink;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        tracing::debug!(event = event.name(), task_id = %event.task_id(), ?event, "task event");
    }
}

#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::name).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
