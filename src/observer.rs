//! Presentation hooks invoked by the pipelines.
//!
//! `target` is the assistant message id for single-turn operations and the
//! endpoint id for comparison panels. All methods default to no-ops.

use std::sync::Mutex;

pub trait StreamObserver: Send + Sync {
    /// A request to `target` is about to be sent.
    fn on_started(&self, _target: &str, _label: &str) {}

    /// `content` is the full accumulated text so far, not just the delta.
    fn on_delta_applied(&self, _target: &str, _content: &str) {}

    fn on_finalized(&self, _target: &str, _response_time: f64) {}

    fn on_error(&self, _target: &str, _message: &str) {}

    /// The operation was cancelled; single-turn placeholders are gone.
    fn on_aborted(&self, _target: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StreamObserver for NullObserver {}

/// One observed callback, as recorded by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Started { target: String, label: String },
    Delta { target: String, content: String },
    Finalized { target: String, response_time: f64 },
    Error { target: String, message: String },
    Aborted { target: String },
}

/// Observer that records every callback in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl StreamObserver for RecordingObserver {
    fn on_started(&self, target: &str, label: &str) {
        self.push(ObservedEvent::Started { target: target.into(), label: label.into() });
    }

    fn on_delta_applied(&self, target: &str, content: &str) {
        self.push(ObservedEvent::Delta { target: target.into(), content: content.into() });
    }

    fn on_finalized(&self, target: &str, response_time: f64) {
        self.push(ObservedEvent::Finalized { target: target.into(), response_time });
    }

    fn on_error(&self, target: &str, message: &str) {
        self.push(ObservedEvent::Error { target: target.into(), message: message.into() });
    }

    fn on_aborted(&self, target: &str) {
        self.push(ObservedEvent::Aborted { target: target.into() });
    }
}
