use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Fractional progress in `[0, 1]` with an optional human-readable note.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProgressEvent {
    pub progress: f64,
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress sink closed")]
    Closed,
    #[error("progress delivery failed: {0}")]
    Delivery(String),
}

/// Receiver of progress events. Failures never affect the reporting operation.
pub trait ProgressSink: Send + Sync {
    /// # Errors
    ///
    /// Returns `ProgressError` when the event cannot be delivered.
    fn report(&self, event: ProgressEvent) -> Result<(), ProgressError>;
}

impl ProgressSink for tokio::sync::mpsc::UnboundedSender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self.send(event).map_err(|_| ProgressError::Closed)
    }
}

/// Best-effort, monotonic progress side channel.
///
/// Values are clamped to `[0, 1]`, mapped into this reporter's window, and
/// never go backwards across all reporters derived from the same root.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn ProgressSink>>,
    floor: Arc<Mutex<f64>>,
    start: f64,
    span: f64,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("attached", &self.sink.is_some())
            .field("start", &self.start)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ProgressReporter {
    #[must_use]
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink: Some(sink),
            floor: Arc::new(Mutex::new(0.0)),
            start: 0.0,
            span: 1.0,
        }
    }

    /// Reporter that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: None,
            floor: Arc::new(Mutex::new(0.0)),
            start: 0.0,
            span: 1.0,
        }
    }

    /// Child reporter mapping its `[0, 1]` onto `[start, start + span]` of this one.
    #[must_use]
    pub fn scaled(&self, start: f64, span: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        let span = span.clamp(0.0, 1.0 - start);
        Self {
            sink: self.sink.clone(),
            floor: Arc::clone(&self.floor),
            start: self.start + start * self.span,
            span: span * self.span,
        }
    }

    pub fn report(&self, progress: f64, message: Option<&str>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let local = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let value = {
            let mut floor = self.floor.lock().unwrap_or_else(PoisonError::into_inner);
            let value = (self.start + local * self.span).max(*floor);
            *floor = value;
            value
        };
        let event = ProgressEvent {
            progress: value,
            message: message.map(str::to_owned),
        };
        if let Err(e) = sink.report(event) {
            tracing::warn!("progress delivery failed: {e}");
        }
    }
}
