//! Observational sinks for job progress.
//!
//! Telemetry never influences control flow: sinks receive events after the
//! fact and cannot fail.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::job::JobOutcome;
use super::state::{Message, State};
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobEvent {
    /// Human readable status text.
    Status(String),
    StateChanged {
        from: State,
        to: State,
        message: Message,
    },
    PlacementComplete {
        board: String,
        placement: String,
        nozzle: String,
    },
    PlacementSkipped {
        board: String,
        placement: String,
    },
    PlacementErrored {
        board: String,
        placement: String,
        kind: ErrorKind,
        message: String,
    },
    FeederDisabled {
        feeder: String,
        reason: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Finished(JobOutcome),
}

pub trait Telemetry: Send + Sync {
    fn emit(&self, event: JobEvent);

    fn status(&self, text: String) {
        self.emit(JobEvent::Status(text));
    }
}

/// Mirrors events into the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn emit(&self, event: JobEvent) {
        match event {
            JobEvent::Status(text) => info!("{text}"),
            JobEvent::StateChanged { from, to, message } => {
                info!(%from, %to, %message, "state changed")
            }
            JobEvent::PlacementComplete {
                board,
                placement,
                nozzle,
            } => info!(%board, %placement, %nozzle, "placement complete"),
            JobEvent::PlacementSkipped { board, placement } => {
                warn!(%board, %placement, "placement skipped")
            }
            JobEvent::PlacementErrored {
                board,
                placement,
                kind,
                message,
            } => warn!(%board, %placement, %kind, "placement errored: {message}"),
            JobEvent::FeederDisabled { feeder, reason } => {
                warn!(%feeder, "feeder disabled: {reason}")
            }
            JobEvent::Error { kind, message } => error!(%kind, "{message}"),
            JobEvent::Finished(outcome) => info!(%outcome, "job finished"),
        }
    }
}

/// Forwards events to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelTelemetry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Telemetry for ChannelTelemetry {
    fn emit(&self, event: JobEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Target states of every recorded state change, in order.
    pub fn states(&self) -> Vec<State> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn emit(&self, event: JobEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Sends every event to each inner sink.
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<Arc<dyn Telemetry>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Telemetry>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Telemetry for Fanout {
    fn emit(&self, event: JobEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_keeps_order_and_filters_states() {
        let rec = RecordingTelemetry::new();
        rec.status("hello".into());
        rec.emit(JobEvent::StateChanged {
            from: State::Uninitialized,
            to: State::Ready,
            message: Message::Initialize,
        });

        assert_eq!(rec.events().len(), 2);
        assert_eq!(rec.events()[0], JobEvent::Status("hello".into()));
        assert_eq!(rec.states(), vec![State::Ready]);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = RecordingTelemetry::new();
        let b = RecordingTelemetry::new();
        let fanout = Fanout::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingTelemetry));

        fanout.status("x".into());
        assert_eq!(a.events(), b.events());
        assert_eq!(a.events().len(), 1);
    }

    #[tokio::test]
    async fn channel_delivers_events() {
        let (sink, mut rx) = ChannelTelemetry::new();
        sink.emit(JobEvent::Finished(JobOutcome::Completed));
        assert_eq!(rx.recv().await, Some(JobEvent::Finished(JobOutcome::Completed)));

        drop(rx);
        // Sending with no receiver is silently ignored.
        sink.status("nobody listening".into());
    }
}
