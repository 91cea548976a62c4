//! Pick-and-place job processing on top of the generic state machine.

mod job;
#[allow(clippy::module_inception)]
mod processor;
mod state;
pub mod telemetry;

pub use job::{JobOutcome, JobPlacement, JobReport, PlacementStatus, PlannedPlacement};
pub use processor::{JobProcessor, transition_graph};
pub use state::{Message, State};
pub use telemetry::{ChannelTelemetry, Fanout, JobEvent, RecordingTelemetry, Telemetry, TracingTelemetry};
