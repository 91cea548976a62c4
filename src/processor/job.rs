use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::State;
use crate::error::ErrorKind;
use crate::model::AlignmentOffset;

/// Tracks the runtime status of one placement during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStatus {
    Pending,
    Processing,
    Complete,
    Skipped,
    Errored,
}

/// A board location paired with one of its placements for the current run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPlacement {
    /// Index into `Job::boards`.
    pub board: usize,
    /// Index into that board's `placements`.
    pub placement: usize,
    pub board_name: String,
    pub placement_id: String,
    pub part_height: f64,
    pub status: PlacementStatus,
}

impl std::fmt::Display for JobPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.board_name, self.placement_id)
    }
}

/// A job placement assigned to a nozzle for one Plan → Place cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPlacement {
    /// Index into the head's nozzles.
    pub nozzle: usize,
    /// Index into the processor's job placements.
    pub job_placement: usize,
    /// Tip to load in the ChangeNozzleTip step. `None` keeps the loaded tip.
    pub nozzle_tip: Option<String>,
    /// Feeder that fed the part, set by the Feed step.
    pub feeder: Option<usize>,
    /// Set by the Align step when an aligner measured the part.
    pub alignment: Option<AlignmentOffset>,
}

impl PlannedPlacement {
    pub fn new(nozzle: usize, job_placement: usize) -> Self {
        Self {
            nozzle,
            job_placement,
            nozzle_tip: None,
            feeder: None,
            alignment: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed,
    Aborted,
    Failed { kind: ErrorKind, message: String },
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "Completed"),
            JobOutcome::Aborted => write!(f, "Aborted"),
            JobOutcome::Failed { kind, message } => write!(f, "Failed ({kind}): {message}"),
        }
    }
}

/// Structured record produced when a run resets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub job_name: String,
    pub outcome: JobOutcome,
    pub state_transitions: Vec<State>,
    pub placed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub pending: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// Placements per hour over the whole run.
    pub cph: f64,
}

impl JobReport {
    pub fn new(
        job_name: &str,
        outcome: JobOutcome,
        state_transitions: Vec<State>,
        placements: &[JobPlacement],
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let duration = now - started_at;
        let count = |status| placements.iter().filter(|p| p.status == status).count();
        let placed = count(PlacementStatus::Complete);
        let duration_ms = duration.num_milliseconds();
        let cph = if duration_ms > 0 {
            placed as f64 / (duration_ms as f64 / 3_600_000.0)
        } else {
            0.0
        };

        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            outcome,
            state_transitions,
            placed,
            skipped: count(PlacementStatus::Skipped),
            errored: count(PlacementStatus::Errored),
            pending: count(PlacementStatus::Pending) + count(PlacementStatus::Processing),
            started_at,
            completed_at: now,
            duration_ms,
            cph,
        }
    }
}
