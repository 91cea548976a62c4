//! The pick-and-place job processor.
//!
//! [`JobProcessor`] owns a [`StateMachine`] over [`State`] and [`Message`]
//! plus a run context holding the machine, the loaded job and the per-run
//! bookkeeping. Every physical step is a transition action, so pausing
//! between two `next()` calls never interrupts a motion.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::job::{JobOutcome, JobPlacement, JobReport, PlacementStatus, PlannedPlacement};
use super::state::{Message, State};
use super::telemetry::{JobEvent, Telemetry};
use crate::command::{Retry, Step, run_to_completion};
use crate::config::ProcessorConfig;
use crate::error::JobError;
use crate::fsm::{InvalidTransition, StateMachine};
use crate::machine::{Interlock, Machine};
use crate::model::{ErrorHandling, Job, Location, Part, PlacementKind, board_placement_location};
use crate::planner::{Candidate, plan};

type Table = StateMachine<State, Message, RunContext, JobError>;

/// Work done for one planned placement inside a batch step.
type BatchStep = fn(&mut RunContext, usize) -> Result<(), JobError>;

/// Drives one job at a time through the machine.
///
/// A job is loaded with [`initialize`](Self::initialize) and advanced with
/// [`next`](Self::next) until it returns `false`, at which point the
/// processor is back in [`State::Uninitialized`] and the run's
/// [`JobReport`] is available. Any step error ends the job: the processor
/// aborts, runs cleanup, resets and hands the error back.
pub struct JobProcessor {
    fsm: Table,
    ctx: RunContext,
}

struct RunContext {
    machine: Machine,
    config: ProcessorConfig,
    telemetry: Arc<dyn Telemetry>,
    job: Option<Job>,
    placements: Vec<JobPlacement>,
    planned: Vec<PlannedPlacement>,
    /// Fiducial-corrected board locations, indexed like `Job::boards`.
    board_locations: Vec<Location>,
    outcome: Option<JobOutcome>,
    visited: Vec<State>,
    started_at: DateTime<Utc>,
    last_job: Option<Job>,
    last_report: Option<JobReport>,
}

fn transition_table() -> Table {
    use Message::*;

    let mut fsm = StateMachine::new(State::Uninitialized);
    fsm.add(State::Uninitialized, Initialize, State::Ready, Some(RunContext::do_initialize), None)
        .add(State::Ready, Next, State::PreFlight, None, None)
        .add(State::PreFlight, Next, State::FiducialCheck, Some(RunContext::do_preflight), None)
        .add(State::FiducialCheck, Next, State::Plan, Some(RunContext::do_fiducial_check), None)
        .add(State::FiducialCheck, Skip, State::Plan, None, None)
        .add(State::Plan, Next, State::ChangeNozzleTip, Some(RunContext::do_plan), None)
        .add(State::Plan, Complete, State::Complete, None, Some(Next))
        .add(State::ChangeNozzleTip, Next, State::Feed, Some(RunContext::do_change_nozzle_tip), None)
        .add(State::Feed, Next, State::Pick, Some(RunContext::do_feed), None)
        .add(State::Pick, Next, State::Align, Some(RunContext::do_pick), None)
        .add(State::Align, Next, State::Place, Some(RunContext::do_align), None)
        .add(State::Place, Next, State::Plan, Some(RunContext::do_place), None);

    for state in State::ALL {
        if state.is_batch_step() {
            fsm.add(state, Skip, state, Some(RunContext::do_skip), None);
        }
        if state.is_working() {
            fsm.add(state, Abort, State::Aborted, None, Some(Next));
        }
    }

    fsm.add(State::Complete, Next, State::Cleanup, None, None)
        .add(State::Aborted, Next, State::Cleanup, None, None)
        .add(State::Cleanup, Next, State::Stopped, Some(RunContext::do_cleanup), Some(Reset))
        .add(State::Stopped, Reset, State::Uninitialized, Some(RunContext::do_reset), None);
    fsm
}

/// The job processor's transition table as a Graphviz digraph.
pub fn transition_graph() -> String {
    transition_table().to_dot("JobProcessor")
}

impl JobProcessor {
    pub fn new(machine: Machine, config: ProcessorConfig, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            fsm: transition_table(),
            ctx: RunContext {
                machine,
                config,
                telemetry,
                job: None,
                placements: Vec::new(),
                planned: Vec::new(),
                board_locations: Vec::new(),
                outcome: None,
                visited: Vec::new(),
                started_at: Utc::now(),
                last_job: None,
                last_report: None,
            },
        }
    }

    pub fn state(&self) -> State {
        self.fsm.state()
    }

    /// True while a job is loaded.
    pub fn is_running(&self) -> bool {
        self.fsm.state() != State::Uninitialized
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.ctx.config
    }

    pub fn machine(&self) -> &Machine {
        &self.ctx.machine
    }

    /// Mutable access to the machine.
    ///
    /// Borrowing the machine while a job is working trips the interlock, so
    /// the next step turns into a forced abort.
    pub fn machine_mut(&mut self) -> &mut Machine {
        if self.fsm.state().is_working() {
            self.ctx
                .machine
                .interlock()
                .trip("machine modified while a job was running");
        }
        &mut self.ctx.machine
    }

    pub fn interlock(&self) -> Interlock {
        self.ctx.machine.interlock()
    }

    pub fn job(&self) -> Option<&Job> {
        self.ctx.job.as_ref()
    }

    pub fn job_placements(&self) -> &[JobPlacement] {
        &self.ctx.placements
    }

    /// The batch being worked on, in nozzle order.
    pub fn planned(&self) -> &[PlannedPlacement] {
        &self.ctx.planned
    }

    /// The job of the last finished run, with its placed flags written back.
    pub fn last_job(&self) -> Option<&Job> {
        self.ctx.last_job.as_ref()
    }

    pub fn last_report(&self) -> Option<&JobReport> {
        self.ctx.last_report.as_ref()
    }

    /// Load `job`. Only accepted while no other job is loaded.
    pub fn initialize(&mut self, job: Job) -> Result<(), JobError> {
        let state = self.fsm.state();
        if !self.fsm.can_send(Message::Initialize) {
            return Err(InvalidTransition {
                state,
                message: Message::Initialize,
            }
            .into());
        }
        self.ctx.begin(job);
        self.send(Message::Initialize).map(|_| ())
    }

    /// Advance the job by one step. Returns whether the job is still running.
    pub fn next(&mut self) -> Result<bool, JobError> {
        let state = self.fsm.state();
        if state.is_working()
            && let Err(e) = self.ctx.machine.interlock().check()
        {
            return Err(self.fail(e));
        }

        let message = if state == State::Plan && !self.ctx.has_pending() {
            self.ctx.outcome = Some(JobOutcome::Completed);
            Message::Complete
        } else {
            Message::Next
        };
        self.send(message)
    }

    /// True when the current step offers a skip.
    pub fn can_skip(&self) -> bool {
        self.fsm.can_send(Message::Skip)
    }

    /// Skip the fiducial check, or the first placement of the current batch.
    pub fn skip(&mut self) -> Result<bool, JobError> {
        self.send(Message::Skip)
    }

    /// Abort the job and drive it through cleanup back to `Uninitialized`.
    ///
    /// A job already past its working states is simply finished.
    pub fn abort(&mut self) -> Result<(), JobError> {
        let state = self.fsm.state();
        if state == State::Uninitialized {
            return Err(InvalidTransition {
                state,
                message: Message::Abort,
            }
            .into());
        }
        if state.is_working() {
            info!(%state, "aborting job");
            self.ctx.outcome = Some(JobOutcome::Aborted);
            self.ctx.status("Aborting job.");
        }
        self.drain()
    }

    fn send(&mut self, message: Message) -> Result<bool, JobError> {
        let state = self.fsm.state();
        if !self.fsm.can_send(message) {
            return Err(InvalidTransition { state, message }.into());
        }
        if let Err(e) = self.dispatch(message) {
            return Err(self.fail(e));
        }
        Ok(self.is_running())
    }

    /// Send `message` and every auto message that follows it.
    fn dispatch(&mut self, message: Message) -> Result<(), JobError> {
        let mut pending = Some(message);
        while let Some(message) = pending {
            let from = self.fsm.state();
            let to = self
                .fsm
                .target(message)
                .ok_or(InvalidTransition { state: from, message })?;

            debug!(%from, %to, %message, "transition");
            self.ctx.visited.push(to);
            self.ctx
                .telemetry
                .emit(JobEvent::StateChanged { from, to, message });
            pending = self.fsm.send(&mut self.ctx, message)?;
        }
        Ok(())
    }

    /// Record `error` as the job's outcome and wind the job down.
    fn fail(&mut self, error: JobError) -> JobError {
        let kind = error.kind();
        error!(state = %self.fsm.state(), %kind, "job failed: {error}");
        self.ctx.outcome = Some(JobOutcome::Failed {
            kind,
            message: error.to_string(),
        });
        self.ctx.telemetry.emit(JobEvent::Error {
            kind,
            message: error.to_string(),
        });
        if let Err(e) = self.drain() {
            warn!(error = %e, "cleanup after failure did not finish cleanly");
        }
        error
    }

    /// Abort if working, then step through cleanup and reset.
    ///
    /// Later steps still run when one fails; the first error is returned.
    fn drain(&mut self) -> Result<(), JobError> {
        let mut first_error = None;
        for _ in 0..State::ALL.len() * 2 {
            let Some(message) = [Message::Abort, Message::Next, Message::Reset]
                .into_iter()
                .find(|m| self.fsm.can_send(*m))
            else {
                break;
            };
            if let Err(e) = self.dispatch(message) {
                warn!(%message, error = %e, "error while winding down job");
                self.ctx.telemetry.emit(JobEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl RunContext {
    fn status(&self, text: impl Into<String>) {
        self.telemetry.status(text.into());
    }

    fn begin(&mut self, job: Job) {
        self.job = Some(job);
        self.placements.clear();
        self.planned.clear();
        self.board_locations.clear();
        self.outcome = None;
        self.visited.clear();
        self.started_at = Utc::now();
    }

    fn has_pending(&self) -> bool {
        self.placements
            .iter()
            .any(|p| p.status == PlacementStatus::Pending)
    }

    fn part_for(&self, job_placement: usize) -> Result<Part, JobError> {
        let job = self.job.as_ref().ok_or(JobError::NoJob)?;
        let jp = &self.placements[job_placement];
        let board = &job.boards[jp.board];
        job.resolve_part(board, &board.placements[jp.placement])
            .cloned()
    }

    fn error_handling(&self, job_placement: usize) -> ErrorHandling {
        let jp = &self.placements[job_placement];
        self.job
            .as_ref()
            .map(|job| job.boards[jp.board].placements[jp.placement].error_handling)
            .unwrap_or_default()
    }

    fn do_initialize(&mut self) -> Result<(), JobError> {
        let job = self.job.as_ref().ok_or(JobError::NoJob)?;
        info!(job = %job.name, boards = job.boards.len(), "job initialized");
        self.status(format!("Job {} loaded.", job.name));
        Ok(())
    }

    /// Collect the placements to run and make sure every one of them can be
    /// resolved to a part, a nozzle tip and a feeder before anything moves.
    fn do_preflight(&mut self) -> Result<(), JobError> {
        let job = self.job.as_ref().ok_or(JobError::NoJob)?;
        self.status("Checking job for setup errors.");

        let mut placements = Vec::new();
        for (b, board) in job.boards.iter().enumerate() {
            if !board.enabled {
                continue;
            }
            let mut ids = HashSet::new();
            for placement in &board.placements {
                if !ids.insert(placement.id.as_str()) {
                    return Err(JobError::InvalidJob(format!(
                        "Duplicate placement id {} on board {}.",
                        placement.id, board.board
                    )));
                }
            }

            for (p, placement) in board.placements.iter().enumerate() {
                if placement.kind != PlacementKind::Place
                    || !placement.enabled
                    || placement.side != board.side
                    || board.is_placed(&placement.id)
                {
                    continue;
                }
                let part = job.resolve_part(board, placement)?;
                if part.height <= 0.0 {
                    return Err(JobError::InvalidJob(format!(
                        "Part height for {} must be greater than zero.",
                        part.id
                    )));
                }
                self.machine.find_nozzle_tip(part)?;
                self.machine.find_feeder(part)?;

                placements.push(JobPlacement {
                    board: b,
                    placement: p,
                    board_name: board.board.clone(),
                    placement_id: placement.id.clone(),
                    part_height: part.height,
                    status: PlacementStatus::Pending,
                });
            }
        }
        if !placements.is_empty() && self.machine.head.nozzles.is_empty() {
            return Err(JobError::ResourceResolution("The head has no nozzles.".into()));
        }

        self.board_locations = job.boards.iter().map(|b| b.location).collect();
        self.placements = placements;
        self.planned.clear();

        self.machine.motion.move_to_safe_z(self.config.safe_z_speed)?;
        self.machine.discard_all(self.config.move_speed)?;

        info!(placements = self.placements.len(), "pre-flight complete");
        Ok(())
    }

    fn do_fiducial_check(&mut self) -> Result<(), JobError> {
        let job = self.job.as_ref().ok_or(JobError::NoJob)?;
        for (b, board) in job.boards.iter().enumerate() {
            if !board.enabled || !board.check_fiducials {
                continue;
            }
            self.telemetry
                .status(format!("Checking fiducials for {}.", board.board));
            let location = self.machine.vision.locate_board(board)?;
            debug!(
                board = %board.board,
                x = location.x,
                y = location.y,
                rotation = location.rotation,
                "board located"
            );
            self.board_locations[b] = location;
        }
        Ok(())
    }

    fn do_plan(&mut self) -> Result<(), JobError> {
        self.planned.clear();
        let pending: Vec<Candidate<usize>> = self
            .placements
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status == PlacementStatus::Pending)
            .map(|(i, p)| Candidate {
                key: i,
                height: p.part_height,
            })
            .collect();
        let nozzles: Vec<usize> = (0..self.machine.head.nozzles.len()).collect();

        let Some(batch) = plan(&pending, &nozzles) else {
            return Ok(());
        };
        debug!(height = batch.height(), size = batch.len(), "planned batch");
        let mut batch: Vec<PlannedPlacement> = batch
            .into_iter()
            .map(|(nozzle, job_placement)| PlannedPlacement::new(nozzle, job_placement))
            .collect();

        // Placements that can't get a tip wait for a later batch.
        let mut first_blocked = None;
        while let Some(blocked) = self.assign_nozzle_tips(&mut batch)? {
            let dropped = batch.remove(blocked);
            debug!(placement = %self.placements[dropped.job_placement], "no free nozzle tip");
            first_blocked.get_or_insert(dropped.job_placement);
        }
        if batch.is_empty()
            && let Some(blocked) = first_blocked
        {
            return Err(JobError::NozzleTipChange(format!(
                "No free nozzle tip for {}.",
                self.placements[blocked]
            )));
        }

        for planned in &batch {
            self.placements[planned.job_placement].status = PlacementStatus::Processing;
        }
        self.planned = batch;

        let summary: Vec<String> = self
            .planned
            .iter()
            .map(|p| {
                format!(
                    "{} -> {}",
                    self.machine.nozzle_id(p.nozzle),
                    self.placements[p.job_placement]
                )
            })
            .collect();
        self.status(format!("Planned {}.", summary.join(", ")));
        Ok(())
    }

    fn do_change_nozzle_tip(&mut self) -> Result<(), JobError> {
        self.run_batch(Self::change_nozzle_tip)
    }

    fn do_feed(&mut self) -> Result<(), JobError> {
        self.run_batch(Self::feed)
    }

    fn do_pick(&mut self) -> Result<(), JobError> {
        self.run_batch(Self::pick)
    }

    fn do_align(&mut self) -> Result<(), JobError> {
        self.run_batch(Self::align)
    }

    fn do_place(&mut self) -> Result<(), JobError> {
        self.run_batch(Self::place)
    }

    /// Run `step` for every planned placement, in nozzle order.
    ///
    /// A failing placement with [`ErrorHandling::Defer`] is dropped from the
    /// batch and the rest carry on; any other failure ends the step.
    fn run_batch(&mut self, step: BatchStep) -> Result<(), JobError> {
        let mut i = 0;
        while i < self.planned.len() {
            match step(self, i) {
                Ok(()) => i += 1,
                Err(e) => {
                    let job_placement = self.planned[i].job_placement;
                    if matches!(e, JobError::Interlock(_) | JobError::InvalidTransition { .. })
                        || self.error_handling(job_placement) != ErrorHandling::Defer
                    {
                        return Err(e);
                    }
                    self.defer(i, e)?;
                }
            }
        }
        Ok(())
    }

    fn defer(&mut self, index: usize, error: JobError) -> Result<(), JobError> {
        let planned = self.planned.remove(index);
        let placement = &mut self.placements[planned.job_placement];
        placement.status = PlacementStatus::Errored;
        warn!(%placement, error = %error, "placement errored, continuing");
        self.telemetry.emit(JobEvent::PlacementErrored {
            board: placement.board_name.clone(),
            placement: placement.placement_id.clone(),
            kind: error.kind(),
            message: error.to_string(),
        });
        self.machine.discard(planned.nozzle, self.config.move_speed)
    }

    /// Pick the tip each nozzle of `batch` needs.
    ///
    /// Tips on batch nozzles stay where they are and no tip goes to two
    /// nozzles. Returns the index of the first entry left without a tip.
    fn assign_nozzle_tips(&self, batch: &mut [PlannedPlacement]) -> Result<Option<usize>, JobError> {
        let busy: Vec<usize> = batch.iter().map(|p| p.nozzle).collect();
        let mut taken: Vec<String> = Vec::new();
        for (i, planned) in batch.iter_mut().enumerate() {
            let part = self.part_for(planned.job_placement)?;
            if self.machine.head.nozzles[planned.nozzle].can_handle(&part) {
                planned.nozzle_tip = None;
                continue;
            }
            let Some(tip) = self.machine.free_nozzle_tip(&part, &busy, &taken) else {
                return Ok(Some(i));
            };
            taken.push(tip.id.clone());
            planned.nozzle_tip = Some(tip.id.clone());
        }
        Ok(None)
    }

    fn change_nozzle_tip(&mut self, index: usize) -> Result<(), JobError> {
        let nozzle = self.planned[index].nozzle;
        let Some(tip_id) = self.planned[index].nozzle_tip.clone() else {
            return Ok(());
        };
        let tip = self
            .machine
            .head
            .nozzle_tips
            .iter()
            .find(|t| t.id == tip_id)
            .cloned()
            .ok_or_else(|| JobError::NozzleTipChange(format!("Unknown nozzle tip {tip_id}.")))?;
        let nozzle_id = self.machine.nozzle_id(nozzle);
        self.status(format!("Changing nozzle tip on {nozzle_id} to {}.", tip.id));
        self.machine.motion.move_to_safe_z(self.config.safe_z_speed)?;

        // An idle nozzle may still carry the tip.
        if let Some(other) = self.machine.nozzle_with_tip(&tip.id).filter(|&n| n != nozzle) {
            let other_id = self.machine.nozzle_id(other);
            debug!(tip = %tip.id, from = %other_id, "moving nozzle tip");
            self.machine.head.nozzles[other].unload_nozzle_tip()?;
        }

        let n = &mut self.machine.head.nozzles[nozzle];
        if n.nozzle_tip().is_some() {
            n.unload_nozzle_tip()?;
        }
        n.load_nozzle_tip(&tip)?;
        info!(nozzle = %nozzle_id, tip = %tip.id, "nozzle tip changed");
        Ok(())
    }

    /// Feed from the first enabled feeder for the part. A feeder that runs
    /// out of retries is disabled and the next one is tried.
    fn feed(&mut self, index: usize) -> Result<(), JobError> {
        let (nozzle, job_placement) = (self.planned[index].nozzle, self.planned[index].job_placement);
        let part = self.part_for(job_placement)?;
        let nozzle_id = self.machine.nozzle_id(nozzle);

        let mut last_failure: Option<(String, JobError)> = None;
        loop {
            let feeder = match self.machine.find_feeder(&part) {
                Ok(feeder) => feeder,
                Err(e) => {
                    return Err(match last_failure {
                        Some((id, cause)) => JobError::Feeder(format!(
                            "Feeder {id} failed to feed {}: {cause}",
                            part.id
                        )),
                        None => e,
                    });
                }
            };
            let feeder_id = self.machine.feeders[feeder].id().to_string();
            let retries = self.machine.feeders[feeder].retry_count();
            self.telemetry.status(format!(
                "Feeding {} from {feeder_id} for {nozzle_id}.",
                part.id
            ));

            let result = {
                let feeders = &mut self.machine.feeders;
                let mut command = Retry::new(
                    retries,
                    Step::new(format!("Feed {feeder_id}"), || {
                        feeders[feeder].feed(&nozzle_id).map(|()| true)
                    }),
                );
                run_to_completion::<JobError, _>(&mut command)
            };

            match result {
                Ok(_) => {
                    self.planned[index].feeder = Some(feeder);
                    return Ok(());
                }
                Err(e) => {
                    self.machine.feeders[feeder].set_enabled(false);
                    warn!(feeder = %feeder_id, error = %e, "feeder disabled");
                    self.telemetry.emit(JobEvent::FeederDisabled {
                        feeder: feeder_id.clone(),
                        reason: e.to_string(),
                    });
                    last_failure = Some((feeder_id, e));
                }
            }
        }
    }

    fn pick(&mut self, index: usize) -> Result<(), JobError> {
        let (nozzle, job_placement) = (self.planned[index].nozzle, self.planned[index].job_placement);
        let feeder = self.planned[index].feeder.ok_or_else(|| {
            JobError::Feeder(format!(
                "No feeder was fed for {}.",
                self.placements[job_placement]
            ))
        })?;
        let part = self.part_for(job_placement)?;
        let nozzle_id = self.machine.nozzle_id(nozzle);
        let location = self.machine.feeders[feeder].pick_location()?;
        let speed = self.config.move_speed;
        self.status(format!("Picking {} with {nozzle_id}.", part.id));

        {
            let machine = &mut self.machine;
            let mut command = Retry::new(
                self.config.pick_retry_count,
                Step::new(format!("Pick {nozzle_id}"), || -> Result<bool, JobError> {
                    machine.move_to_location_at_safe_z(&nozzle_id, location, speed)?;
                    machine.head.nozzles[nozzle].pick(&part)?;
                    Ok(true)
                }),
            );
            run_to_completion::<JobError, _>(&mut command)?;
        }
        self.machine.motion.move_to_safe_z(self.config.safe_z_speed)?;
        self.machine.feeders[feeder].post_pick(&nozzle_id)
    }

    fn align(&mut self, index: usize) -> Result<(), JobError> {
        let (nozzle, job_placement) = (self.planned[index].nozzle, self.planned[index].job_placement);
        let part = self.part_for(job_placement)?;
        let nozzle_id = self.machine.nozzle_id(nozzle);

        let mut offset = None;
        {
            let vision = &mut self.machine.vision;
            let mut command = Retry::new(
                self.config.align_retry_count,
                Step::new(format!("Align {nozzle_id}"), || -> Result<bool, JobError> {
                    offset = vision.find_alignment_offset(&part, &nozzle_id)?;
                    Ok(true)
                }),
            );
            run_to_completion::<JobError, _>(&mut command)?;
        }
        if let Some(offset) = offset {
            debug!(
                nozzle = %nozzle_id,
                x = offset.location.x,
                y = offset.location.y,
                rotation = offset.location.rotation,
                "alignment offset"
            );
        }
        self.planned[index].alignment = offset;
        Ok(())
    }

    fn place(&mut self, index: usize) -> Result<(), JobError> {
        let (nozzle, job_placement, alignment) = (
            self.planned[index].nozzle,
            self.planned[index].job_placement,
            self.planned[index].alignment,
        );
        let jp = self.placements[job_placement].clone();
        let nozzle_id = self.machine.nozzle_id(nozzle);

        let job = self.job.as_ref().ok_or(JobError::NoJob)?;
        let board = &job.boards[jp.board];
        let placement = &board.placements[jp.placement];
        let part = job.resolve_part(board, placement)?;
        if placement.check_fiducials {
            self.board_locations[jp.board] = self.machine.vision.locate_board(board)?;
        }

        let mut location = board_placement_location(
            self.board_locations[jp.board],
            board.side,
            board.width,
            placement.location,
        );
        if let Some(offset) = alignment {
            location = offset.correct(location);
        }
        location.z += part.height;

        self.telemetry
            .status(format!("Placing {} at {jp} with {nozzle_id}.", part.id));
        self.machine
            .move_to_location_at_safe_z(&nozzle_id, location, self.config.move_speed)?;
        self.machine.head.nozzles[nozzle].place()?;

        self.placements[job_placement].status = PlacementStatus::Complete;
        if let Some(job) = self.job.as_mut() {
            job.boards[jp.board].set_placed(&jp.placement_id, true);
        }
        self.machine.motion.move_to_safe_z(self.config.safe_z_speed)?;
        info!(placement = %jp, nozzle = %nozzle_id, "placed");
        self.telemetry.emit(JobEvent::PlacementComplete {
            board: jp.board_name,
            placement: jp.placement_id,
            nozzle: nozzle_id,
        });
        Ok(())
    }

    /// Drop the first placement of the batch.
    fn do_skip(&mut self) -> Result<(), JobError> {
        if self.planned.is_empty() {
            return Ok(());
        }
        let planned = self.planned.remove(0);
        let placement = &mut self.placements[planned.job_placement];
        placement.status = PlacementStatus::Skipped;
        warn!(%placement, "placement skipped");
        self.telemetry.emit(JobEvent::PlacementSkipped {
            board: placement.board_name.clone(),
            placement: placement.placement_id.clone(),
        });
        self.machine.discard(planned.nozzle, self.config.move_speed)
    }

    /// Every step runs even when an earlier one fails, so the machine is
    /// always homed. The first failure is returned.
    fn do_cleanup(&mut self) -> Result<(), JobError> {
        self.status("Cleaning up.");
        self.planned.clear();
        let mut first_error = None;
        keep_first(&mut first_error, "discard", self.machine.discard_all(self.config.move_speed));
        keep_first(
            &mut first_error,
            "safe z",
            self.machine.motion.move_to_safe_z(self.config.safe_z_speed),
        );
        keep_first(&mut first_error, "home", self.machine.motion.home());

        if self.config.park_when_complete
            && first_error.is_none()
            && self.outcome == Some(JobOutcome::Completed)
            && !self.machine.head.nozzles.is_empty()
        {
            let nozzle_id = self.machine.nozzle_id(0);
            let park = self.machine.head.park_location;
            let parked = self
                .machine
                .move_to_location_at_safe_z(&nozzle_id, park, self.config.move_speed);
            keep_first(&mut first_error, "park", parked);
        }

        let placed = self
            .placements
            .iter()
            .filter(|p| p.status == PlacementStatus::Complete)
            .count();
        let seconds = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
        let cph = if seconds > 0.0 {
            placed as f64 / (seconds / 3600.0)
        } else {
            0.0
        };
        info!(placed, seconds, cph, "cleanup complete");
        self.status(format!(
            "Job finished. {placed} parts in {seconds:.2}s, {cph:.0} CPH."
        ));
        first_error.map_or(Ok(()), Err)
    }

    /// Close the run: build its report and unload the job.
    fn do_reset(&mut self) -> Result<(), JobError> {
        let outcome = self.outcome.take().unwrap_or(JobOutcome::Aborted);
        let job = self.job.take();
        let name = job.as_ref().map(|j| j.name.as_str()).unwrap_or_default();
        let report = JobReport::new(
            name,
            outcome.clone(),
            std::mem::take(&mut self.visited),
            &self.placements,
            self.started_at,
        );

        // A trip is consumed by the abort it caused.
        self.machine.interlock().clear();
        self.telemetry.emit(JobEvent::Finished(outcome));
        self.last_report = Some(report);
        self.last_job = job;
        self.placements.clear();
        self.planned.clear();
        self.board_locations.clear();
        Ok(())
    }
}

fn keep_first(first: &mut Option<JobError>, step: &str, result: Result<(), JobError>) {
    if let Err(e) = result {
        warn!(step, error = %e, "cleanup step failed");
        first.get_or_insert(e);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::error::ErrorKind;
    use crate::machine::NozzleTip;
    use crate::machine::sim::{FeederSpec, MachineSpec, NozzleSpec, SimCall, SimLog};
    use crate::model::{BoardLocation, Placement, Side};
    use crate::processor::telemetry::RecordingTelemetry;

    struct Rig {
        processor: JobProcessor,
        log: SimLog,
        telemetry: Arc<RecordingTelemetry>,
    }

    fn feeder(id: &str, part: &str) -> FeederSpec {
        FeederSpec {
            id: id.into(),
            part: part.into(),
            location: Location::new(100.0, 0.0, -1.0, 0.0),
            enabled: true,
            retry_count: None,
            part_count: None,
            fail_feeds: 0,
        }
    }

    fn nozzle(id: &str, tip: &str) -> NozzleSpec {
        NozzleSpec {
            id: id.into(),
            nozzle_tip: Some(tip.into()),
            ..Default::default()
        }
    }

    fn spec(nozzles: &[&str]) -> MachineSpec {
        MachineSpec {
            nozzles: nozzles
                .iter()
                .zip(["NT1", "NT3"])
                .map(|(id, tip)| nozzle(id, tip))
                .collect(),
            nozzle_tips: vec![
                NozzleTip {
                    id: "NT1".into(),
                    packages: vec!["R0402".into()],
                },
                NozzleTip {
                    id: "NT2".into(),
                    packages: vec!["SOIC8".into()],
                },
                NozzleTip {
                    id: "NT3".into(),
                    packages: vec!["R0402".into()],
                },
            ],
            feeders: vec![
                feeder("F1", "R1k"),
                feeder("F2", "R10k"),
                feeder("F3", "LM358"),
            ],
            discard_location: Location::new(-10.0, -10.0, 0.0, 0.0),
            park_location: Location::new(0.0, 300.0, 0.0, 0.0),
            ..Default::default()
        }
    }

    fn part(id: &str, package: &str, height: f64) -> Part {
        Part {
            id: id.into(),
            package: package.into(),
            height,
        }
    }

    fn placement(id: &str, part: &str) -> Placement {
        Placement {
            id: id.into(),
            part: Some(part.into()),
            location: Location::new(10.0, 10.0, 0.0, 0.0),
            side: Side::Top,
            kind: PlacementKind::Place,
            enabled: true,
            error_handling: ErrorHandling::Alert,
            check_fiducials: false,
        }
    }

    fn job(placements: Vec<Placement>) -> Job {
        Job {
            name: "test".into(),
            parts: vec![
                part("R1k", "R0402", 0.35),
                part("R10k", "R0402", 0.35),
                part("LM358", "SOIC8", 1.75),
                part("C100n", "C0603", 0.5),
            ],
            boards: vec![BoardLocation {
                board: "B1".into(),
                location: Location::new(50.0, 50.0, 0.0, 0.0),
                side: Side::Top,
                width: 40.0,
                enabled: true,
                check_fiducials: false,
                placements,
                placed: BTreeSet::new(),
            }],
        }
    }

    fn rig(spec: MachineSpec, config: ProcessorConfig) -> Rig {
        let (machine, log) = spec.build(config.feed_retry_count).unwrap();
        let telemetry = RecordingTelemetry::new();
        let processor = JobProcessor::new(machine, config, telemetry.clone());
        Rig {
            processor,
            log,
            telemetry,
        }
    }

    fn run(processor: &mut JobProcessor) -> Result<(), JobError> {
        for _ in 0..1000 {
            if !processor.next()? {
                return Ok(());
            }
        }
        panic!("job did not finish");
    }

    fn advance_to(processor: &mut JobProcessor, state: State) {
        while processor.state() != state {
            assert!(processor.next().unwrap(), "job ended before reaching {state}");
        }
    }

    fn placed_parts(log: &SimLog) -> Vec<String> {
        log.calls()
            .into_iter()
            .filter_map(|c| match c {
                SimCall::Place { part, .. } => Some(part),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_job_goes_straight_to_complete() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![])).unwrap();
        run(&mut rig.processor).unwrap();

        let expected = vec![
            State::Ready,
            State::PreFlight,
            State::FiducialCheck,
            State::Plan,
            State::Complete,
            State::Cleanup,
            State::Stopped,
            State::Uninitialized,
        ];
        assert_eq!(rig.telemetry.states(), expected);
        assert_eq!(rig.processor.state(), State::Uninitialized);

        let report = rig.processor.last_report().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.state_transitions, expected);
        assert_eq!(report.placed, 0);
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::Feed { .. })), 0);
        assert_eq!(rig.log.calls().last(), Some(&SimCall::Home));
    }

    #[test]
    fn one_nozzle_runs_one_cycle_per_placement() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor
            .initialize(job(vec![placement("R1", "R1k"), placement("R2", "R10k")]))
            .unwrap();
        run(&mut rig.processor).unwrap();

        let cycle = [
            State::Plan,
            State::ChangeNozzleTip,
            State::Feed,
            State::Pick,
            State::Align,
            State::Place,
        ];
        let mut expected = vec![State::Ready, State::PreFlight, State::FiducialCheck];
        expected.extend(cycle);
        expected.extend(cycle);
        expected.extend([
            State::Plan,
            State::Complete,
            State::Cleanup,
            State::Stopped,
            State::Uninitialized,
        ]);
        assert_eq!(rig.telemetry.states(), expected);
        assert_eq!(placed_parts(&rig.log), vec!["R1k", "R10k"]);
        // The loaded tip already fits both parts.
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::LoadTip { .. })), 0);

        let report = rig.processor.last_report().unwrap();
        assert_eq!(report.placed, 2);
        assert_eq!(report.outcome, JobOutcome::Completed);

        let board = &rig.processor.last_job().unwrap().boards[0];
        assert!(board.is_placed("R1"));
        assert!(board.is_placed("R2"));
    }

    #[test]
    fn placement_location_applies_board_fiducials_and_alignment() {
        let mut machine = spec(&["N1"]);
        machine.vision.board_offset = Location::new(1.0, 2.0, 0.0, 0.0);
        machine.vision.alignment_offset = Location::new(0.5, -0.25, 0.0, 0.0);
        let mut rig = rig(machine, ProcessorConfig::default());

        let mut job = job(vec![placement("R1", "R1k")]);
        job.boards[0].check_fiducials = true;
        rig.processor.initialize(job).unwrap();
        run(&mut rig.processor).unwrap();

        assert_eq!(rig.log.count(|c| matches!(c, SimCall::LocateBoard { .. })), 1);
        let calls = rig.log.calls();
        let place = calls
            .iter()
            .position(|c| matches!(c, SimCall::Place { .. }))
            .unwrap();
        assert_eq!(
            calls[place - 1],
            SimCall::MoveTo {
                nozzle: "N1".into(),
                location: Location::new(60.5, 62.25, 0.35, 0.0),
            }
        );
    }

    #[test]
    fn shorter_parts_are_placed_first_across_nozzles() {
        let mut rig = rig(spec(&["N1", "N2"]), ProcessorConfig::default());
        rig.processor
            .initialize(job(vec![
                placement("U1", "LM358"),
                placement("R1", "R1k"),
                placement("R2", "R10k"),
            ]))
            .unwrap();
        run(&mut rig.processor).unwrap();

        assert_eq!(placed_parts(&rig.log), vec!["R1k", "R10k", "LM358"]);
        assert!(rig.log.calls().contains(&SimCall::UnloadTip { nozzle: "N1".into() }));
        assert!(rig.log.calls().contains(&SimCall::LoadTip {
            nozzle: "N1".into(),
            tip: "NT2".into(),
        }));
    }

    #[test]
    fn cleanup_still_homes_after_a_motion_fault() {
        let mut machine = spec(&["N1"]);
        machine.motion.fail_after_moves = Some(3);
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();

        let err = run(&mut rig.processor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Motion);
        assert_eq!(rig.processor.state(), State::Uninitialized);
        assert!(rig.telemetry.states().ends_with(&[
            State::Aborted,
            State::Cleanup,
            State::Stopped,
            State::Uninitialized
        ]));
        assert_eq!(rig.log.count(|c| *c == SimCall::Home), 1);
        assert_eq!(rig.log.calls().last(), Some(&SimCall::Home));
        assert!(matches!(
            rig.processor.last_report().unwrap().outcome,
            JobOutcome::Failed {
                kind: ErrorKind::Motion,
                ..
            }
        ));
    }

    #[test]
    fn nozzles_never_share_a_tip() {
        let mut machine = spec(&["N1", "N2"]);
        machine.nozzle_tips.retain(|t| t.id != "NT3");
        machine.nozzles[1].nozzle_tip = Some("NT2".into());
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor
            .initialize(job(vec![placement("R1", "R1k"), placement("R2", "R10k")]))
            .unwrap();

        advance_to(&mut rig.processor, State::Feed);
        let tips = |p: &JobProcessor| -> Vec<Option<String>> {
            p.machine()
                .head
                .nozzles
                .iter()
                .map(|n| n.nozzle_tip().map(|t| t.id.clone()))
                .collect()
        };
        assert_eq!(tips(&rig.processor), vec![Some("NT1".into()), Some("NT2".into())]);
        // R2 waits for N1 to come free.
        assert_eq!(rig.processor.planned().len(), 1);
        assert_eq!(rig.processor.planned()[0].nozzle, 0);

        run(&mut rig.processor).unwrap();
        assert_eq!(placed_parts(&rig.log), vec!["R1k", "R10k"]);
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::LoadTip { .. })), 0);
        assert_eq!(rig.processor.last_report().unwrap().placed, 2);
    }

    #[test]
    fn idle_nozzle_hands_over_its_tip() {
        let mut machine = spec(&["N1", "N2"]);
        machine.nozzle_tips.retain(|t| t.id != "NT3");
        machine.nozzles[0].nozzle_tip = Some("NT2".into());
        machine.nozzles[1].nozzle_tip = Some("NT1".into());
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        run(&mut rig.processor).unwrap();

        let calls = rig.log.calls();
        let unload = calls
            .iter()
            .position(|c| *c == SimCall::UnloadTip { nozzle: "N2".into() })
            .unwrap();
        let load = calls
            .iter()
            .position(|c| {
                *c == SimCall::LoadTip {
                    nozzle: "N1".into(),
                    tip: "NT1".into(),
                }
            })
            .unwrap();
        assert!(unload < load);

        let nozzles = &rig.processor.machine().head.nozzles;
        assert_eq!(nozzles[0].nozzle_tip().map(|t| t.id.as_str()), Some("NT1"));
        assert!(nozzles[1].nozzle_tip().is_none());
        assert_eq!(placed_parts(&rig.log), vec!["R1k"]);
    }

    #[test]
    fn head_retracts_after_pick_and_place() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        run(&mut rig.processor).unwrap();

        let calls = rig.log.calls();
        let pick = calls
            .iter()
            .position(|c| matches!(c, SimCall::Pick { .. }))
            .unwrap();
        let place = calls
            .iter()
            .position(|c| matches!(c, SimCall::Place { .. }))
            .unwrap();
        assert_eq!(calls[pick + 1], SimCall::SafeZ);
        assert_eq!(calls[place + 1], SimCall::SafeZ);
    }

    #[test]
    fn bottom_side_placements_mirror_across_the_board() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        let mut bottom = placement("R1", "R1k");
        bottom.side = Side::Bottom;
        let mut job = job(vec![bottom]);
        job.boards[0].side = Side::Bottom;
        rig.processor.initialize(job).unwrap();
        run(&mut rig.processor).unwrap();

        let calls = rig.log.calls();
        let place = calls
            .iter()
            .position(|c| matches!(c, SimCall::Place { .. }))
            .unwrap();
        // 40 mm board at (50, 50): x = 50 + (40 - 10).
        assert_eq!(
            calls[place - 1],
            SimCall::MoveTo {
                nozzle: "N1".into(),
                location: Location::new(80.0, 60.0, 0.35, 0.0),
            }
        );
    }

    #[test]
    fn initialize_is_rejected_while_a_job_is_loaded() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        rig.processor.next().unwrap();

        let mut other = job(vec![]);
        other.name = "other".into();
        match rig.processor.initialize(other) {
            Err(JobError::InvalidTransition { state, message }) => {
                assert_eq!(state, State::PreFlight);
                assert_eq!(message, Message::Initialize);
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
        assert_eq!(rig.processor.state(), State::PreFlight);
        assert_eq!(rig.processor.job().unwrap().name, "test");

        // The original job still runs to completion.
        run(&mut rig.processor).unwrap();
        assert_eq!(rig.processor.last_report().unwrap().placed, 1);
    }

    #[test]
    fn rejected_messages_leave_the_job_alone() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        assert!(matches!(
            rig.processor.next(),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(matches!(
            rig.processor.abort(),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(!rig.processor.can_skip());

        rig.processor.initialize(job(vec![])).unwrap();
        assert_eq!(rig.processor.state(), State::Ready);
        assert!(matches!(
            rig.processor.skip(),
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(rig.processor.state(), State::Ready);
        assert!(rig.processor.is_running());
    }

    #[test]
    fn abort_during_pick_runs_cleanup() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        advance_to(&mut rig.processor, State::Pick);
        rig.log.clear();

        rig.processor.abort().unwrap();

        let states = rig.telemetry.states();
        let pick = states.iter().rposition(|s| *s == State::Pick).unwrap();
        assert_eq!(
            states[pick + 1..],
            [State::Aborted, State::Cleanup, State::Stopped, State::Uninitialized]
        );
        let calls = rig.log.calls();
        assert!(calls.contains(&SimCall::SafeZ));
        assert_eq!(calls.last(), Some(&SimCall::Home));
        assert_eq!(rig.processor.last_report().unwrap().outcome, JobOutcome::Aborted);
        assert!(!rig.processor.last_job().unwrap().boards[0].is_placed("R1"));
    }

    #[test]
    fn abort_after_completion_just_finishes() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![])).unwrap();
        advance_to(&mut rig.processor, State::Cleanup);

        rig.processor.abort().unwrap();
        assert_eq!(rig.processor.state(), State::Uninitialized);
        assert_eq!(rig.processor.last_report().unwrap().outcome, JobOutcome::Completed);
    }

    #[test]
    fn feeder_out_of_retries_fails_the_job_after_cleanup() {
        let mut machine = spec(&["N1"]);
        machine.feeders[0].fail_feeds = 100;
        machine.feeders[0].retry_count = Some(4);
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();

        let err = run(&mut rig.processor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Feeder);
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::Feed { .. })), 5);
        assert_eq!(rig.log.calls().last(), Some(&SimCall::Home));
        assert_eq!(rig.processor.state(), State::Uninitialized);
        assert!(!rig.processor.machine().feeders[0].is_enabled());

        let report = rig.processor.last_report().unwrap();
        assert!(matches!(
            report.outcome,
            JobOutcome::Failed {
                kind: ErrorKind::Feeder,
                ..
            }
        ));
        assert!(rig.telemetry.events().iter().any(|e| matches!(
            e,
            JobEvent::Error {
                kind: ErrorKind::Feeder,
                ..
            }
        )));
    }

    #[test]
    fn failing_feeder_falls_back_to_the_next_one() {
        let mut machine = spec(&["N1"]);
        machine.feeders[0].fail_feeds = 1;
        machine.feeders[0].retry_count = Some(0);
        machine.feeders.push(feeder("F1b", "R1k"));
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        run(&mut rig.processor).unwrap();

        assert_eq!(rig.processor.last_report().unwrap().placed, 1);
        assert!(rig.telemetry.events().contains(&JobEvent::FeederDisabled {
            feeder: "F1".into(),
            reason: "Feeder error: F1 jammed".into(),
        }));
        let feeders: Vec<String> = rig
            .log
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SimCall::Feed { feeder, .. } => Some(feeder),
                _ => None,
            })
            .collect();
        assert_eq!(feeders, vec!["F1", "F1b"]);
    }

    #[test]
    fn pick_retries_within_budget() {
        let mut machine = spec(&["N1"]);
        machine.nozzles[0].fail_picks = 1;
        let config = ProcessorConfig {
            pick_retry_count: 1,
            ..Default::default()
        };
        let mut rig = rig(machine, config);
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        run(&mut rig.processor).unwrap();

        assert_eq!(rig.log.count(|c| matches!(c, SimCall::Pick { .. })), 2);
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::Feed { .. })), 1);
        assert_eq!(rig.processor.last_report().unwrap().placed, 1);
    }

    #[test]
    fn deferred_placement_errors_without_stopping_the_job() {
        let mut machine = spec(&["N1"]);
        machine.nozzles[0].fail_picks = 1;
        let mut rig = rig(machine, ProcessorConfig::default());

        let mut first = placement("R1", "R1k");
        first.error_handling = ErrorHandling::Defer;
        rig.processor
            .initialize(job(vec![first, placement("R2", "R10k")]))
            .unwrap();
        run(&mut rig.processor).unwrap();

        let report = rig.processor.last_report().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.errored, 1);
        assert_eq!(report.placed, 1);
        assert!(rig.telemetry.events().iter().any(|e| matches!(
            e,
            JobEvent::PlacementErrored { placement, kind: ErrorKind::Pick, .. } if placement == "R1"
        )));
    }

    #[test]
    fn alert_placement_fails_the_job() {
        let mut machine = spec(&["N1"]);
        machine.nozzles[0].fail_picks = 1;
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor
            .initialize(job(vec![placement("R1", "R1k"), placement("R2", "R10k")]))
            .unwrap();

        let err = run(&mut rig.processor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pick);
        assert_eq!(rig.processor.last_report().unwrap().placed, 0);
    }

    #[test]
    fn skip_drops_the_current_placement() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor
            .initialize(job(vec![placement("R1", "R1k"), placement("R2", "R10k")]))
            .unwrap();
        advance_to(&mut rig.processor, State::Feed);

        assert!(rig.processor.can_skip());
        assert!(rig.processor.skip().unwrap());
        assert_eq!(rig.processor.state(), State::Feed);
        assert!(rig.processor.planned().is_empty());
        run(&mut rig.processor).unwrap();

        let report = rig.processor.last_report().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.placed, 1);
        assert_eq!(placed_parts(&rig.log), vec!["R10k"]);
        assert!(rig.telemetry.events().contains(&JobEvent::PlacementSkipped {
            board: "B1".into(),
            placement: "R1".into(),
        }));
    }

    #[test]
    fn skipping_fiducials_goes_to_plan() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        let mut job = job(vec![placement("R1", "R1k")]);
        job.boards[0].check_fiducials = true;
        rig.processor.initialize(job).unwrap();
        advance_to(&mut rig.processor, State::FiducialCheck);

        rig.processor.skip().unwrap();
        assert_eq!(rig.processor.state(), State::Plan);
        run(&mut rig.processor).unwrap();
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::LocateBoard { .. })), 0);
    }

    #[test]
    fn interlock_trip_forces_an_abort() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        advance_to(&mut rig.processor, State::Feed);

        rig.processor.interlock().trip("e-stop");
        match rig.processor.next() {
            Err(JobError::Interlock(reason)) => assert_eq!(reason, "e-stop"),
            other => panic!("expected interlock error, got {other:?}"),
        }
        let states = rig.telemetry.states();
        assert_eq!(
            states[states.len() - 4..],
            [State::Aborted, State::Cleanup, State::Stopped, State::Uninitialized]
        );
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::Feed { .. })), 0);
        assert!(!rig.processor.interlock().is_tripped());
    }

    #[test]
    fn touching_the_machine_mid_job_trips_the_interlock() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        advance_to(&mut rig.processor, State::Plan);

        rig.processor.machine_mut().feeders[0].set_enabled(false);
        assert!(matches!(rig.processor.next(), Err(JobError::Interlock(_))));
        assert!(!rig.processor.is_running());

        // Outside a job the machine is free to change.
        rig.processor.machine_mut().feeders[0].set_enabled(true);
        assert!(!rig.processor.interlock().is_tripped());
    }

    #[test]
    fn preflight_failures_happen_before_any_motion() {
        let cases = [
            (placement("C1", "C100n"), ErrorKind::ResourceResolution),
            (placement("X1", "missing"), ErrorKind::PartResolution),
        ];
        for (bad, kind) in cases {
            let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
            rig.processor
                .initialize(job(vec![placement("R1", "R1k"), bad]))
                .unwrap();
            let err = run(&mut rig.processor).unwrap_err();
            assert_eq!(err.kind(), kind);
            assert_eq!(rig.log.calls()[0], SimCall::SafeZ);
            assert_eq!(rig.log.calls().last(), Some(&SimCall::Home));
            assert!(!rig.log.calls().iter().any(|c| matches!(c, SimCall::MoveTo { .. })));
        }
    }

    #[test]
    fn preflight_requires_an_enabled_feeder() {
        let mut machine = spec(&["N1"]);
        machine.feeders[1].enabled = false;
        let mut rig = rig(machine, ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R2", "R10k")])).unwrap();
        assert_eq!(run(&mut rig.processor).unwrap_err().kind(), ErrorKind::Feeder);
    }

    #[test]
    fn preflight_rejects_duplicate_ids() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor
            .initialize(job(vec![placement("R1", "R1k"), placement("R1", "R10k")]))
            .unwrap();
        assert_eq!(run(&mut rig.processor).unwrap_err().kind(), ErrorKind::InvalidJob);
    }

    #[test]
    fn preflight_only_collects_runnable_placements() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        let mut disabled = placement("R3", "R1k");
        disabled.enabled = false;
        let mut fiducial = placement("FID1", "missing");
        fiducial.kind = PlacementKind::Fiducial;
        let mut bottom = placement("R4", "R1k");
        bottom.side = Side::Bottom;
        let mut job = job(vec![
            placement("R1", "R1k"),
            placement("R2", "R10k"),
            disabled,
            fiducial,
            bottom,
        ]);
        job.boards[0].set_placed("R1", true);

        rig.processor.initialize(job).unwrap();
        advance_to(&mut rig.processor, State::FiducialCheck);
        let ids: Vec<&str> = rig
            .processor
            .job_placements()
            .iter()
            .map(|p| p.placement_id.as_str())
            .collect();
        assert_eq!(ids, vec!["R2"]);
    }

    #[test]
    fn parks_after_a_completed_job_when_configured() {
        let config = ProcessorConfig {
            park_when_complete: true,
            ..Default::default()
        };
        let mut rig = rig(spec(&["N1"]), config);
        rig.processor.initialize(job(vec![])).unwrap();
        run(&mut rig.processor).unwrap();

        assert_eq!(
            rig.log.calls().last(),
            Some(&SimCall::MoveTo {
                nozzle: "N1".into(),
                location: Location::new(0.0, 300.0, 0.0, 0.0),
            })
        );
    }

    #[test]
    fn processor_is_reusable_after_a_run() {
        let mut rig = rig(spec(&["N1"]), ProcessorConfig::default());
        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        run(&mut rig.processor).unwrap();
        let first = rig.processor.last_report().unwrap().run_id;

        rig.processor.initialize(job(vec![placement("R1", "R1k")])).unwrap();
        run(&mut rig.processor).unwrap();
        assert_ne!(rig.processor.last_report().unwrap().run_id, first);
        assert_eq!(placed_parts(&rig.log).len(), 2);
    }

    #[test]
    fn bundled_demo_job_runs_on_bundled_machine() {
        let spec = MachineSpec::from_toml_str(include_str!("../../demos/machine.toml")).unwrap();
        let job = Job::from_toml_str(include_str!("../../demos/job.toml")).unwrap();
        let mut rig = rig(spec, ProcessorConfig::default());
        rig.processor.initialize(job).unwrap();
        run(&mut rig.processor).unwrap();

        let report = rig.processor.last_report().unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.placed, 4);
        assert_eq!(
            placed_parts(&rig.log),
            vec!["R0402-1k", "R0402-1k", "C0402-100n", "LM358"]
        );
        // One board check up front, one more before U1.
        assert_eq!(rig.log.count(|c| matches!(c, SimCall::LocateBoard { .. })), 2);
    }

    #[test]
    fn transition_graph_lists_every_edge() {
        let dot = transition_graph();
        assert!(dot.starts_with("digraph JobProcessor {"));
        assert!(dot.contains("\"Uninitialized\" [shape=doublecircle];"));
        assert!(dot.contains(
            "\"Plan\" -> \"Complete\" [label=\"Complete / Next\", style=dashed];"
        ));
        assert!(dot.contains("\"Feed\" -> \"Pick\" [label=\"Next\", style=solid];"));
        assert!(dot.contains("\"Pick\" -> \"Aborted\" [label=\"Abort / Next\", style=dashed];"));
    }
}
