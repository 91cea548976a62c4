//! Runs a job processor on a dedicated blocking thread.
//!
//! The processor's collaborators block, so the run lives in
//! `spawn_blocking`. Pause, resume and abort travel over a `watch` channel
//! and are honoured only between steps; a step in flight always finishes.

use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::JobError;
use crate::model::Job;
use crate::processor::{JobProcessor, JobReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunControl {
    Running,
    Paused,
    /// Abort at the next step boundary. Final.
    Aborting,
}

/// What a finished worker hands back.
pub struct JobRun {
    pub processor: JobProcessor,
    pub report: Option<JobReport>,
    pub result: Result<(), JobError>,
}

/// Cloneable remote control for a running job.
#[derive(Clone)]
pub struct RunController {
    tx: Arc<watch::Sender<RunControl>>,
}

impl RunController {
    pub fn pause(&self) {
        self.set(RunControl::Paused);
    }

    pub fn resume(&self) {
        self.set(RunControl::Running);
    }

    pub fn abort(&self) {
        self.set(RunControl::Aborting);
    }

    pub fn current(&self) -> RunControl {
        *self.tx.borrow()
    }

    fn set(&self, next: RunControl) {
        self.tx.send_if_modified(|current| {
            if *current == RunControl::Aborting || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

pub struct JobHandle {
    controller: RunController,
    task: JoinHandle<JobRun>,
}

impl JobHandle {
    pub fn controller(&self) -> RunController {
        self.controller.clone()
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn resume(&self) {
        self.controller.resume();
    }

    pub fn abort(&self) {
        self.controller.abort();
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<JobRun, JobError> {
        self.task
            .await
            .map_err(|e| JobError::Worker(format!("job worker stopped abnormally: {e}")))
    }
}

pub struct JobWorker;

impl JobWorker {
    /// Start running `job` on `processor`. Must be called inside a tokio runtime.
    pub fn spawn(processor: JobProcessor, job: Job) -> JobHandle {
        Self::spawn_with(processor, job, RunControl::Running)
    }

    pub fn spawn_with(mut processor: JobProcessor, job: Job, initial: RunControl) -> JobHandle {
        let (tx, rx) = watch::channel(initial);
        let runtime = Handle::current();
        let task = tokio::task::spawn_blocking(move || {
            let result = drive(&mut processor, job, rx, &runtime);
            JobRun {
                report: processor.last_report().cloned(),
                processor,
                result,
            }
        });
        JobHandle {
            controller: RunController { tx: Arc::new(tx) },
            task,
        }
    }
}

fn drive(
    processor: &mut JobProcessor,
    job: Job,
    mut control: watch::Receiver<RunControl>,
    runtime: &Handle,
) -> Result<(), JobError> {
    processor.initialize(job)?;
    loop {
        if wait_while_paused(&mut control, runtime) == RunControl::Aborting {
            info!(state = %processor.state(), "abort requested");
            return processor.abort();
        }
        if !processor.next()? {
            return Ok(());
        }
    }
}

/// Block while paused. Returns the control value that ended the wait.
fn wait_while_paused(control: &mut watch::Receiver<RunControl>, runtime: &Handle) -> RunControl {
    loop {
        let current = *control.borrow_and_update();
        if current != RunControl::Paused {
            return current;
        }
        debug!("job paused");
        // Nobody left to resume us.
        if runtime.block_on(control.changed()).is_err() {
            return RunControl::Aborting;
        }
    }
}
