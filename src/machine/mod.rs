//! Hardware collaborators consumed by the job processor.
//!
//! The processor only talks to the machine through these traits. Drivers,
//! cameras and feeders live elsewhere; [`sim`] provides an in-memory machine
//! for dry runs and tests.

pub mod sim;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::model::{AlignmentOffset, BoardLocation, Location, Part};

/// Axis motion. Calls block until the move completes or fails.
pub trait Motion: Send {
    /// Move the given nozzle's tool point to `location`.
    fn move_to(&mut self, nozzle: &str, location: Location, speed: f64) -> Result<(), JobError>;

    fn move_to_safe_z(&mut self, speed: f64) -> Result<(), JobError>;

    fn home(&mut self) -> Result<(), JobError>;
}

pub trait Vision: Send {
    /// Measure a board's fiducials and return its corrected location.
    fn locate_board(&mut self, board: &BoardLocation) -> Result<Location, JobError>;

    /// Measure the part held by `nozzle`. `None` when no aligner handles the part.
    fn find_alignment_offset(
        &mut self,
        part: &Part,
        nozzle: &str,
    ) -> Result<Option<AlignmentOffset>, JobError>;
}

pub trait Feeder: Send {
    fn id(&self) -> &str;

    /// Present a part for `nozzle` to pick.
    fn feed(&mut self, nozzle: &str) -> Result<(), JobError>;

    fn pick_location(&self) -> Result<Location, JobError>;

    fn post_pick(&mut self, _nozzle: &str) -> Result<(), JobError> {
        Ok(())
    }

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    fn supplies_part(&self, part: &Part) -> bool;

    /// Re-attempts allowed after a failed feed before the feeder is disabled.
    fn retry_count(&self) -> u32;
}

pub trait Nozzle: Send {
    fn id(&self) -> &str;

    fn pick(&mut self, part: &Part) -> Result<(), JobError>;

    fn place(&mut self) -> Result<(), JobError>;

    /// Release the held part at the current location without placing it.
    fn discard(&mut self) -> Result<(), JobError> {
        self.place()
    }

    fn load_nozzle_tip(&mut self, tip: &NozzleTip) -> Result<(), JobError>;

    fn unload_nozzle_tip(&mut self) -> Result<(), JobError>;

    fn nozzle_tip(&self) -> Option<&NozzleTip>;

    /// Id of the part currently on the nozzle.
    fn holding(&self) -> Option<&str>;

    fn can_handle(&self, part: &Part) -> bool {
        self.nozzle_tip().is_some_and(|tip| tip.can_handle(part))
    }
}

/// An interchangeable tip, compatible with a set of packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NozzleTip {
    pub id: String,
    pub packages: Vec<String>,
}

impl NozzleTip {
    pub fn can_handle(&self, part: &Part) -> bool {
        self.packages.iter().any(|p| *p == part.package)
    }
}

pub struct Head {
    pub nozzles: Vec<Box<dyn Nozzle>>,
    pub nozzle_tips: Vec<NozzleTip>,
    pub discard_location: Location,
    pub park_location: Location,
}

/// Latch that external actors trip when they change the machine behind the
/// processor's back (e-stop, manual jog, feeder edits).
#[derive(Debug, Clone, Default)]
pub struct Interlock {
    reason: Arc<Mutex<Option<String>>>,
}

impl Interlock {
    pub fn trip(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.lock() {
            r.get_or_insert_with(|| reason.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut r) = self.reason.lock() {
            *r = None;
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.reason.lock().map(|r| r.is_some()).unwrap_or(true)
    }

    /// Fails with [`JobError::Interlock`] while tripped.
    pub fn check(&self) -> Result<(), JobError> {
        match self.reason.lock() {
            Ok(r) => match r.as_ref() {
                Some(reason) => Err(JobError::Interlock(reason.clone())),
                None => Ok(()),
            },
            Err(_) => Err(JobError::Interlock("interlock state poisoned".into())),
        }
    }
}

/// Everything the processor drives, owned for the duration of a run.
pub struct Machine {
    pub head: Head,
    pub feeders: Vec<Box<dyn Feeder>>,
    pub motion: Box<dyn Motion>,
    pub vision: Box<dyn Vision>,
    interlock: Interlock,
}

impl Machine {
    pub fn new(
        head: Head,
        feeders: Vec<Box<dyn Feeder>>,
        motion: Box<dyn Motion>,
        vision: Box<dyn Vision>,
    ) -> Self {
        Self {
            head,
            feeders,
            motion,
            vision,
            interlock: Interlock::default(),
        }
    }

    /// Handle for reporting external changes to the machine.
    pub fn interlock(&self) -> Interlock {
        self.interlock.clone()
    }

    /// First nozzle tip on the head that can handle `part`.
    pub fn find_nozzle_tip(&self, part: &Part) -> Result<&NozzleTip, JobError> {
        self.head
            .nozzle_tips
            .iter()
            .find(|tip| tip.can_handle(part))
            .ok_or_else(|| {
                JobError::ResourceResolution(format!(
                    "No compatible nozzle tip found for {} ({}).",
                    part.id, part.package
                ))
            })
    }

    /// A tip for `part` that is not `taken` and not loaded on any nozzle in
    /// `busy`.
    pub fn free_nozzle_tip(&self, part: &Part, busy: &[usize], taken: &[String]) -> Option<&NozzleTip> {
        self.head.nozzle_tips.iter().find(|tip| {
            tip.can_handle(part)
                && !taken.contains(&tip.id)
                && !busy
                    .iter()
                    .any(|&n| self.loaded_tip(n).is_some_and(|t| t.id == tip.id))
        })
    }

    /// Index of the nozzle that has the tip `tip_id` loaded.
    pub fn nozzle_with_tip(&self, tip_id: &str) -> Option<usize> {
        self.head
            .nozzles
            .iter()
            .position(|n| n.nozzle_tip().is_some_and(|t| t.id == tip_id))
    }

    fn loaded_tip(&self, nozzle: usize) -> Option<&NozzleTip> {
        self.head.nozzles.get(nozzle).and_then(|n| n.nozzle_tip())
    }

    /// Index of the first enabled feeder that supplies `part`.
    pub fn find_feeder(&self, part: &Part) -> Result<usize, JobError> {
        self.feeders
            .iter()
            .position(|f| f.is_enabled() && f.supplies_part(part))
            .ok_or_else(|| {
                JobError::Feeder(format!(
                    "No compatible, enabled feeder found for part {}.",
                    part.id
                ))
            })
    }

    pub fn nozzle_id(&self, index: usize) -> String {
        self.head
            .nozzles
            .get(index)
            .map(|n| n.id().to_string())
            .unwrap_or_default()
    }

    /// Retract to safe Z, then move `nozzle` to `location`.
    pub fn move_to_location_at_safe_z(
        &mut self,
        nozzle: &str,
        location: Location,
        speed: f64,
    ) -> Result<(), JobError> {
        self.motion.move_to_safe_z(speed)?;
        self.motion.move_to(nozzle, location, speed)
    }

    /// Drop whatever `nozzle` holds at the discard location.
    pub fn discard(&mut self, nozzle: usize, speed: f64) -> Result<(), JobError> {
        let Some(n) = self.head.nozzles.get(nozzle) else {
            return Err(JobError::ResourceResolution(format!("No nozzle at index {nozzle}.")));
        };
        if n.holding().is_none() {
            return Ok(());
        }
        let id = n.id().to_string();
        let discard_location = self.head.discard_location;
        self.move_to_location_at_safe_z(&id, discard_location, speed)?;
        self.head.nozzles[nozzle].discard()
    }

    /// Discard from every nozzle holding a part.
    pub fn discard_all(&mut self, speed: f64) -> Result<(), JobError> {
        for nozzle in 0..self.head.nozzles.len() {
            self.discard(nozzle, speed)?;
        }
        Ok(())
    }
}
