//! In-memory machine for dry runs and tests.
//!
//! Every collaborator call is appended to a shared [`SimLog`]. Faults are
//! injected declaratively through [`MachineSpec`], which also loads from
//! `machine.toml`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::{Feeder, Head, Machine, Motion, Nozzle, NozzleTip, Vision};
use crate::error::JobError;
use crate::model::{AlignmentOffset, BoardLocation, Location, Part};

#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    SafeZ,
    MoveTo { nozzle: String, location: Location },
    Home,
    Feed { feeder: String, nozzle: String },
    PostPick { feeder: String },
    Pick { nozzle: String, part: String },
    Place { nozzle: String, part: String },
    Discard { nozzle: String, part: String },
    LoadTip { nozzle: String, tip: String },
    UnloadTip { nozzle: String },
    LocateBoard { board: String },
    Align { nozzle: String, part: String },
}

/// Shared, ordered record of simulated hardware calls.
#[derive(Debug, Clone, Default)]
pub struct SimLog {
    calls: Arc<Mutex<Vec<SimCall>>>,
}

impl SimLog {
    fn push(&self, call: SimCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(default)]
    pub nozzles: Vec<NozzleSpec>,
    #[serde(default)]
    pub nozzle_tips: Vec<NozzleTip>,
    #[serde(default)]
    pub feeders: Vec<FeederSpec>,
    #[serde(default)]
    pub discard_location: Location,
    #[serde(default)]
    pub park_location: Location,
    #[serde(default)]
    pub motion: MotionSpec,
    #[serde(default)]
    pub vision: VisionSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NozzleSpec {
    pub id: String,
    /// Id of the tip loaded at start.
    #[serde(default)]
    pub nozzle_tip: Option<String>,
    /// Number of picks that fail before picks succeed.
    #[serde(default)]
    pub fail_picks: u32,
    #[serde(default)]
    pub fail_places: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederSpec {
    pub id: String,
    /// Id of the part this feeder supplies.
    pub part: String,
    pub location: Location,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the configured feed retry count.
    #[serde(default)]
    pub retry_count: Option<u32>,
    /// Parts left in the feeder. Unlimited when absent.
    #[serde(default)]
    pub part_count: Option<u32>,
    /// Number of feeds that fail before feeds succeed.
    #[serde(default)]
    pub fail_feeds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSpec {
    /// Every move after this many successful moves fails.
    #[serde(default)]
    pub fail_after_moves: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionSpec {
    /// Whether a bottom aligner is fitted.
    #[serde(default = "default_true")]
    pub aligner: bool,
    #[serde(default)]
    pub alignment_offset: Location,
    /// Added to a board's nominal location by the fiducial check.
    #[serde(default)]
    pub board_offset: Location,
    #[serde(default)]
    pub fail_alignments: u32,
    #[serde(default)]
    pub fail_fiducials: bool,
}

impl Default for VisionSpec {
    fn default() -> Self {
        Self {
            aligner: true,
            alignment_offset: Location::default(),
            board_offset: Location::default(),
            fail_alignments: 0,
            fail_fiducials: false,
        }
    }
}

fn default_true() -> bool {
    true
}

impl MachineSpec {
    pub fn from_toml_str(s: &str) -> Result<Self, JobError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, JobError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Build a simulated machine and the log its collaborators write to.
    ///
    /// Feeders without their own `retry_count` get `default_feed_retry`.
    pub fn build(&self, default_feed_retry: u32) -> Result<(Machine, SimLog), JobError> {
        let log = SimLog::default();

        let mut nozzles: Vec<Box<dyn Nozzle>> = Vec::new();
        let mut mounted = HashSet::new();
        for spec in &self.nozzles {
            if let Some(id) = &spec.nozzle_tip
                && !mounted.insert(id.as_str())
            {
                return Err(JobError::Config(format!(
                    "Nozzle tip {id} is loaded on more than one nozzle."
                )));
            }
            let tip = match &spec.nozzle_tip {
                Some(id) => Some(
                    self.nozzle_tips
                        .iter()
                        .find(|t| t.id == *id)
                        .cloned()
                        .ok_or_else(|| {
                            JobError::Config(format!(
                                "Nozzle {} refers to unknown nozzle tip {id}.",
                                spec.id
                            ))
                        })?,
                ),
                None => None,
            };
            nozzles.push(Box::new(SimNozzle {
                id: spec.id.clone(),
                tip,
                holding: None,
                fail_picks: spec.fail_picks,
                fail_places: spec.fail_places,
                log: log.clone(),
            }));
        }

        let feeders: Vec<Box<dyn Feeder>> = self
            .feeders
            .iter()
            .map(|spec| {
                Box::new(SimFeeder {
                    spec: spec.clone(),
                    retry_count: spec.retry_count.unwrap_or(default_feed_retry),
                    log: log.clone(),
                }) as Box<dyn Feeder>
            })
            .collect();

        let head = Head {
            nozzles,
            nozzle_tips: self.nozzle_tips.clone(),
            discard_location: self.discard_location,
            park_location: self.park_location,
        };
        let motion = SimMotion {
            moves: 0,
            fail_after_moves: self.motion.fail_after_moves,
            log: log.clone(),
        };
        let vision = SimVision {
            spec: self.vision.clone(),
            log: log.clone(),
        };

        Ok((
            Machine::new(head, feeders, Box::new(motion), Box::new(vision)),
            log,
        ))
    }
}

struct SimMotion {
    moves: u32,
    fail_after_moves: Option<u32>,
    log: SimLog,
}

impl SimMotion {
    fn check(&mut self) -> Result<(), JobError> {
        if let Some(limit) = self.fail_after_moves {
            if self.moves >= limit {
                return Err(JobError::Motion(format!("axis fault after {limit} moves")));
            }
        }
        self.moves += 1;
        Ok(())
    }
}

impl Motion for SimMotion {
    fn move_to(&mut self, nozzle: &str, location: Location, _speed: f64) -> Result<(), JobError> {
        self.check()?;
        self.log.push(SimCall::MoveTo {
            nozzle: nozzle.to_string(),
            location,
        });
        Ok(())
    }

    fn move_to_safe_z(&mut self, _speed: f64) -> Result<(), JobError> {
        self.check()?;
        self.log.push(SimCall::SafeZ);
        Ok(())
    }

    fn home(&mut self) -> Result<(), JobError> {
        self.log.push(SimCall::Home);
        Ok(())
    }
}

struct SimVision {
    spec: VisionSpec,
    log: SimLog,
}

impl Vision for SimVision {
    fn locate_board(&mut self, board: &BoardLocation) -> Result<Location, JobError> {
        self.log.push(SimCall::LocateBoard {
            board: board.board.clone(),
        });
        if self.spec.fail_fiducials {
            return Err(JobError::Fiducial(format!(
                "Unable to locate fiducials on {}.",
                board.board
            )));
        }
        Ok(board.location.add_with_rotation(self.spec.board_offset))
    }

    fn find_alignment_offset(
        &mut self,
        part: &Part,
        nozzle: &str,
    ) -> Result<Option<AlignmentOffset>, JobError> {
        if !self.spec.aligner {
            return Ok(None);
        }
        self.log.push(SimCall::Align {
            nozzle: nozzle.to_string(),
            part: part.id.clone(),
        });
        if self.spec.fail_alignments > 0 {
            self.spec.fail_alignments -= 1;
            return Err(JobError::Alignment(format!("{} not found on {nozzle}", part.id)));
        }
        Ok(Some(AlignmentOffset {
            location: self.spec.alignment_offset,
            pre_rotated: false,
        }))
    }
}

struct SimFeeder {
    spec: FeederSpec,
    retry_count: u32,
    log: SimLog,
}

impl Feeder for SimFeeder {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn feed(&mut self, nozzle: &str) -> Result<(), JobError> {
        self.log.push(SimCall::Feed {
            feeder: self.spec.id.clone(),
            nozzle: nozzle.to_string(),
        });
        if self.spec.fail_feeds > 0 {
            self.spec.fail_feeds -= 1;
            return Err(JobError::Feeder(format!("{} jammed", self.spec.id)));
        }
        match self.spec.part_count.as_mut() {
            Some(0) => Err(JobError::Feeder(format!("{} is empty", self.spec.id))),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn pick_location(&self) -> Result<Location, JobError> {
        Ok(self.spec.location)
    }

    fn post_pick(&mut self, _nozzle: &str) -> Result<(), JobError> {
        self.log.push(SimCall::PostPick {
            feeder: self.spec.id.clone(),
        });
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.spec.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.spec.enabled = enabled;
    }

    fn supplies_part(&self, part: &Part) -> bool {
        self.spec.part == part.id
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

struct SimNozzle {
    id: String,
    tip: Option<NozzleTip>,
    holding: Option<String>,
    fail_picks: u32,
    fail_places: u32,
    log: SimLog,
}

impl Nozzle for SimNozzle {
    fn id(&self) -> &str {
        &self.id
    }

    fn pick(&mut self, part: &Part) -> Result<(), JobError> {
        self.log.push(SimCall::Pick {
            nozzle: self.id.clone(),
            part: part.id.clone(),
        });
        if self.fail_picks > 0 {
            self.fail_picks -= 1;
            return Err(JobError::Pick(format!(
                "Vacuum check failed on {} picking {}.",
                self.id, part.id
            )));
        }
        self.holding = Some(part.id.clone());
        Ok(())
    }

    fn place(&mut self) -> Result<(), JobError> {
        let Some(part) = self.holding.clone() else {
            return Err(JobError::Place(format!("Nothing on nozzle {}.", self.id)));
        };
        self.log.push(SimCall::Place {
            nozzle: self.id.clone(),
            part,
        });
        if self.fail_places > 0 {
            self.fail_places -= 1;
            return Err(JobError::Place(format!("Part still on nozzle {} after place.", self.id)));
        }
        self.holding = None;
        Ok(())
    }

    fn discard(&mut self) -> Result<(), JobError> {
        if let Some(part) = self.holding.take() {
            self.log.push(SimCall::Discard {
                nozzle: self.id.clone(),
                part,
            });
        }
        Ok(())
    }

    fn load_nozzle_tip(&mut self, tip: &NozzleTip) -> Result<(), JobError> {
        if self.tip.is_some() {
            return Err(JobError::NozzleTipChange(format!(
                "Nozzle {} already has a tip loaded.",
                self.id
            )));
        }
        self.log.push(SimCall::LoadTip {
            nozzle: self.id.clone(),
            tip: tip.id.clone(),
        });
        self.tip = Some(tip.clone());
        Ok(())
    }

    fn unload_nozzle_tip(&mut self) -> Result<(), JobError> {
        if self.tip.take().is_some() {
            self.log.push(SimCall::UnloadTip {
                nozzle: self.id.clone(),
            });
        }
        Ok(())
    }

    fn nozzle_tip(&self) -> Option<&NozzleTip> {
        self.tip.as_ref()
    }

    fn holding(&self) -> Option<&str> {
        self.holding.as_deref()
    }
}
