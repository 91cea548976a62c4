//! Job document model: boards, placements, parts and locations.
//!
//! Jobs are read from TOML. The processor treats everything here as static
//! except the per-board `placed` set, which it writes back as placements
//! complete.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// A point in machine space. Lengths are millimetres, rotation is degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    #[serde(default)]
    pub rotation: f64,
}

impl Location {
    pub fn new(x: f64, y: f64, z: f64, rotation: f64) -> Self {
        Self { x, y, z, rotation }
    }

    /// Adds X, Y and Z. Rotation is left unchanged.
    pub fn add(self, other: Location) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z, self.rotation)
    }

    /// Subtracts X, Y and Z. Rotation is left unchanged.
    pub fn subtract(self, other: Location) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z, self.rotation)
    }

    pub fn add_with_rotation(self, other: Location) -> Self {
        Self::new(
            self.x + other.x,
            self.y + other.y,
            self.z + other.z,
            self.rotation + other.rotation,
        )
    }

    pub fn subtract_with_rotation(self, other: Location) -> Self {
        Self::new(
            self.x - other.x,
            self.y - other.y,
            self.z - other.z,
            self.rotation - other.rotation,
        )
    }

    pub fn with_rotation(self, rotation: f64) -> Self {
        Self { rotation, ..self }
    }

    /// Rotate X and Y counter-clockwise about the origin.
    pub fn rotate_xy(self, degrees: f64) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self::new(
            self.x * cos - self.y * sin,
            self.x * sin + self.y * cos,
            self.z,
            self.rotation,
        )
    }

    /// Rotate X and Y counter-clockwise about `center`.
    pub fn rotate_xy_center_point(self, center: Location, degrees: f64) -> Self {
        self.subtract(center).rotate_xy(degrees).add(center)
    }
}

/// Offset of a part on its nozzle, measured by bottom vision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentOffset {
    pub location: Location,
    /// The part was already rotated to the placement angle during alignment.
    #[serde(default)]
    pub pre_rotated: bool,
}

impl AlignmentOffset {
    /// Nozzle location that puts the part, rather than the nozzle, at `placement`.
    pub fn correct(&self, placement: Location) -> Location {
        if self.pre_rotated {
            return placement.subtract_with_rotation(self.location);
        }
        let angle = placement.rotation - self.location.rotation;
        Location::default()
            .rotate_xy_center_point(self.location, angle)
            .with_rotation(angle)
            .add(placement)
            .subtract(self.location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Side {
    #[default]
    Top,
    Bottom,
}

/// Map a board-relative placement location into machine space.
///
/// Bottom-side placements are mirrored across the board's width in X before
/// the board rotation and offset are applied. The placement's own Z is
/// ignored.
pub fn board_placement_location(board: Location, side: Side, width: f64, local: Location) -> Location {
    let mut local = Location { z: 0.0, ..local };
    if side == Side::Bottom {
        local.x = width - local.x;
    }
    local.rotate_xy(board.rotation).add_with_rotation(board)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub package: String,
    /// Height in millimetres. Must be greater than zero to be placed.
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementKind {
    #[default]
    Place,
    Fiducial,
    Ignore,
}

/// What to do with a placement when one of its steps fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorHandling {
    /// Abort the job.
    #[default]
    Alert,
    /// Discard the part, mark the placement errored and carry on.
    Defer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: String,
    /// Id of the part in the job's part list.
    #[serde(default)]
    pub part: Option<String>,
    pub location: Location,
    #[serde(default)]
    pub side: Side,
    #[serde(default)]
    pub kind: PlacementKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Re-check this board's fiducials right before placing.
    #[serde(default)]
    pub check_fiducials: bool,
}

/// One board on the machine bed together with its placements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardLocation {
    pub board: String,
    pub location: Location,
    #[serde(default)]
    pub side: Side,
    /// Board size along X, in millimetres.
    #[serde(default)]
    pub width: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub check_fiducials: bool,
    #[serde(default)]
    pub placements: Vec<Placement>,
    /// Ids of placements already placed.
    #[serde(default)]
    pub placed: BTreeSet<String>,
}

impl BoardLocation {
    pub fn is_placed(&self, placement_id: &str) -> bool {
        self.placed.contains(placement_id)
    }

    pub fn set_placed(&mut self, placement_id: &str, placed: bool) {
        if placed {
            self.placed.insert(placement_id.to_string());
        } else {
            self.placed.remove(placement_id);
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub boards: Vec<BoardLocation>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parts: Vec::new(),
            boards: Vec::new(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, JobError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, JobError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn part(&self, id: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.id == id)
    }

    /// Resolve the part a placement refers to.
    pub fn resolve_part(&self, board: &BoardLocation, placement: &Placement) -> Result<&Part, JobError> {
        placement
            .part
            .as_deref()
            .and_then(|id| self.part(id))
            .ok_or_else(|| {
                JobError::PartResolution(format!(
                    "Part not found for board {}, placement {}.",
                    board.board, placement.id
                ))
            })
    }
}
