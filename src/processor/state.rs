use std::fmt;

use serde::{Deserialize, Serialize};

/// The states of the pick-and-place job state machine.
///
/// A job flows through: READY → PRE_FLIGHT → FIDUCIAL_CHECK → (PLAN →
/// CHANGE_NOZZLE_TIP → FEED → PICK → ALIGN → PLACE)* → COMPLETE → CLEANUP →
/// STOPPED, with ABORTED reachable from every working state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Uninitialized,
    Ready,
    PreFlight,
    FiducialCheck,
    Plan,
    ChangeNozzleTip,
    Feed,
    Pick,
    Align,
    Place,
    Complete,
    Aborted,
    Cleanup,
    Stopped,
}

impl State {
    pub const ALL: [State; 14] = [
        State::Uninitialized,
        State::Ready,
        State::PreFlight,
        State::FiducialCheck,
        State::Plan,
        State::ChangeNozzleTip,
        State::Feed,
        State::Pick,
        State::Align,
        State::Place,
        State::Complete,
        State::Aborted,
        State::Cleanup,
        State::Stopped,
    ];

    /// States from which a job can be aborted.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            State::Ready
                | State::PreFlight
                | State::FiducialCheck
                | State::Plan
                | State::ChangeNozzleTip
                | State::Feed
                | State::Pick
                | State::Align
                | State::Place
        )
    }

    /// States that operate on the planned batch and accept Skip.
    pub fn is_batch_step(self) -> bool {
        matches!(
            self,
            State::ChangeNozzleTip | State::Feed | State::Pick | State::Align | State::Place
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Uninitialized => write!(f, "UNINITIALIZED"),
            State::Ready => write!(f, "READY"),
            State::PreFlight => write!(f, "PRE_FLIGHT"),
            State::FiducialCheck => write!(f, "FIDUCIAL_CHECK"),
            State::Plan => write!(f, "PLAN"),
            State::ChangeNozzleTip => write!(f, "CHANGE_NOZZLE_TIP"),
            State::Feed => write!(f, "FEED"),
            State::Pick => write!(f, "PICK"),
            State::Align => write!(f, "ALIGN"),
            State::Place => write!(f, "PLACE"),
            State::Complete => write!(f, "COMPLETE"),
            State::Aborted => write!(f, "ABORTED"),
            State::Cleanup => write!(f, "CLEANUP"),
            State::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Triggers sent to the job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    Initialize,
    Next,
    Complete,
    Abort,
    Skip,
    Reset,
}

impl Message {
    pub const ALL: [Message; 6] = [
        Message::Initialize,
        Message::Next,
        Message::Complete,
        Message::Abort,
        Message::Skip,
        Message::Reset,
    ];
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Initialize => write!(f, "INITIALIZE"),
            Message::Next => write!(f, "NEXT"),
            Message::Complete => write!(f, "COMPLETE"),
            Message::Abort => write!(f, "ABORT"),
            Message::Skip => write!(f, "SKIP"),
            Message::Reset => write!(f, "RESET"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(State::Uninitialized.to_string(), "UNINITIALIZED");
        assert_eq!(State::ChangeNozzleTip.to_string(), "CHANGE_NOZZLE_TIP");
        assert_eq!(State::Stopped.to_string(), "STOPPED");
        assert_eq!(Message::Abort.to_string(), "ABORT");
    }

    #[test]
    fn working_states_exclude_the_tail() {
        assert!(State::Ready.is_working());
        assert!(State::Pick.is_working());
        for s in [
            State::Uninitialized,
            State::Complete,
            State::Aborted,
            State::Cleanup,
            State::Stopped,
        ] {
            assert!(!s.is_working(), "{s} should not be a working state");
        }
    }
}
