mod engine;
mod graph;

pub use engine::{Action, InvalidTransition, StateMachine, Transition};
