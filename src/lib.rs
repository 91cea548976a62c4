//! Pick-and-place job execution engine.
//!
//! A generic table-driven state machine ([`fsm`]) drives the job processor
//! ([`processor`]) through pre-flight, fiducial checks and repeated
//! plan/feed/pick/align/place cycles against a machine reached only through
//! the traits in [`machine`].

pub mod cli;
pub mod command;
pub mod config;
pub mod demo;
pub mod error;
pub mod fsm;
pub mod machine;
pub mod model;
pub mod planner;
pub mod processor;
pub mod ui;
pub mod worker;

pub use error::{ErrorKind, JobError};
