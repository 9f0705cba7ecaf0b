//! shproc-core: shared types and errors for shproc
//!
//! This crate provides the foundational types used by the shproc crates:
//! - Error taxonomy and Result alias
//! - Exit status reconciliation (raw wait status to adjusted exit code)
//! - Signal naming helpers

pub mod error;
pub mod status;

pub use error::{ExitFailure, LaunchStage, Result, ShError};
pub use status::{ExitOutcome, parse_signal, signal_name};
