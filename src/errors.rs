//! Error types, re-exported from `shproc-core`

pub use shproc_core::{ExitFailure, LaunchStage, Result, ShError};
