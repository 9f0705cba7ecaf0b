//! shproc: run programs the way a shell would
//!
//! Launches child processes over pipes or pseudo-terminals, pumps their
//! standard streams on background threads, and resolves each process into an
//! exit code or a typed error exactly once.
//!
//! # Modules
//!
//! - **config**: launch specification and per-call options
//! - **execution**: provisioning, launching, the I/O pump, handles, pipelines
//! - **command**: command templates, baking and the command registry
//! - **resolve**: `PATH` lookup
//! - **args**: keyword argument formatting
//! - **dirstack**: process-wide working-directory stack
//!
//! # Example
//!
//! ```ignore
//! use shproc::Sh;
//! use std::time::Duration;
//!
//! let sh = Sh::new();
//! let handle = sh
//!     .command("ls")?
//!     .invoke()
//!     .arg("-1")
//!     .timeout(Duration::from_secs(5))
//!     .run()?;
//! println!("{}", handle.stdout_string()?);
//! ```

// Core modules
pub mod config;
pub mod errors;

// Collaborators
pub mod args;
pub mod dirstack;
pub mod resolve;

// Layered modules
pub mod command;
pub mod execution;

// Public API
pub use command::{Command, Invocation, Sh, run};
pub use config::{
    Bufsize, CallArgs, CallbackAction, Chunk, InputSource, LaunchSpec, OutputCallback,
    OutputSink, PipeMode, ProcessGroupPolicy, StreamRole, TransportKind,
};
pub use errors::{ExitFailure, LaunchStage, Result, ShError};
pub use execution::{
    IterChunk, Pipeline, ProcessHandle, ProcessRef, StdinSender, launch, pipe_into,
};
pub use shproc_core::{parse_signal, signal_name};

#[cfg(test)]
mod tests {
    use crate::{CallArgs, LaunchSpec};

    #[test]
    fn test_module_imports() {
        let spec = LaunchSpec::new("/bin/true");
        assert_eq!(spec.call_args.ok_code, CallArgs::default().ok_code);
    }
}
