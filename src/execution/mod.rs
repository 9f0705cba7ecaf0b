//! Execution layer: launching processes and moving their data
//!
//! # Features
//!
//! - **Provisioning**: pipes and pseudo-terminals for each standard stream
//! - **Launching**: fork/exec with an error relay back to the parent
//! - **Pumping**: one input thread and one output thread per process
//! - **Handles**: wait, signal, read output, iterate
//! - **Pipelines**: sequential or streaming composition
//!
//! # Examples
//!
//! ```ignore
//! use shproc::{LaunchSpec, launch};
//!
//! let handle = launch(LaunchSpec::new("/bin/echo").arg("hello"))?;
//! assert_eq!(handle.stdout()?, b"hello\n");
//! ```

pub mod bufferer;
pub mod handle;
pub mod pipeline;
pub mod process;
pub mod stream;
pub mod transport;

pub use bufferer::StreamBufferer;
pub use handle::{IterChunk, NoBlockIter, OutputIter, ProcessHandle, ProcessRef, launch};
pub use pipeline::{Pipeline, pipe_into};
pub use stream::{InputMessage, InternalBuffer, StdinSender};
