//! Pipeline composition
//!
//! Sequential pipelines run each stage to completion and feed its stdout to
//! the next stage as a fixed buffer. Streaming pipelines run every stage at
//! once: the upstream's stdout descriptor becomes the downstream's stdin
//! ([`PipeMode::Direct`]) or the upstream pump relays chunks through its pipe
//! queue ([`PipeMode::Relay`]).
//!
//! Every downstream handle keeps its upstream alive and waits on it after its
//! own result is known. A relayed downstream owns the only receiver of the
//! upstream's pipe queue; once it stops reading, the upstream pump closes its
//! read end and the upstream dies of SIGPIPE like it would in a shell.

use std::sync::Arc;

use log::debug;

use super::handle::{ProcessHandle, launch_linked};
use crate::config::{InputSource, LaunchSpec, PipeMode};
use crate::errors::{Result, ShError};
use crate::resolve::is_executable;

/// Launch `downstream` reading from `upstream`'s stdout
///
/// The hand-off follows how `upstream` was launched: a direct descriptor, a
/// relay from its pipe queue, or (when it was not piped) its complete output.
pub fn pipe_into(mut upstream: ProcessHandle, mut downstream: LaunchSpec) -> Result<ProcessHandle> {
    downstream.stdin = match upstream.piped() {
        Some(PipeMode::Direct) => {
            let fd = upstream.take_direct_stdout().ok_or_else(|| {
                ShError::InvalidConfig("upstream stdout was already handed off".to_string())
            })?;
            InputSource::Fd(fd)
        }
        Some(PipeMode::Relay) => {
            let rx = upstream.take_pipe_receiver().ok_or_else(|| {
                ShError::InvalidConfig("upstream has no pipe queue".to_string())
            })?;
            InputSource::Relay(rx)
        }
        None => InputSource::Bytes(upstream.drain_stdout()),
    };

    debug!(
        "piping {} into {} ({:?})",
        upstream,
        downstream.program.display(),
        upstream.piped()
    );
    launch_linked(downstream, Some(Arc::new(upstream)))
}

/// A chain of processes, each reading the previous one's stdout
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<LaunchSpec>,
    mode: Option<PipeMode>,
}

impl Pipeline {
    pub fn new(first: LaunchSpec) -> Self {
        Self {
            stages: vec![first],
            mode: None,
        }
    }

    /// Append a stage reading this pipeline's output
    pub fn pipe(mut self, next: LaunchSpec) -> Self {
        self.stages.push(next);
        self
    }

    /// Run all stages concurrently
    pub fn streaming(mut self, mode: PipeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Launch every stage and return the last one's handle
    ///
    /// All stages are validated before the first process starts. In streaming
    /// mode a failing launch kills the stages already running.
    pub fn run(self) -> Result<ProcessHandle> {
        for stage in &self.stages {
            stage.validate()?;
            if !is_executable(&stage.program) {
                return Err(ShError::NotFound(stage.program.display().to_string()));
            }
        }

        let last = self.stages.len() - 1;
        let mut upstream: Option<ProcessHandle> = None;

        for (idx, mut stage) in self.stages.into_iter().enumerate() {
            if idx < last {
                stage.call_args.piped = self.mode;
            }
            let wait_after = idx == last && stage.call_args.waits_on_launch();

            let launched = match upstream.take() {
                None => launch_linked(stage, None),
                Some(previous) => {
                    let rollback = previous.process_ref();
                    pipe_into(previous, stage).inspect_err(|_| {
                        if self.mode.is_some() {
                            let _ = rollback.kill();
                        }
                    })
                }
            };
            let handle = launched?;

            if wait_after {
                handle.wait(None)?;
            }
            upstream = Some(handle);
        }

        upstream.ok_or_else(|| ShError::InvalidConfig("empty pipeline".to_string()))
    }
}
