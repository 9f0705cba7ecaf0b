//! Process handle
//!
//! [`ProcessHandle`] is what callers hold after a launch. It resolves the
//! process's result exactly once: the first `wait()` returns the exit code or
//! the error, later calls return the exit code quietly. Output accessors wait
//! implicitly.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};

use super::bufferer::StreamBufferer;
use super::process::{Launched, spawn_child};
use super::stream::{
    DispatchContext, InputWriter, InternalBuffer, PumpedInput, SinkTarget, StdinSender,
    StreamReader, start_pump,
};
use super::transport::Transports;
use crate::config::{
    Bufsize, CallArgs, Chunk, InputSource, LaunchSpec, OutputSink, PipeMode, StreamRole,
};
use crate::dirstack;
use crate::errors::{ExitFailure, Result, ShError};
use crate::resolve::is_executable;
use shproc_core::ExitOutcome;

/// Longest command shown in a log context before it is cut
const LOG_CMD_LEN: usize = 20;

#[derive(Debug, Default)]
struct RunState {
    exit: Option<ExitOutcome>,
    timed_out: bool,
    pump_error: Option<ShError>,
    finished: bool,
}

/// State shared between a handle and its pump threads
#[derive(Debug)]
pub(crate) struct ProcessShared {
    pub(crate) pid: Pid,
    sid: Option<Pid>,
    pgid: Option<Pid>,
    ctty: Option<PathBuf>,
    command_line: String,
    pub(crate) log_ctx: String,
    ok_code: Vec<i32>,
    pub(crate) timeout: Option<Duration>,
    timeout_signal: i32,
    stdout: Mutex<InternalBuffer>,
    stderr: Mutex<InternalBuffer>,
    save_stdout: bool,
    save_stderr: bool,
    state: Mutex<RunState>,
    finished: Condvar,
}

impl ProcessShared {
    pub(crate) fn buffer(&self, role: StreamRole) -> &Mutex<InternalBuffer> {
        match role {
            StreamRole::Stderr => &self.stderr,
            _ => &self.stdout,
        }
    }

    fn output(&self, role: StreamRole) -> Vec<u8> {
        self.buffer(role).lock().contents()
    }

    /// Non-blocking; never reaps
    pub(crate) fn is_alive(&self) -> bool {
        if self.state.lock().exit.is_some() {
            return false;
        }
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        matches!(waitid(Id::Pid(self.pid), flags), Ok(WaitStatus::StillAlive))
    }

    /// Block until the child is reapable, without reaping it
    pub(crate) fn wait_for_exit_event(&self) {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
        while let Err(Errno::EINTR) = waitid(Id::Pid(self.pid), flags) {}
    }

    /// Reap if the child has exited; `true` once the exit is recorded
    ///
    /// Holds the state lock so no signal can reach a recycled pid.
    pub(crate) fn try_reap(&self) -> nix::Result<bool> {
        let mut state = self.state.lock();
        if state.exit.is_some() {
            return Ok(true);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(false),
            Ok(status) => match ExitOutcome::from_wait_status(status) {
                Some(outcome) => {
                    info!(
                        "{}: process completed with exit code {}",
                        self.log_ctx,
                        outcome.exit_code()
                    );
                    state.exit = Some(outcome);
                    Ok(true)
                }
                None => Ok(false),
            },
            Err(e) => Err(e),
        }
    }

    /// Keeps the first error; later ones are only logged
    pub(crate) fn record_pump_error(&self, role: StreamRole, source: io::Error) {
        let mut state = self.state.lock();
        if state.pump_error.is_some() {
            debug!("{}: further {} error: {}", self.log_ctx, role, source);
            return;
        }
        debug!("{}: {} pump error: {}", self.log_ctx, role, source);
        state.pump_error = Some(ShError::Pump {
            stream: role.as_str(),
            source,
        });
    }

    pub(crate) fn time_left(&self, started: Instant) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(started.elapsed()))
    }

    /// Send the timeout signal once the configured timeout has elapsed
    pub(crate) fn check_timeout(&self, started: Instant) {
        if self.time_left(started) != Some(Duration::ZERO) {
            return;
        }
        let mut state = self.state.lock();
        if state.timed_out || state.exit.is_some() {
            return;
        }
        state.timed_out = true;
        debug!(
            "{}: running longer than {:?}, sending signal {}",
            self.log_ctx,
            self.timeout.unwrap_or_default(),
            self.timeout_signal
        );
        if let Err(e) = deliver(self.pid, self.timeout_signal, false) {
            debug!("{}: timeout signal not delivered: {}", self.log_ctx, e);
        }
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit.map(|outcome| outcome.exit_code())
    }

    /// Exited with an accepted code, in time, with no pump error
    pub(crate) fn succeeded(&self) -> bool {
        let state = self.state.lock();
        !state.timed_out
            && state.pump_error.is_none()
            && state
                .exit
                .is_some_and(|outcome| outcome.is_accepted(&self.ok_code))
    }

    /// Short description of why the process failed, if it did
    pub(crate) fn failure_summary(&self) -> Option<String> {
        let state = self.state.lock();
        if let Some(err) = &state.pump_error {
            return Some(err.to_string());
        }
        if state.timed_out {
            return Some(format!("timed out after {:?}", self.timeout.unwrap_or_default()));
        }
        let outcome = state.exit?;
        if outcome.is_accepted(&self.ok_code) {
            return None;
        }
        let failure = ExitFailure::new(self.command_line.clone(), None, None, outcome.exit_code());
        Some(failure.name())
    }

    pub(crate) fn mark_finished(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.finished.notify_all();
    }

    /// `false` if `timeout` elapsed first
    fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while !state.finished {
                    self.finished.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.finished {
                    if self.finished.wait_until(&mut state, deadline).timed_out() {
                        return state.finished;
                    }
                }
                true
            }
        }
    }

    /// Turn the recorded outcome into the process's result
    fn resolve(&self) -> Result<i32> {
        let mut state = self.state.lock();
        let code = state.exit.map(|outcome| outcome.exit_code()).unwrap_or(-1);

        if let Some(err) = state.pump_error.take() {
            return Err(err);
        }
        if state.timed_out {
            return Err(ShError::Timeout {
                timeout: self.timeout.unwrap_or_default(),
                signal: self.timeout_signal,
            });
        }
        drop(state);

        if self.ok_code.contains(&code) {
            return Ok(code);
        }

        let failure = ExitFailure::new(
            self.command_line.clone(),
            self.save_stdout.then(|| self.output(StreamRole::Stdout)),
            self.save_stderr.then(|| self.output(StreamRole::Stderr)),
            code,
        );
        if code < 0 {
            Err(ShError::Signal(failure))
        } else {
            Err(ShError::Exit(failure))
        }
    }

    /// No-op once the process is reaped
    fn signal(&self, sig: i32, group: bool) -> Result<()> {
        let state = self.state.lock();
        if state.exit.is_some() {
            return Ok(());
        }
        let target = if group {
            self.pgid.unwrap_or(self.pid)
        } else {
            self.pid
        };
        debug!("{}: sending signal {} to {}", self.log_ctx, sig, target);
        let result = deliver(target, sig, group);
        drop(state);
        result
    }
}

fn deliver(target: Pid, sig: i32, group: bool) -> Result<()> {
    let signal =
        Signal::try_from(sig).map_err(|_| ShError::InvalidConfig(format!("invalid signal {}", sig)))?;
    let result = if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ShError::Syscall(format!("failed to signal {}: {}", target, e))),
    }
}

/// Non-owning reference to a running process
///
/// Given to output callbacks and the done callback, so they can signal the
/// process without keeping it alive.
#[derive(Debug, Clone)]
pub struct ProcessRef {
    shared: Weak<ProcessShared>,
}

impl ProcessRef {
    pub fn pid(&self) -> Option<i32> {
        self.shared.upgrade().map(|s| s.pid.as_raw())
    }

    pub fn is_alive(&self) -> bool {
        self.shared.upgrade().is_some_and(|s| s.is_alive())
    }

    /// Exit code if the process has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.upgrade().and_then(|s| s.exit_code())
    }

    pub fn signal(&self, sig: i32) -> Result<()> {
        match self.shared.upgrade() {
            Some(shared) => shared.signal(sig, false),
            None => Ok(()),
        }
    }

    pub fn signal_group(&self, sig: i32) -> Result<()> {
        match self.shared.upgrade() {
            Some(shared) => shared.signal(sig, true),
            None => Ok(()),
        }
    }

    pub fn terminate(&self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    pub fn kill_group(&self) -> Result<()> {
        self.signal_group(libc::SIGKILL)
    }

    /// Stdout collected so far
    pub fn stdout(&self) -> Vec<u8> {
        self.shared
            .upgrade()
            .map(|s| s.output(StreamRole::Stdout))
            .unwrap_or_default()
    }

    /// Stderr collected so far
    pub fn stderr(&self) -> Vec<u8> {
        self.shared
            .upgrade()
            .map(|s| s.output(StreamRole::Stderr))
            .unwrap_or_default()
    }
}

/// A launched process
pub struct ProcessHandle {
    shared: Arc<ProcessShared>,
    resolved: Mutex<Option<i32>>,
    upstream: Option<Arc<ProcessHandle>>,
    stdin: Option<StdinSender>,
    pipe: Option<Receiver<Chunk>>,
    direct_stdout: Mutex<Option<OwnedFd>>,
    stdin_bufferer: Option<Arc<StreamBufferer>>,
    stdout_bufferer: Option<Arc<StreamBufferer>>,
    stderr_bufferer: Option<Arc<StreamBufferer>>,
    background: bool,
    piped: Option<PipeMode>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessHandle {
    /// Wait for the process and resolve its result
    ///
    /// The first call returns the exit code or the error; later calls return
    /// the exit code. A `WaitTimeout` leaves the process running and the
    /// result unresolved. Upstream processes are waited on afterwards and
    /// their errors surface only when this process succeeded.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<i32> {
        if !self.shared.wait_finished(timeout) {
            return Err(ShError::WaitTimeout(timeout.unwrap_or_default()));
        }
        if let Some(pump) = self.pump.lock().take() {
            let _ = pump.join();
        }

        let mut resolved = self.resolved.lock();
        if let Some(code) = *resolved {
            return Ok(code);
        }
        let own = self.shared.resolve();
        *resolved = Some(self.shared.exit_code().unwrap_or(-1));
        drop(resolved);

        let upstream = match &self.upstream {
            Some(upstream) => upstream.wait(None).map(|_| ()),
            None => Ok(()),
        };
        let code = own?;
        upstream?;
        Ok(code)
    }

    /// Aggregated stdout; waits first
    pub fn stdout(&self) -> Result<Vec<u8>> {
        self.wait(None)?;
        Ok(self.shared.output(StreamRole::Stdout))
    }

    /// Aggregated stderr; waits first
    pub fn stderr(&self) -> Result<Vec<u8>> {
        self.wait(None)?;
        Ok(self.shared.output(StreamRole::Stderr))
    }

    /// Stdout decoded lossily as UTF-8
    pub fn stdout_string(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.stdout()?).into_owned())
    }

    pub fn stderr_string(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.stderr()?).into_owned())
    }

    /// Exit code; waits first
    pub fn exit_code(&self) -> Result<i32> {
        self.wait(None)
    }

    pub fn pid(&self) -> i32 {
        self.shared.pid.as_raw()
    }

    pub fn sid(&self) -> Option<i32> {
        self.shared.sid.map(Pid::as_raw)
    }

    pub fn pgid(&self) -> Option<i32> {
        self.shared.pgid.map(Pid::as_raw)
    }

    /// Controlling terminal of the child's session
    pub fn ctty(&self) -> Option<&Path> {
        self.shared.ctty.as_deref()
    }

    pub fn command_line(&self) -> &str {
        &self.shared.command_line
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn signal(&self, sig: i32) -> Result<()> {
        self.shared.signal(sig, false)
    }

    pub fn signal_group(&self, sig: i32) -> Result<()> {
        self.shared.signal(sig, true)
    }

    pub fn terminate(&self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    pub fn kill_group(&self) -> Result<()> {
        self.signal_group(libc::SIGKILL)
    }

    /// Sender for a queue-fed stdin
    pub fn stdin(&self) -> Option<&StdinSender> {
        self.stdin.as_ref()
    }

    pub fn process_ref(&self) -> ProcessRef {
        ProcessRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Chunks of the piped stream as they arrive; waits after the last one
    pub fn iter(&self) -> OutputIter<'_> {
        OutputIter {
            handle: self,
            done: false,
        }
    }

    /// Like [`iter`](Self::iter) but yields [`IterChunk::WouldBlock`] instead of blocking
    pub fn iter_noblock(&self) -> NoBlockIter<'_> {
        NoBlockIter {
            handle: self,
            done: false,
        }
    }

    pub fn change_in_bufsize(&self, bufsize: Bufsize) -> Result<()> {
        change_bufsize(self.stdin_bufferer.as_deref(), StreamRole::Stdin, bufsize)
    }

    pub fn change_out_bufsize(&self, bufsize: Bufsize) -> Result<()> {
        change_bufsize(self.stdout_bufferer.as_deref(), StreamRole::Stdout, bufsize)
    }

    pub fn change_err_bufsize(&self, bufsize: Bufsize) -> Result<()> {
        change_bufsize(self.stderr_bufferer.as_deref(), StreamRole::Stderr, bufsize)
    }

    /// Streaming mode this process was launched with
    pub fn piped(&self) -> Option<PipeMode> {
        self.piped
    }

    /// Stdout after the pump finished, without resolving the result
    pub(crate) fn drain_stdout(&self) -> Vec<u8> {
        self.shared.wait_finished(None);
        self.shared.output(StreamRole::Stdout)
    }

    /// Hand the pipe queue to a downstream reader
    ///
    /// The handle gives up its own receiver so the queue disconnects once the
    /// downstream stops reading.
    pub(crate) fn take_pipe_receiver(&mut self) -> Option<Receiver<Chunk>> {
        self.pipe.take()
    }

    pub(crate) fn take_direct_stdout(&self) -> Option<OwnedFd> {
        self.direct_stdout.lock().take()
    }

    /// Resolve once the pipe queue is exhausted
    fn finish_iteration(&self) -> Option<Result<Chunk>> {
        match self.wait(None) {
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

fn change_bufsize(
    bufferer: Option<&StreamBufferer>,
    role: StreamRole,
    bufsize: Bufsize,
) -> Result<()> {
    match bufferer {
        Some(bufferer) => {
            bufferer.change_buffering(bufsize);
            Ok(())
        }
        None => Err(ShError::InvalidConfig(format!("{} is not pumped", role))),
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.shared.pid)
            .field("command_line", &self.shared.command_line)
            .field("background", &self.background)
            .field("upstream", &self.upstream.as_ref().map(|u| u.pid()))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shared.log_ctx)
    }
}

/// Blocking iteration over a process's output
pub struct OutputIter<'a> {
    handle: &'a ProcessHandle,
    done: bool,
}

impl Iterator for OutputIter<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(pipe) = &self.handle.pipe
            && let Ok(chunk) = pipe.recv()
        {
            return Some(Ok(chunk));
        }
        self.done = true;
        self.handle.finish_iteration()
    }
}

/// Item of a non-blocking iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterChunk {
    Data(Chunk),
    /// Nothing available right now
    WouldBlock,
}

/// Non-blocking iteration over a process's output
pub struct NoBlockIter<'a> {
    handle: &'a ProcessHandle,
    done: bool,
}

impl Iterator for NoBlockIter<'_> {
    type Item = Result<IterChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(pipe) = &self.handle.pipe {
            match pipe.try_recv() {
                Ok(chunk) => return Some(Ok(IterChunk::Data(chunk))),
                Err(TryRecvError::Empty) => return Some(Ok(IterChunk::WouldBlock)),
                Err(TryRecvError::Disconnected) => {}
            }
        }
        self.done = true;
        self.handle
            .finish_iteration()
            .map(|result| result.map(IterChunk::Data))
    }
}

/// `<Command 'cmd' pid N>`, with long commands cut
fn log_context(call_args: &CallArgs, command_line: &str, pid: i32) -> String {
    if let Some(log_msg) = &call_args.log_msg {
        return log_msg(command_line, Some(pid));
    }
    format!("<Command '{}' pid {}>", friendly_truncate(command_line, LOG_CMD_LEN), pid)
}

fn friendly_truncate(s: &str, max_len: usize) -> String {
    let len = s.chars().count();
    if len <= max_len {
        return s.to_string();
    }
    let head: String = s.chars().take(max_len).collect();
    format!("{}...({} more)", head, len - max_len)
}

fn open_sink(sink: OutputSink) -> Result<SinkTarget> {
    Ok(match sink {
        OutputSink::Buffer => SinkTarget::Nowhere,
        OutputSink::Path(path) => SinkTarget::Writer(Box::new(File::create(path)?)),
        OutputSink::File(file) => SinkTarget::Writer(Box::new(file)),
        OutputSink::Fd(fd) => SinkTarget::Writer(Box::new(File::from(fd))),
        OutputSink::Writer(writer) => SinkTarget::Writer(writer),
        OutputSink::Callback(callback) => SinkTarget::Callback(callback),
        OutputSink::Channel(tx) => SinkTarget::Channel(tx),
    })
}

/// Split stdin into a descriptor for the child or a source for the input loop
fn split_stdin(
    stdin: InputSource,
) -> Result<(Option<OwnedFd>, Option<PumpedInput>, Option<StdinSender>)> {
    Ok(match stdin {
        InputSource::Path(path) => (Some(OwnedFd::from(File::open(path)?)), None, None),
        InputSource::File(file) => (Some(OwnedFd::from(file)), None, None),
        InputSource::Fd(fd) => (Some(fd), None, None),
        InputSource::Queue { sender, receiver } => {
            (None, Some(PumpedInput::Queue(receiver)), Some(sender))
        }
        InputSource::Null => (None, Some(PumpedInput::Null), None),
        InputSource::Bytes(data) => (None, Some(PumpedInput::Bytes(Some(data))), None),
        InputSource::Reader(reader) => (None, Some(PumpedInput::Reader(reader)), None),
        InputSource::Iter(iter) => (None, Some(PumpedInput::Iter(iter)), None),
        InputSource::Callable(f) => (None, Some(PumpedInput::Callable(f)), None),
        InputSource::Relay(rx) => (None, Some(PumpedInput::Relay(rx)), None),
    })
}

/// Launch a process described by `spec`
///
/// Fails with `NotFound` before anything is created when the program is
/// missing or not executable. Returns as soon as the child has exec'd.
pub fn launch(spec: LaunchSpec) -> Result<ProcessHandle> {
    launch_linked(spec, None)
}

/// Launch with a pipeline link to `upstream`, which is waited on after this process
pub(crate) fn launch_linked(
    spec: LaunchSpec,
    upstream: Option<Arc<ProcessHandle>>,
) -> Result<ProcessHandle> {
    spec.validate()?;
    let command_line = spec.command_line();
    let LaunchSpec {
        program,
        args,
        call_args,
        stdin,
        stdout,
        stderr,
    } = spec;

    if !is_executable(&program) {
        return Err(ShError::NotFound(program.display().to_string()));
    }

    let cwd = call_args
        .cwd
        .clone()
        .or_else(|| dirstack::global().current());

    let save_stdout = !call_args.no_out
        && (call_args.tee == Some(StreamRole::Stdout) || !stdout.is_redirected());
    let save_stderr = !call_args.no_err
        && (call_args.tee == Some(StreamRole::Stderr) || !stderr.is_redirected());

    let (direct_stdin, pumped_stdin, stdin_sender) = if call_args.fg {
        (None, None, None)
    } else {
        split_stdin(stdin)?
    };
    let stdout_sink = open_sink(stdout)?;
    let stderr_sink = open_sink(stderr)?;

    let transports = Transports::provision(&call_args, direct_stdin)?;
    let Launched {
        pid,
        sid,
        pgid,
        ctty,
        mut transports,
    } = spawn_child(&program, &args, &call_args, cwd.as_deref(), transports)?;

    let log_ctx = log_context(&call_args, &command_line, pid.as_raw());
    info!("{}: process started", log_ctx);

    let shared = Arc::new(ProcessShared {
        pid,
        sid,
        pgid,
        ctty,
        command_line,
        log_ctx,
        ok_code: call_args.ok_code.clone(),
        timeout: call_args.timeout,
        timeout_signal: call_args.timeout_signal,
        stdout: Mutex::new(InternalBuffer::new(call_args.internal_bufsize)),
        stderr: Mutex::new(InternalBuffer::new(call_args.internal_bufsize)),
        save_stdout,
        save_stderr,
        state: Mutex::new(RunState::default()),
        finished: Condvar::new(),
    });
    let process = ProcessRef {
        shared: Arc::downgrade(&shared),
    };

    let (mut pipe_tx, pipe_rx) = if call_args.uses_pipe_queue() {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let pipe_role = call_args.pipe_stream();
    let relayed = call_args.piped == Some(PipeMode::Relay);

    let mut readers = Vec::with_capacity(2);
    let mut direct_stdout = None;
    let mut stdout_bufferer = None;
    let mut stderr_bufferer = None;

    if let Some(fd) = transports.stdout.parent.take() {
        if call_args.piped == Some(PipeMode::Direct) {
            direct_stdout = Some(fd);
        } else {
            let bufferer = Arc::new(StreamBufferer::new(call_args.out_bufsize));
            let pipe = if pipe_role == StreamRole::Stdout {
                pipe_tx.take()
            } else {
                None
            };
            let mut reader = StreamReader::new(
                StreamRole::Stdout,
                fd,
                transports.stdout.is_tty(),
                Arc::clone(&bufferer),
                stdout_sink,
                save_stdout,
                pipe,
            );
            if relayed && pipe_role == StreamRole::Stdout {
                reader = reader.relayed();
            }
            readers.push(reader);
            stdout_bufferer = Some(bufferer);
        }
    }

    if let Some(fd) = transports.stderr.parent.take() {
        let bufferer = Arc::new(StreamBufferer::new(call_args.err_bufsize));
        let pipe = if pipe_role == StreamRole::Stderr {
            pipe_tx.take()
        } else {
            None
        };
        readers.push(StreamReader::new(
            StreamRole::Stderr,
            fd,
            false,
            Arc::clone(&bufferer),
            stderr_sink,
            save_stderr,
            pipe,
        ));
        stderr_bufferer = Some(bufferer);
    }
    drop(pipe_tx);

    let mut stdin_bufferer = None;
    let input = match (transports.stdin.parent.take(), pumped_stdin) {
        (Some(fd), Some(source)) => {
            let bufferer = Arc::new(StreamBufferer::new(call_args.in_bufsize));
            stdin_bufferer = Some(Arc::clone(&bufferer));
            Some(InputWriter::new(fd, source, bufferer, transports.stdin.is_tty()))
        }
        _ => None,
    };

    let ctx = DispatchContext {
        shared: Arc::clone(&shared),
        stdin: stdin_sender
            .clone()
            .unwrap_or_else(StdinSender::disconnected),
        process,
    };
    let pump = start_pump(
        ctx,
        input,
        readers,
        call_args.done.clone(),
        call_args.bg_exc,
    )?;

    Ok(ProcessHandle {
        shared,
        resolved: Mutex::new(None),
        upstream,
        stdin: stdin_sender,
        pipe: pipe_rx,
        direct_stdout: Mutex::new(direct_stdout),
        stdin_bufferer,
        stdout_bufferer,
        stderr_bufferer,
        background: call_args.is_background(),
        piped: call_args.piped,
        pump: Mutex::new(Some(pump)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friendly_truncate_cuts_long_commands() {
        assert_eq!(friendly_truncate("/bin/ls", 20), "/bin/ls");
        assert_eq!(
            friendly_truncate("/usr/bin/something-long --flag", 20),
            "/usr/bin/something-l...(10 more)"
        );
    }

    #[test]
    fn log_context_uses_customizer() {
        let args = CallArgs {
            log_msg: Some(Arc::new(|cmd: &str, pid: Option<i32>| {
                format!("[{}:{}]", cmd, pid.unwrap_or(0))
            })),
            ..Default::default()
        };
        assert_eq!(log_context(&args, "ls", 7), "[ls:7]");
        assert_eq!(
            log_context(&CallArgs::default(), "ls", 7),
            "<Command 'ls' pid 7>"
        );
    }

    #[test]
    fn missing_program_is_not_found_before_launch() {
        let spec = LaunchSpec::new("/definitely/not/a/program");
        let err = launch(spec).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn incompatible_options_fail_before_launch() {
        let mut spec = LaunchSpec::new("/bin/true");
        spec.call_args.fg = true;
        spec.call_args.bg = true;
        assert!(matches!(launch(spec), Err(ShError::InvalidConfig(_))));
    }
}
