//! Launch configuration
//!
//! A [`LaunchSpec`] describes one invocation: program, arguments, the special
//! per-call options in [`CallArgs`], and where each standard stream comes from
//! or goes to. It is built once and moved into [`crate::launch`].

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::errors::{Result, ShError};
use crate::execution::handle::ProcessRef;
use crate::execution::stream::{InputMessage, StdinSender};

/// One unit of output or input data
pub type Chunk = Vec<u8>;

/// Buffering mode for a stream
///
/// Reads are sized by the mode (1 byte, 1024 bytes or N bytes) and then
/// re-chunked before anything is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bufsize {
    /// Every byte is its own chunk
    Unbuffered,
    /// Newline-terminated chunks
    Line,
    /// Fixed-size chunks
    Bytes(usize),
}

impl Bufsize {
    /// 0 is unbuffered, 1 is line buffered, anything else is a chunk size
    pub fn from_type(size: usize) -> Self {
        match size {
            0 => Bufsize::Unbuffered,
            1 => Bufsize::Line,
            n => Bufsize::Bytes(n),
        }
    }

    /// How many bytes a single read asks for
    pub fn read_size(self) -> usize {
        match self {
            Bufsize::Unbuffered => 1,
            Bufsize::Line => 1024,
            Bufsize::Bytes(n) => n.max(1),
        }
    }
}

/// Which standard stream something refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamRole::Stdin => "stdin",
            StreamRole::Stdout => "stdout",
            StreamRole::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS-level transport used between the parent and one child stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Anonymous pipe pair
    Pipe,
    /// Pseudo-terminal pair
    Tty,
    /// A descriptor handed straight to the child; no pump involvement
    Direct,
    /// The child shares the caller's own descriptor
    Inherit,
}

/// Session and process-group placement of the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessGroupPolicy {
    /// `setsid()`: new session and process group, child is the leader
    #[default]
    NewSession,
    /// `setpgid(0, 0)`: new process group inside the caller's session
    NewGroup,
    /// Stay in the caller's session and group
    Inherit,
}

/// How a streaming pipeline moves upstream stdout into downstream stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeMode {
    /// Upstream's pump forwards chunks through its pipe queue
    #[default]
    Relay,
    /// Upstream's stdout descriptor becomes downstream's stdin
    Direct,
}

/// Returned by output callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackAction {
    #[default]
    Continue,
    /// No further callback invocations for this stream; draining continues
    Stop,
}

impl From<()> for CallbackAction {
    fn from(_: ()) -> Self {
        CallbackAction::Continue
    }
}

impl From<bool> for CallbackAction {
    fn from(stop: bool) -> Self {
        if stop {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

type ChunkFn = Box<dyn FnMut(&[u8]) -> CallbackAction + Send>;
type InteractiveFn = Box<dyn FnMut(&[u8], &StdinSender) -> CallbackAction + Send>;
type ProcessFn = Box<dyn FnMut(&[u8], &StdinSender, &ProcessRef) -> CallbackAction + Send>;

/// Output callback in one of its three forms
pub enum OutputCallback {
    /// Receives each chunk
    Chunk(ChunkFn),
    /// Receives each chunk and the stdin queue for interactive replies
    Interactive(InteractiveFn),
    /// Also receives a non-owning reference to the process
    WithProcess(ProcessFn),
}

impl OutputCallback {
    pub fn chunk<F, R>(mut f: F) -> Self
    where
        F: FnMut(&[u8]) -> R + Send + 'static,
        R: Into<CallbackAction>,
    {
        OutputCallback::Chunk(Box::new(move |chunk| f(chunk).into()))
    }

    pub fn interactive<F, R>(mut f: F) -> Self
    where
        F: FnMut(&[u8], &StdinSender) -> R + Send + 'static,
        R: Into<CallbackAction>,
    {
        OutputCallback::Interactive(Box::new(move |chunk, stdin| f(chunk, stdin).into()))
    }

    pub fn with_process<F, R>(mut f: F) -> Self
    where
        F: FnMut(&[u8], &StdinSender, &ProcessRef) -> R + Send + 'static,
        R: Into<CallbackAction>,
    {
        OutputCallback::WithProcess(Box::new(move |chunk, stdin, process| {
            f(chunk, stdin, process).into()
        }))
    }

    pub(crate) fn call(
        &mut self,
        chunk: &[u8],
        stdin: &StdinSender,
        process: &ProcessRef,
    ) -> CallbackAction {
        match self {
            OutputCallback::Chunk(f) => f(chunk),
            OutputCallback::Interactive(f) => f(chunk, stdin),
            OutputCallback::WithProcess(f) => f(chunk, stdin, process),
        }
    }
}

impl fmt::Debug for OutputCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let form = match self {
            OutputCallback::Chunk(_) => "Chunk",
            OutputCallback::Interactive(_) => "Interactive",
            OutputCallback::WithProcess(_) => "WithProcess",
        };
        write!(f, "OutputCallback::{}", form)
    }
}

/// Where the child's stdin comes from
pub enum InputSource {
    /// Externally fed queue; stays open until an explicit end marker or exit
    Queue {
        sender: StdinSender,
        receiver: Receiver<InputMessage>,
    },
    /// Nothing; stdin is closed right away
    Null,
    /// A fixed buffer
    Bytes(Chunk),
    /// Any reader, consumed until EOF
    Reader(Box<dyn Read + Send>),
    /// A sequence of chunks
    Iter(Box<dyn Iterator<Item = Chunk> + Send>),
    /// Called repeatedly until it returns `None`
    Callable(Box<dyn FnMut() -> Option<Chunk> + Send>),
    /// Opened and handed to the child directly
    Path(PathBuf),
    /// Handed to the child directly
    File(File),
    /// Handed to the child directly
    Fd(OwnedFd),
    /// Chunks relayed from an upstream pipe queue
    Relay(Receiver<Chunk>),
}

impl InputSource {
    /// A fresh stdin queue and the sender that feeds it
    pub fn queue() -> (StdinSender, InputSource) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = StdinSender::new(tx);
        (
            sender.clone(),
            InputSource::Queue {
                sender,
                receiver: rx,
            },
        )
    }

    pub fn bytes(data: impl Into<Chunk>) -> Self {
        InputSource::Bytes(data.into())
    }

    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        InputSource::Reader(Box::new(reader))
    }

    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk> + 'static,
        I::IntoIter: Send + 'static,
    {
        InputSource::Iter(Box::new(items.into_iter().map(Into::into)))
    }

    pub fn callable(f: impl FnMut() -> Option<Chunk> + Send + 'static) -> Self {
        InputSource::Callable(Box::new(f))
    }

    /// Whether the child gets a descriptor directly instead of a pumped transport
    pub fn is_fd_based(&self) -> bool {
        matches!(
            self,
            InputSource::Path(_) | InputSource::File(_) | InputSource::Fd(_)
        )
    }
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::queue().1
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Queue { .. } => f.write_str("Queue"),
            InputSource::Null => f.write_str("Null"),
            InputSource::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            InputSource::Reader(_) => f.write_str("Reader"),
            InputSource::Iter(_) => f.write_str("Iter"),
            InputSource::Callable(_) => f.write_str("Callable"),
            InputSource::Path(path) => write!(f, "Path({})", path.display()),
            InputSource::File(_) => f.write_str("File"),
            InputSource::Fd(fd) => write!(f, "Fd({:?})", fd),
            InputSource::Relay(_) => f.write_str("Relay"),
        }
    }
}

impl From<&str> for InputSource {
    fn from(data: &str) -> Self {
        InputSource::Bytes(data.as_bytes().to_vec())
    }
}

impl From<String> for InputSource {
    fn from(data: String) -> Self {
        InputSource::Bytes(data.into_bytes())
    }
}

impl From<Vec<u8>> for InputSource {
    fn from(data: Vec<u8>) -> Self {
        InputSource::Bytes(data)
    }
}

/// Where stdout or stderr chunks go besides the internal buffer
#[derive(Default)]
pub enum OutputSink {
    /// Only the internal buffer
    #[default]
    Buffer,
    /// Created (truncated) and written to
    Path(PathBuf),
    File(File),
    Fd(OwnedFd),
    Writer(Box<dyn Write + Send>),
    Callback(OutputCallback),
    /// Each chunk is sent on the channel
    Channel(Sender<Chunk>),
}

impl OutputSink {
    pub fn callback<F, R>(f: F) -> Self
    where
        F: FnMut(&[u8]) -> R + Send + 'static,
        R: Into<CallbackAction>,
    {
        OutputSink::Callback(OutputCallback::chunk(f))
    }

    pub fn interactive<F, R>(f: F) -> Self
    where
        F: FnMut(&[u8], &StdinSender) -> R + Send + 'static,
        R: Into<CallbackAction>,
    {
        OutputSink::Callback(OutputCallback::interactive(f))
    }

    pub fn with_process<F, R>(f: F) -> Self
    where
        F: FnMut(&[u8], &StdinSender, &ProcessRef) -> R + Send + 'static,
        R: Into<CallbackAction>,
    {
        OutputSink::Callback(OutputCallback::with_process(f))
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        OutputSink::Writer(Box::new(writer))
    }

    /// The default sink keeps output in the internal buffer only
    pub fn is_redirected(&self) -> bool {
        !matches!(self, OutputSink::Buffer)
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSink::Buffer => f.write_str("Buffer"),
            OutputSink::Path(path) => write!(f, "Path({})", path.display()),
            OutputSink::File(_) => f.write_str("File"),
            OutputSink::Fd(fd) => write!(f, "Fd({:?})", fd),
            OutputSink::Writer(_) => f.write_str("Writer"),
            OutputSink::Callback(cb) => write!(f, "Callback({:?})", cb),
            OutputSink::Channel(_) => f.write_str("Channel"),
        }
    }
}

/// Invoked once the process is reaped: (process, success, exit code)
pub type DoneCallback = Arc<dyn Fn(&ProcessRef, bool, i32) + Send + Sync>;
/// Replaces the log context: (command line, pid)
pub type LogMsgFn = Arc<dyn Fn(&str, Option<i32>) -> String + Send + Sync>;
/// Runs in the child after fork and before exec; must only use async-signal-safe calls
pub type PreExecFn = Arc<dyn Fn() -> std::io::Result<()> + Send + Sync>;

/// Special options recognized on every invocation
#[derive(Clone)]
pub struct CallArgs {
    /// Return immediately instead of waiting
    pub bg: bool,
    /// Run on the caller's own stdio without any pump
    pub fg: bool,
    pub in_bufsize: Bufsize,
    pub out_bufsize: Bufsize,
    pub err_bufsize: Bufsize,
    /// Capacity of each internal buffer, in chunks
    pub internal_bufsize: usize,
    /// Accepted exit codes; a signal `k` is accepted as `-k`
    pub ok_code: Vec<i32>,
    pub tty_in: bool,
    /// Off by default: output goes through a pipe, byte for byte
    pub tty_out: bool,
    /// Share one pty between stdin and stdout when both are ttys
    pub unify_ttys: bool,
    /// (rows, cols)
    pub tty_size: (u16, u16),
    pub timeout: Option<Duration>,
    pub timeout_signal: i32,
    pub no_out: bool,
    pub no_err: bool,
    pub no_pipe: bool,
    /// Keep the internal buffer for this stream even when redirected
    pub tee: Option<StreamRole>,
    pub err_to_out: bool,
    pub piped: Option<PipeMode>,
    pub iter: Option<StreamRole>,
    pub iter_noblock: Option<StreamRole>,
    pub long_prefix: String,
    pub long_sep: Option<String>,
    pub process_group: ProcessGroupPolicy,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Descriptors the child keeps besides 0, 1 and 2
    pub pass_fds: Vec<RawFd>,
    /// Replaces the environment when set
    pub env: Option<Vec<(String, String)>>,
    pub cwd: Option<PathBuf>,
    pub done: Option<DoneCallback>,
    /// Log failures of background processes nobody waits on
    pub bg_exc: bool,
    pub log_msg: Option<LogMsgFn>,
    pub pre_exec: Option<PreExecFn>,
}

impl Default for CallArgs {
    fn default() -> Self {
        Self {
            bg: false,
            fg: false,
            in_bufsize: Bufsize::Unbuffered,
            out_bufsize: Bufsize::Line,
            err_bufsize: Bufsize::Line,
            internal_bufsize: 3 * 1024 * 1024,
            ok_code: vec![0],
            tty_in: false,
            tty_out: false,
            unify_ttys: true,
            tty_size: (20, 80),
            timeout: None,
            timeout_signal: libc::SIGKILL,
            no_out: false,
            no_err: false,
            no_pipe: false,
            tee: None,
            err_to_out: false,
            piped: None,
            iter: None,
            iter_noblock: None,
            long_prefix: "--".to_string(),
            long_sep: Some("=".to_string()),
            process_group: ProcessGroupPolicy::NewSession,
            uid: None,
            gid: None,
            pass_fds: Vec::new(),
            env: None,
            cwd: None,
            done: None,
            bg_exc: false,
            log_msg: None,
            pre_exec: None,
        }
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs")
            .field("bg", &self.bg)
            .field("fg", &self.fg)
            .field("in_bufsize", &self.in_bufsize)
            .field("out_bufsize", &self.out_bufsize)
            .field("err_bufsize", &self.err_bufsize)
            .field("ok_code", &self.ok_code)
            .field("tty_in", &self.tty_in)
            .field("tty_out", &self.tty_out)
            .field("timeout", &self.timeout)
            .field("piped", &self.piped)
            .field("iter", &self.iter)
            .field("iter_noblock", &self.iter_noblock)
            .field("process_group", &self.process_group)
            .field("cwd", &self.cwd)
            .field("done", &self.done.is_some())
            .finish_non_exhaustive()
    }
}

impl CallArgs {
    /// Whether the call returns before the process finishes
    pub fn is_background(&self) -> bool {
        self.bg || self.done.is_some()
    }

    /// Whether launching also waits: not in the background, not iterated, not piped
    pub fn waits_on_launch(&self) -> bool {
        !self.is_background() && self.iteration().is_none() && self.piped.is_none()
    }

    /// The stream to iterate over, and whether iteration is non-blocking
    pub fn iteration(&self) -> Option<(StreamRole, bool)> {
        self.iter_noblock
            .map(|role| (role, true))
            .or(self.iter.map(|role| (role, false)))
    }

    /// Only relayed pipelines and iteration read the pipe queue; nothing else
    /// gets one, so an unread queue can't hold a process's whole output
    pub fn uses_pipe_queue(&self) -> bool {
        !self.no_pipe && (self.piped == Some(PipeMode::Relay) || self.iteration().is_some())
    }

    /// The stream whose chunks feed the pipe queue
    pub fn pipe_stream(&self) -> StreamRole {
        match self.iteration() {
            Some((StreamRole::Stderr, _)) => StreamRole::Stderr,
            _ => StreamRole::Stdout,
        }
    }

    /// Reject option combinations that make no sense together
    pub fn validate(&self, stderr_redirected: bool) -> Result<()> {
        let iterating = self.iteration().is_some();
        let conflicts = [
            (
                stderr_redirected && self.err_to_out,
                "Stderr is already being redirected",
            ),
            (
                self.piped.is_some() && iterating,
                "You cannot iterate when this command is being piped",
            ),
            (
                self.piped.is_some() && self.no_pipe,
                "Using a pipe doesn't make sense if you've disabled the pipe",
            ),
            (
                self.no_out && iterating,
                "You cannot iterate over output if there is no output",
            ),
            (
                self.fg && self.is_background(),
                "Command can't be run in the foreground and background",
            ),
        ];

        match conflicts.iter().find(|(hit, _)| *hit) {
            Some((_, msg)) => Err(ShError::InvalidConfig((*msg).to_string())),
            None => Ok(()),
        }
    }
}

/// Everything needed to launch one process
#[derive(Debug)]
pub struct LaunchSpec {
    /// Absolute path of the executable
    pub program: PathBuf,
    /// Arguments after the program name
    pub args: Vec<String>,
    pub call_args: CallArgs,
    pub stdin: InputSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            call_args: CallArgs::default(),
            stdin: InputSource::default(),
            stdout: OutputSink::default(),
            stderr: OutputSink::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The program followed by its arguments, space separated
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> Result<()> {
        self.call_args.validate(self.stderr.is_redirected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_args_defaults() {
        let args = CallArgs::default();
        assert!(!args.bg);
        assert_eq!(args.in_bufsize, Bufsize::Unbuffered);
        assert_eq!(args.out_bufsize, Bufsize::Line);
        assert_eq!(args.err_bufsize, Bufsize::Line);
        assert_eq!(args.internal_bufsize, 3 * 1024 * 1024);
        assert_eq!(args.ok_code, vec![0]);
        assert_eq!(args.tty_size, (20, 80));
        assert!(!args.tty_in);
        assert!(!args.tty_out);
        assert!(args.unify_ttys);
        assert_eq!(args.timeout_signal, libc::SIGKILL);
        assert_eq!(args.long_sep.as_deref(), Some("="));
        assert_eq!(args.process_group, ProcessGroupPolicy::NewSession);
    }

    #[test]
    fn test_bufsize_from_type() {
        assert_eq!(Bufsize::from_type(0), Bufsize::Unbuffered);
        assert_eq!(Bufsize::from_type(1), Bufsize::Line);
        assert_eq!(Bufsize::from_type(4096), Bufsize::Bytes(4096));
        assert_eq!(Bufsize::Unbuffered.read_size(), 1);
        assert_eq!(Bufsize::Line.read_size(), 1024);
        assert_eq!(Bufsize::Bytes(0).read_size(), 1);
    }

    #[test]
    fn test_incompatible_options_rejected() {
        let mut args = CallArgs {
            err_to_out: true,
            ..Default::default()
        };
        assert!(args.validate(true).is_err());
        assert!(args.validate(false).is_ok());

        args = CallArgs {
            piped: Some(PipeMode::Relay),
            iter: Some(StreamRole::Stdout),
            ..Default::default()
        };
        assert!(matches!(args.validate(false), Err(ShError::InvalidConfig(_))));

        args = CallArgs {
            piped: Some(PipeMode::Direct),
            no_pipe: true,
            ..Default::default()
        };
        assert!(args.validate(false).is_err());

        args = CallArgs {
            no_out: true,
            iter_noblock: Some(StreamRole::Stdout),
            ..Default::default()
        };
        assert!(args.validate(false).is_err());

        args = CallArgs {
            fg: true,
            bg: true,
            ..Default::default()
        };
        assert!(args.validate(false).is_err());
    }

    #[test]
    fn test_done_callback_implies_background() {
        let args = CallArgs {
            done: Some(Arc::new(|_: &ProcessRef, _: bool, _: i32| {})),
            ..Default::default()
        };
        assert!(args.is_background());
    }

    #[test]
    fn test_pipe_stream_follows_iteration() {
        let args = CallArgs {
            iter: Some(StreamRole::Stderr),
            ..Default::default()
        };
        assert_eq!(args.pipe_stream(), StreamRole::Stderr);
        assert_eq!(CallArgs::default().pipe_stream(), StreamRole::Stdout);
    }

    #[test]
    fn test_pipe_queue_only_when_read() {
        assert!(!CallArgs::default().uses_pipe_queue());

        let relay = CallArgs {
            piped: Some(PipeMode::Relay),
            ..Default::default()
        };
        assert!(relay.uses_pipe_queue());

        let direct = CallArgs {
            piped: Some(PipeMode::Direct),
            ..Default::default()
        };
        assert!(!direct.uses_pipe_queue());

        let iterated = CallArgs {
            iter_noblock: Some(StreamRole::Stdout),
            ..Default::default()
        };
        assert!(iterated.uses_pipe_queue());

        let disabled = CallArgs {
            iter: Some(StreamRole::Stdout),
            no_pipe: true,
            ..Default::default()
        };
        assert!(!disabled.uses_pipe_queue());
    }

    #[test]
    fn test_command_line() {
        let spec = LaunchSpec::new("/bin/echo").arg("hello").arg("world");
        assert_eq!(spec.command_line(), "/bin/echo hello world");
    }

    #[test]
    fn test_callback_action_conversions() {
        assert_eq!(CallbackAction::from(()), CallbackAction::Continue);
        assert_eq!(CallbackAction::from(true), CallbackAction::Stop);
        assert_eq!(CallbackAction::from(false), CallbackAction::Continue);
    }
}
