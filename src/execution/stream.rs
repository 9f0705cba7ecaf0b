//! I/O pump
//!
//! Each process gets one input thread writing into its stdin and one output
//! thread multiplexing stdout and stderr with `poll`. The output thread is
//! also the only reaper: once both streams hit end-of-data it collects the exit
//! status, joins the input thread, runs the done callback and marks the
//! process finished.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};

use super::bufferer::StreamBufferer;
use super::handle::{ProcessRef, ProcessShared};
use super::transport::veof_char;
use crate::config::{CallbackAction, Chunk, DoneCallback, OutputCallback, StreamRole};
use crate::errors::{Result, ShError};

/// How long the input loop waits on a queue before re-checking liveness
const QUEUE_POLL: Duration = Duration::from_millis(10);
/// Upper bound on one `poll` so the timeout check runs regularly
const POLL_INTERVAL_MS: u16 = 100;
/// Sleep between non-blocking reap attempts
const REAP_INTERVAL: Duration = Duration::from_millis(5);
/// Read size for reader and file inputs
const INPUT_READ_SIZE: usize = 1024;

/// Message on a stdin queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMessage {
    Data(Chunk),
    /// No more input; stdin is closed
    Eof,
}

/// Feeds a process's stdin queue
///
/// Handed to interactive callbacks so they can answer prompts.
#[derive(Debug, Clone)]
pub struct StdinSender {
    tx: Sender<InputMessage>,
}

impl StdinSender {
    pub(crate) fn new(tx: Sender<InputMessage>) -> Self {
        Self { tx }
    }

    /// A sender whose every send fails; used when stdin isn't queue-fed
    pub(crate) fn disconnected() -> Self {
        let (tx, _) = crossbeam_channel::bounded(0);
        Self { tx }
    }

    /// Queue data for the child; `false` once the input loop is gone
    pub fn send(&self, data: impl Into<Chunk>) -> bool {
        self.tx.send(InputMessage::Data(data.into())).is_ok()
    }

    /// Signal end of input
    pub fn close(&self) -> bool {
        self.tx.send(InputMessage::Eof).is_ok()
    }
}

/// Ring buffer of the most recent chunks of one output stream
///
/// Capacity counts chunks, not bytes. Overflow drops the oldest chunk.
#[derive(Debug)]
pub struct InternalBuffer {
    chunks: VecDeque<Chunk>,
    capacity: usize,
}

impl InternalBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: Chunk) {
        if self.capacity == 0 {
            return;
        }
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All stored chunks joined
    pub fn contents(&self) -> Vec<u8> {
        let total = self.chunks.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

enum Feed {
    Data(Chunk),
    NotReady,
    Exhausted,
}

/// A stdin source that the input loop consumes
pub(crate) enum PumpedInput {
    Queue(Receiver<InputMessage>),
    Null,
    Bytes(Option<Chunk>),
    Reader(Box<dyn Read + Send>),
    Iter(Box<dyn Iterator<Item = Chunk> + Send>),
    Callable(Box<dyn FnMut() -> Option<Chunk> + Send>),
    Relay(Receiver<Chunk>),
}

impl PumpedInput {
    fn next_feed(&mut self) -> io::Result<Feed> {
        let feed = match self {
            PumpedInput::Queue(rx) => match rx.recv_timeout(QUEUE_POLL) {
                Ok(InputMessage::Data(data)) => Feed::Data(data),
                Ok(InputMessage::Eof) | Err(RecvTimeoutError::Disconnected) => Feed::Exhausted,
                Err(RecvTimeoutError::Timeout) => Feed::NotReady,
            },
            PumpedInput::Relay(rx) => match rx.recv_timeout(QUEUE_POLL) {
                Ok(data) => Feed::Data(data),
                Err(RecvTimeoutError::Disconnected) => Feed::Exhausted,
                Err(RecvTimeoutError::Timeout) => Feed::NotReady,
            },
            PumpedInput::Null => Feed::Exhausted,
            PumpedInput::Bytes(data) => match data.take() {
                Some(data) => Feed::Data(data),
                None => Feed::Exhausted,
            },
            PumpedInput::Reader(reader) => {
                let mut buf = vec![0u8; INPUT_READ_SIZE];
                match reader.read(&mut buf) {
                    Ok(0) => Feed::Exhausted,
                    Ok(n) => {
                        buf.truncate(n);
                        Feed::Data(buf)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => Feed::NotReady,
                    Err(e) => return Err(e),
                }
            }
            PumpedInput::Iter(iter) => match iter.next() {
                Some(data) => Feed::Data(data),
                None => Feed::Exhausted,
            },
            PumpedInput::Callable(f) => match f() {
                Some(data) => Feed::Data(data),
                None => Feed::Exhausted,
            },
        };
        Ok(feed)
    }
}

/// Writes a source into the child's stdin
pub(crate) struct InputWriter {
    file: File,
    source: PumpedInput,
    bufferer: Arc<StreamBufferer>,
    tty: bool,
}

impl InputWriter {
    pub(crate) fn new(
        fd: OwnedFd,
        source: PumpedInput,
        bufferer: Arc<StreamBufferer>,
        tty: bool,
    ) -> Self {
        Self {
            file: File::from(fd),
            source,
            bufferer,
            tty,
        }
    }

    /// Runs until the source is exhausted, the child stops reading, or it exits
    ///
    /// A tty stays open (returned) so the child isn't hung up on before it exits.
    fn run(mut self, shared: &ProcessShared) -> Option<File> {
        let mut open = true;
        while open && shared.is_alive() {
            match self.source.next_feed() {
                Ok(Feed::Data(data)) => {
                    for chunk in self.bufferer.process(&data) {
                        if !self.write(&chunk, shared) {
                            open = false;
                            break;
                        }
                    }
                }
                Ok(Feed::NotReady) => {}
                Ok(Feed::Exhausted) => break,
                Err(e) => {
                    shared.record_pump_error(StreamRole::Stdin, e);
                    break;
                }
            }
        }

        if open && let Some(rest) = self.bufferer.flush() {
            open = self.write(&rest, shared);
        }

        if self.tty {
            if open && shared.is_alive() {
                let eof = veof_char(&self.file);
                let _ = self.write(&[eof], shared);
            }
            return Some(self.file);
        }

        debug!("{}: closing stdin", shared.log_ctx);
        None
    }

    fn write(&mut self, chunk: &[u8], shared: &ProcessShared) -> bool {
        match self.file.write_all(chunk) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("{}: stdin closed by child", shared.log_ctx);
                false
            }
            Err(e) if self.tty && e.raw_os_error() == Some(libc::EIO) => {
                debug!("{}: terminal hung up", shared.log_ctx);
                false
            }
            Err(e) => {
                shared.record_pump_error(StreamRole::Stdin, e);
                false
            }
        }
    }
}

/// Where an output stream's chunks are forwarded
pub(crate) enum SinkTarget {
    Nowhere,
    Writer(Box<dyn Write + Send>),
    Callback(OutputCallback),
    Channel(Sender<Chunk>),
}

/// Everything an output callback may be handed
pub(crate) struct DispatchContext {
    pub(crate) shared: Arc<ProcessShared>,
    pub(crate) stdin: StdinSender,
    pub(crate) process: ProcessRef,
}

/// Reads one output stream and dispatches its chunks
pub(crate) struct StreamReader {
    role: StreamRole,
    file: File,
    tty: bool,
    bufferer: Arc<StreamBufferer>,
    sink: SinkTarget,
    stopped: bool,
    save: bool,
    pipe: Option<Sender<Chunk>>,
    /// The pipe queue feeds a downstream process
    relay: bool,
    /// The downstream went away; the producer must see a closed pipe
    detached: bool,
}

impl StreamReader {
    pub(crate) fn new(
        role: StreamRole,
        fd: OwnedFd,
        tty: bool,
        bufferer: Arc<StreamBufferer>,
        sink: SinkTarget,
        save: bool,
        pipe: Option<Sender<Chunk>>,
    ) -> Self {
        Self {
            role,
            file: File::from(fd),
            tty,
            bufferer,
            sink,
            stopped: false,
            save,
            pipe,
            relay: false,
            detached: false,
        }
    }

    pub(crate) fn relayed(mut self) -> Self {
        self.relay = true;
        self
    }

    /// One read; `true` once the stream is done
    fn read(&mut self, ctx: &DispatchContext) -> bool {
        let mut buf = vec![0u8; self.bufferer.read_size()];
        match self.file.read(&mut buf) {
            Ok(0) => true,
            Ok(n) => {
                for chunk in self.bufferer.process(&buf[..n]) {
                    self.write_chunk(chunk, ctx);
                }
                self.detached
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                false
            }
            // the slave side of a pty is gone
            Err(e) if self.tty && e.raw_os_error() == Some(libc::EIO) => true,
            Err(e) => {
                ctx.shared.record_pump_error(self.role, e);
                true
            }
        }
    }

    fn write_chunk(&mut self, chunk: Chunk, ctx: &DispatchContext) {
        if self.save {
            ctx.shared.buffer(self.role).lock().push(chunk.clone());
        }

        if !self.stopped {
            self.dispatch(&chunk, ctx);
        }

        if self.save
            && let Some(pipe) = &self.pipe
            && pipe.send(chunk).is_err()
        {
            self.pipe = None;
            if self.relay {
                debug!("{}: downstream stopped reading {}", ctx.shared.log_ctx, self.role);
                self.detached = true;
            }
        }
    }

    fn dispatch(&mut self, chunk: &[u8], ctx: &DispatchContext) {
        let role = self.role;
        match &mut self.sink {
            SinkTarget::Nowhere => {}
            SinkTarget::Writer(writer) => {
                if let Err(e) = writer.write_all(chunk) {
                    warn!("{}: {} sink write failed: {}", ctx.shared.log_ctx, role, e);
                    ctx.shared.record_pump_error(role, e);
                    self.stopped = true;
                }
            }
            SinkTarget::Channel(tx) => {
                if tx.send(chunk.to_vec()).is_err() {
                    self.stopped = true;
                }
            }
            SinkTarget::Callback(callback) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    callback.call(chunk, &ctx.stdin, &ctx.process)
                }));
                match outcome {
                    Ok(action) => {
                        if action == CallbackAction::Stop {
                            debug!("{}: {} callback asked to stop", ctx.shared.log_ctx, role);
                            self.stopped = true;
                        }
                    }
                    Err(_) => {
                        error!("{}: {} callback panicked", ctx.shared.log_ctx, role);
                        ctx.shared.record_pump_error(
                            role,
                            io::Error::other(format!("{} callback panicked", role)),
                        );
                        self.stopped = true;
                    }
                }
            }
        }
    }

    /// Flush whatever the bufferer held back
    fn close(&mut self, ctx: &DispatchContext) {
        if let Some(rest) = self.bufferer.flush() {
            self.write_chunk(rest, ctx);
        }
        if let SinkTarget::Writer(writer) = &mut self.sink
            && let Err(e) = writer.flush()
        {
            warn!("{}: {} sink flush failed: {}", ctx.shared.log_ctx, self.role, e);
        }
        // dropping the sender lets relayed pipelines see end of input
        self.pipe = None;
    }
}

/// Start the input and output threads for a launched process
pub(crate) fn start_pump(
    ctx: DispatchContext,
    input: Option<InputWriter>,
    readers: Vec<StreamReader>,
    done: Option<DoneCallback>,
    bg_exc: bool,
) -> Result<JoinHandle<()>> {
    let pid = ctx.shared.pid;

    let input_thread = match input {
        Some(writer) => {
            let shared = Arc::clone(&ctx.shared);
            let handle = thread::Builder::new()
                .name(format!("shproc-in-{}", pid))
                .spawn(move || writer.run(&shared))
                .map_err(ShError::Io)?;
            Some(handle)
        }
        None => None,
    };

    thread::Builder::new()
        .name(format!("shproc-out-{}", pid))
        .spawn(move || output_thread(ctx, readers, input_thread, done, bg_exc))
        .map_err(ShError::Io)
}

fn output_thread(
    ctx: DispatchContext,
    readers: Vec<StreamReader>,
    input_thread: Option<JoinHandle<Option<File>>>,
    done: Option<DoneCallback>,
    bg_exc: bool,
) {
    let started = Instant::now();
    // kept open until the child is reaped: a pty master closing early hangs it up
    let drained = pump_output(&ctx, readers, started);
    reap(&ctx.shared, started);
    drop(drained);

    if let Some(handle) = input_thread {
        match handle.join() {
            Ok(tty) => drop(tty),
            Err(_) => error!("{}: input thread panicked", ctx.shared.log_ctx),
        }
    }

    if let Some(done) = done {
        let success = ctx.shared.succeeded();
        let code = ctx.shared.exit_code().unwrap_or(-1);
        if panic::catch_unwind(AssertUnwindSafe(|| done(&ctx.process, success, code))).is_err() {
            warn!("{}: done callback panicked", ctx.shared.log_ctx);
        }
    }

    if bg_exc && let Some(summary) = ctx.shared.failure_summary() {
        error!("{}: background process failed: {}", ctx.shared.log_ctx, summary);
    }

    ctx.shared.mark_finished();
}

fn pump_output(
    ctx: &DispatchContext,
    mut readers: Vec<StreamReader>,
    started: Instant,
) -> Vec<StreamReader> {
    let mut drained = Vec::with_capacity(readers.len());

    while !readers.is_empty() {
        let wait_ms = ctx
            .shared
            .time_left(started)
            .map(|left| left.as_millis().min(POLL_INTERVAL_MS as u128) as u16)
            .unwrap_or(POLL_INTERVAL_MS);

        let ready: Vec<usize> = {
            let mut fds: Vec<PollFd<'_>> = readers
                .iter()
                .map(|r| PollFd::new(r.file.as_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, wait_ms) {
                Ok(0) | Err(Errno::EINTR) => Vec::new(),
                Ok(_) => fds
                    .iter()
                    .enumerate()
                    .filter(|(_, fd)| fd.revents().is_some_and(|ev| !ev.is_empty()))
                    .map(|(idx, _)| idx)
                    .collect(),
                Err(e) => {
                    ctx.shared
                        .record_pump_error(StreamRole::Stdout, io::Error::from(e));
                    drained.append(&mut readers);
                    break;
                }
            }
        };

        let mut finished = Vec::new();
        for idx in ready {
            if readers[idx].read(ctx) {
                finished.push(idx);
            }
        }
        for idx in finished.into_iter().rev() {
            let mut reader = readers.remove(idx);
            reader.close(ctx);
            if reader.detached {
                // closing the read end now sends SIGPIPE on the producer's next write
                debug!("{}: {} detached", ctx.shared.log_ctx, reader.role);
                continue;
            }
            debug!("{}: {} drained", ctx.shared.log_ctx, reader.role);
            drained.push(reader);
        }

        ctx.shared.check_timeout(started);
    }

    drained
}

fn reap(shared: &ProcessShared, started: Instant) {
    if shared.timeout.is_none() {
        shared.wait_for_exit_event();
    }

    loop {
        match shared.try_reap() {
            Ok(true) => break,
            Ok(false) => {
                shared.check_timeout(started);
                thread::sleep(REAP_INTERVAL);
            }
            Err(e) => {
                error!("{}: reaping failed: {}", shared.log_ctx, e);
                shared.record_pump_error(StreamRole::Stdout, io::Error::from(e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_buffer_drops_oldest() {
        let mut buffer = InternalBuffer::new(2);
        buffer.push(b"a".to_vec());
        buffer.push(b"b".to_vec());
        buffer.push(b"c".to_vec());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.contents(), b"bc".to_vec());
    }

    #[test]
    fn zero_capacity_buffer_stores_nothing() {
        let mut buffer = InternalBuffer::new(0);
        buffer.push(b"a".to_vec());
        assert!(buffer.is_empty());
    }

    #[test]
    fn queue_input_ends_on_eof_marker() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = StdinSender::new(tx);
        assert!(sender.send("abc"));
        assert!(sender.close());

        let mut input = PumpedInput::Queue(rx);
        assert!(matches!(input.next_feed().unwrap(), Feed::Data(d) if d == b"abc"));
        assert!(matches!(input.next_feed().unwrap(), Feed::Exhausted));
    }

    #[test]
    fn empty_queue_is_not_ready() {
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut input = PumpedInput::Queue(rx);
        assert!(matches!(input.next_feed().unwrap(), Feed::NotReady));
    }

    #[test]
    fn disconnected_sender_rejects_data() {
        let sender = StdinSender::disconnected();
        assert!(!sender.send("x"));
        assert!(!sender.close());
    }

    #[test]
    fn reader_input_reads_until_eof() {
        let mut input = PumpedInput::Reader(Box::new(io::Cursor::new(b"hello".to_vec())));
        assert!(matches!(input.next_feed().unwrap(), Feed::Data(d) if d == b"hello"));
        assert!(matches!(input.next_feed().unwrap(), Feed::Exhausted));
    }

    #[test]
    fn bytes_input_is_fed_once() {
        let mut input = PumpedInput::Bytes(Some(b"abc".to_vec()));
        assert!(matches!(input.next_feed().unwrap(), Feed::Data(d) if d == b"abc"));
        assert!(matches!(input.next_feed().unwrap(), Feed::Exhausted));
    }
}
