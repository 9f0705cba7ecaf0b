//! Re-chunking of raw reads according to a stream's buffering mode

use log::debug;
use parking_lot::Mutex;

use crate::config::{Bufsize, Chunk};

/// Chunk size used once a line-buffered stream turns out to carry binary data
pub const BINARY_CHUNK_SIZE: usize = 1024;

/// Splits incoming data into unbuffered, line or fixed-size chunks
///
/// The mode can change from another thread while data flows (a stdout
/// callback changing stdin buffering, for instance), so state sits behind a
/// lock.
#[derive(Debug)]
pub struct StreamBufferer {
    state: Mutex<BuffererState>,
}

#[derive(Debug)]
struct BuffererState {
    kind: Bufsize,
    buffer: Vec<u8>,
    /// Start of a UTF-8 sequence cut off at the end of the last read
    utf8_tail: Vec<u8>,
    // data saved while searching for a newline must go out first after a
    // switch to unbuffered
    use_up_buffer_first: bool,
}

impl StreamBufferer {
    pub fn new(kind: Bufsize) -> Self {
        Self {
            state: Mutex::new(BuffererState {
                kind,
                buffer: Vec::new(),
                utf8_tail: Vec::new(),
                use_up_buffer_first: false,
            }),
        }
    }

    pub fn kind(&self) -> Bufsize {
        self.state.lock().kind
    }

    /// How many bytes the next read should ask for
    pub fn read_size(&self) -> usize {
        self.kind().read_size()
    }

    pub fn change_buffering(&self, kind: Bufsize) {
        let mut state = self.state.lock();
        if kind == Bufsize::Unbuffered {
            state.use_up_buffer_first = true;
        }
        state.kind = kind;
    }

    /// Feed raw data, get back the chunks ready for dispatch
    pub fn process(&self, data: &[u8]) -> Vec<Chunk> {
        let mut state = self.state.lock();

        if state.kind == Bufsize::Line && looks_binary(&mut state.utf8_tail, data) {
            debug!("detected binary data, switching to {}-byte chunks", BINARY_CHUNK_SIZE);
            state.kind = Bufsize::Bytes(BINARY_CHUNK_SIZE);
        }

        match state.kind {
            Bufsize::Unbuffered => {
                let mut out = Vec::with_capacity(2);
                if state.use_up_buffer_first {
                    state.use_up_buffer_first = false;
                    let saved = std::mem::take(&mut state.buffer);
                    if !saved.is_empty() {
                        out.push(saved);
                    }
                }
                out.push(data.to_vec());
                out
            }
            Bufsize::Line => {
                let mut out = Vec::new();
                let mut rest = data;
                while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
                    let mut line = std::mem::take(&mut state.buffer);
                    line.extend_from_slice(&rest[..=pos]);
                    out.push(line);
                    rest = &rest[pos + 1..];
                }
                state.buffer.extend_from_slice(rest);
                out
            }
            Bufsize::Bytes(size) => {
                let size = size.max(1);
                state.buffer.extend_from_slice(data);
                let mut out = Vec::new();
                while state.buffer.len() >= size {
                    let tail = state.buffer.split_off(size);
                    out.push(std::mem::replace(&mut state.buffer, tail));
                }
                out
            }
        }
    }

    /// Whatever was held back waiting for a newline or a full chunk
    pub fn flush(&self) -> Option<Chunk> {
        let mut state = self.state.lock();
        let saved = std::mem::take(&mut state.buffer);
        (!saved.is_empty()).then_some(saved)
    }
}

/// Invalid UTF-8 anywhere but an incomplete trailing sequence
///
/// Only `data` and the at most 3 bytes carried over in `tail` are checked,
/// so a long line costs linear time however many reads it spans.
fn looks_binary(tail: &mut Vec<u8>, data: &[u8]) -> bool {
    let joined;
    let bytes = if tail.is_empty() {
        data
    } else {
        joined = [tail.as_slice(), data].concat();
        &joined
    };

    match std::str::from_utf8(bytes) {
        Ok(_) => {
            tail.clear();
            false
        }
        Err(e) if e.error_len().is_some() => true,
        Err(e) => {
            let rest = bytes[e.valid_up_to()..].to_vec();
            *tail = rest;
            false
        }
    }
}
