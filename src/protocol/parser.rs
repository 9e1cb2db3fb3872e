//! Incremental Memcache Protocol Parser
//!
//! This module implements a chunk-driven parser for the memcached ASCII
//! protocol. The socket hands it whatever fragment TCP delivered, and the
//! parser reconstructs complete command lines and any binary block that a
//! line announces.
//!
//! ## Design Philosophy
//!
//! 1. **Incremental**: `on_data()` fully consumes or buffers every chunk. It
//!    never asks for more data.
//! 2. **Zero-Copy**: chunks arrive as `bytes::Bytes` and are sliced, not copied,
//!    until residue must be joined with the next chunk.
//! 3. **Error Recovery**: malformed input is reported to the handler and the
//!    parser resyncs by abandoning the rest of the chunk.
//!
//! ## How the Parser Works
//!
//! While there is unconsumed data, either a pending payload is active and is
//! filled from the front of the data, or the parser scans for CRLF to extract
//! the next line. Each line is split on single spaces and handed to
//! [`ParserHandler::process_cmd`], whose [`Disposition`] decides what follows:
//!
//! - `Handled` - keep going with the rest of the chunk
//! - `ExpectPayload(n)` - `n` bytes of binary data plus CRLF follow the line
//! - `Unknown` - report and drop everything left in the chunk
//!
//! When no CRLF is present the bytes are kept as partial residue, and the
//! next scan resumes one byte before where this one ended, so a line split
//! across many fragments is scanned once overall.

use crate::protocol::types::CRLF;
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

/// Residue above this size with no pending payload is suspicious.
pub const MAX_PARTIAL_LINE: usize = 512;

/// Combined residue + new data above this size triggers a reset.
pub const MAX_BUFFERED_LINE: usize = 2000;

/// Payload buffers start no larger than this and grow as data arrives.
const MAX_PREALLOCATE: usize = 64 * 1024;

/// What a handler decided about a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The line was fully handled.
    Handled,
    /// The line announces this many bytes of binary payload.
    ExpectPayload(usize),
    /// The command is not understood.
    Unknown,
}

/// A completed binary block together with the line that announced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// The first token of the announcing line.
    pub command: String,
    /// All tokens of the announcing line.
    pub tokens: Vec<String>,
    /// The payload bytes, without the trailing CRLF.
    pub data: Bytes,
}

/// The consumer side of the parser.
///
/// A client connection and a server connection both implement this to
/// receive parsed commands.
pub trait ParserHandler {
    /// Called for every complete command line.
    fn process_cmd(&mut self, tokens: &[String]) -> Disposition;

    /// Called once a declared payload and its CRLF have been received.
    fn receive_result(&mut self, payload: Payload);

    /// The line had an empty first token.
    fn malformed_command(&mut self, tokens: &[String]) {
        error!(?tokens, "Malformed command");
    }

    /// A payload was not followed by CRLF.
    fn malformed_data_stream(&mut self, command: &str, remaining: usize) {
        error!(
            cmd = command,
            remaining = remaining,
            "Malformed memcache data stream"
        );
    }

    /// `process_cmd` returned [`Disposition::Unknown`].
    fn unknown_command(&mut self, tokens: &[String]) {
        error!(?tokens, "Unknown command");
    }
}

/// A binary block that is still being received.
#[derive(Debug)]
struct PendingPayload {
    data: BytesMut,
    length: usize,
    command: String,
    tokens: Vec<String>,
}

impl PendingPayload {
    fn remaining(&self) -> usize {
        self.length - self.data.len()
    }

    fn is_filled(&self) -> bool {
        self.data.len() == self.length
    }

    fn into_payload(self) -> Payload {
        Payload {
            command: self.command,
            tokens: self.tokens,
            data: self.data.freeze(),
        }
    }
}

/// An incremental memcache protocol parser.
///
/// # Example
///
/// ```ignore
/// use memcache_client::protocol::{MemcacheParser, ParserHandler};
/// use bytes::Bytes;
///
/// let mut parser = MemcacheParser::new();
/// parser.on_data(Bytes::from_static(b"VALUE foo 0 3\r\nb"), &mut handler);
/// parser.on_data(Bytes::from_static(b"ar\r\nEND\r\n"), &mut handler);
/// ```
#[derive(Debug, Default)]
pub struct MemcacheParser {
    /// Payload currently being filled
    pending: Option<PendingPayload>,
    /// Bytes held back until the next chunk
    partial: Option<Bytes>,
    /// Where the next CRLF scan of the partial line starts
    lookup_offset: usize,
}

impl MemcacheParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a payload is being received.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns the number of bytes held back for the next chunk.
    pub fn partial_len(&self) -> usize {
        self.partial.as_ref().map_or(0, Bytes::len)
    }

    /// Declares that `length` bytes of binary payload follow the current line.
    pub fn initiate_pending(&mut self, tokens: Vec<String>, length: usize) {
        debug_assert!(self.pending.is_none(), "already waiting for data");
        let command = tokens.first().cloned().unwrap_or_default();
        self.pending = Some(PendingPayload {
            data: BytesMut::with_capacity(length.min(MAX_PREALLOCATE)),
            length,
            command,
            tokens,
        });
    }

    /// Feeds one received chunk through the parser.
    ///
    /// Chunks must be passed in arrival order. Everything in the chunk is
    /// consumed or buffered before this returns.
    pub fn on_data<H: ParserHandler + ?Sized>(&mut self, chunk: Bytes, handler: &mut H) {
        let Some(mut data) = self.join_partial(chunk) else {
            return;
        };

        loop {
            if self.pending.is_some() {
                match self.copy_pending(data, handler) {
                    Some(rest) => data = rest,
                    None => return,
                }
            }

            match self.parse_cmd(data, handler) {
                Some(rest) => data = rest,
                None => return,
            }
        }
    }

    /// Joins held-back residue with the new chunk.
    fn join_partial(&mut self, chunk: Bytes) -> Option<Bytes> {
        if chunk.is_empty() {
            return None;
        }

        let Some(partial) = self.partial.take() else {
            return Some(chunk);
        };

        let combined = partial.len() + chunk.len();

        // A command line is never this long. The peer is not sending CRLF.
        if self.pending.is_none() && partial.len() > MAX_PARTIAL_LINE && combined > MAX_BUFFERED_LINE
        {
            warn!(
                partial = partial.len(),
                combined = combined,
                "Partial data too big, resetting"
            );
            self.lookup_offset = 0;
            return None;
        }

        trace!(
            partial = partial.len(),
            combined = combined,
            pending = self.pending.is_some(),
            "Joining partial data"
        );

        let mut buf = BytesMut::with_capacity(combined);
        buf.extend_from_slice(&partial);
        buf.extend_from_slice(&chunk);
        Some(buf.freeze())
    }

    /// Extracts one command line. Returns whatever data is left to process.
    fn parse_cmd<H: ParserHandler + ?Sized>(&mut self, data: Bytes, handler: &mut H) -> Option<Bytes> {
        debug_assert!(self.pending.is_none());

        let start = self.lookup_offset.min(data.len());
        let Some(pos) = find_crlf(&data[start..]).map(|pos| pos + start) else {
            trace!(length = data.len(), "No line break, storing partial data");
            // The chunk may end on `\r`, so resume one byte back next time.
            self.lookup_offset = data.len().saturating_sub(1);
            self.partial = Some(data);
            return None;
        };

        self.lookup_offset = 0;

        let tokens: Vec<String> = String::from_utf8_lossy(&data[..pos])
            .split(' ')
            .map(str::to_owned)
            .collect();
        let rest = data.slice(pos + CRLF.len()..);

        debug!(?tokens, "Got command");

        if tokens[0].is_empty() {
            handler.malformed_command(&tokens);
        } else {
            match handler.process_cmd(&tokens) {
                Disposition::Handled => {}
                Disposition::ExpectPayload(length) => self.initiate_pending(tokens, length),
                Disposition::Unknown => {
                    handler.unknown_command(&tokens);
                    return None;
                }
            }
        }

        (!rest.is_empty()).then_some(rest)
    }

    /// Copies data into the pending payload. Returns whatever data is left.
    fn copy_pending<H: ParserHandler + ?Sized>(&mut self, data: Bytes, handler: &mut H) -> Option<Bytes> {
        let pending = self.pending.as_mut()?;

        let consumed = pending.remaining().min(data.len());
        pending.data.extend_from_slice(&data[..consumed]);

        if !pending.is_filled() {
            return None;
        }

        match data.len() - consumed {
            0 => None,
            1 => {
                // Half of the CRLF. Keep it for the next chunk.
                self.partial = Some(data.slice(consumed..));
                None
            }
            remaining => {
                let pending = self.pending.take()?;
                if &data[consumed..consumed + CRLF.len()] != CRLF {
                    handler.malformed_data_stream(&pending.command, remaining);
                    return None;
                }
                handler.receive_result(pending.into_payload());
                let rest = data.slice(consumed + CRLF.len()..);
                (!rest.is_empty()).then_some(rest)
            }
        }
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|window| window == CRLF)
}
