//! Memcached ASCII Protocol Types
//!
//! This module defines the reply keyword classification used by the
//! client connection and the builders for outgoing wire messages.
//!
//! ## Protocol Format
//!
//! Every line is terminated with CRLF (`\r\n`). A line may announce a
//! binary block of a declared length, which is itself followed by CRLF.
//!
//! ## Examples
//!
//! Storage: `set foo 0 60 3\r\nbar\r\n`
//! Retrieval: `get foo bar\r\n`
//! Value reply: `VALUE foo 0 3\r\nbar\r\nEND\r\n`
//! Status reply: `STORED\r\n`
//! Counter reply: `42\r\n`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used by the memcached protocol
pub const CRLF: &[u8] = b"\r\n";

/// How the connection should act on a reply line, keyed by its first token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    /// Pop the oldest command and resolve it with the reply tokens.
    Ok,
    /// Pop the oldest command and reject it with the reply tokens.
    Error,
    /// Append the line into the oldest command's results without popping.
    Result,
    /// A single-line reply that resolves like `Ok` (`VERSION`).
    SingleResult,
    /// Replies the connection handles itself.
    Own(OwnReply),
    /// Not a known keyword. May still be a bare incr/decr counter.
    Unrecognized,
}

/// Replies with connection-specific handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnReply {
    /// `VALUE <key> <flags> <bytes> [<cas unique>]`, followed by a data block.
    Value,
    /// Terminates a retrieval or stats reply.
    End,
}

impl ReplyAction {
    /// Classifies a reply keyword.
    pub fn classify(keyword: &str) -> Self {
        match keyword {
            "OK" | "STORED" | "DELETED" | "TOUCHED" => ReplyAction::Ok,
            "VALUE" => ReplyAction::Own(OwnReply::Value),
            "END" => ReplyAction::Own(OwnReply::End),
            "STAT" => ReplyAction::Result,
            "VERSION" => ReplyAction::SingleResult,
            "NOT_STORED" | "EXISTS" | "NOT_FOUND" => ReplyAction::Error,
            "ERROR" | "CLIENT_ERROR" | "SERVER_ERROR" => ReplyAction::Error,
            // slabs reassign / lru crawler replies
            "BUSY" | "BADCLASS" | "NOSPARE" | "NOTFULL" | "UNSAFE" | "SAME" => ReplyAction::Error,
            _ => ReplyAction::Unrecognized,
        }
    }

    /// True for actions that inspect the oldest command without removing it.
    pub fn peeks(&self) -> bool {
        matches!(self, ReplyAction::Result | ReplyAction::Own(OwnReply::Value))
    }
}

/// Returns true if the token is a bare (optionally signed) integer.
pub fn is_counter_value(token: &str) -> bool {
    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// The storage commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreCommand::Set => "set",
            StoreCommand::Add => "add",
            StoreCommand::Replace => "replace",
            StoreCommand::Append => "append",
            StoreCommand::Prepend => "prepend",
            StoreCommand::Cas => "cas",
        }
    }
}

impl fmt::Display for StoreCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The retrieval commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveCommand {
    Get,
    Gets,
}

impl RetrieveCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieveCommand::Get => "get",
            RetrieveCommand::Gets => "gets",
        }
    }
}

/// A storage request ready to be serialized.
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    pub command: StoreCommand,
    pub key: &'a str,
    pub flags: u32,
    pub exptime: u32,
    pub data: &'a [u8],
    pub cas_unique: Option<u64>,
    pub noreply: bool,
}

impl StoreRequest<'_> {
    /// Serializes the request:
    /// `<cmd> <key> <flags> <exptime> <bytes>[ <cas unique>][ noreply]\r\n<data>\r\n`
    pub fn serialize(&self) -> Bytes {
        let mut header = format!(
            "{} {} {} {} {}",
            self.command,
            self.key,
            self.flags,
            self.exptime,
            self.data.len()
        );
        if let Some(cas) = self.cas_unique {
            header.push(' ');
            header.push_str(&cas.to_string());
        }
        if self.noreply {
            header.push_str(" noreply");
        }

        let mut buf = BytesMut::with_capacity(header.len() + self.data.len() + 4);
        buf.put_slice(header.as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(self.data);
        buf.put_slice(CRLF);
        buf.freeze()
    }
}

/// Serializes `get|gets <key...>\r\n`.
pub fn retrieval_message<K: AsRef<str>>(command: RetrieveCommand, keys: &[K]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(command.as_str().as_bytes());
    for key in keys {
        buf.put_u8(b' ');
        buf.put_slice(key.as_ref().as_bytes());
    }
    buf.put_slice(CRLF);
    buf.freeze()
}

/// Serializes a single command line, appending ` noreply` when asked.
pub fn command_line(line: &str, noreply: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(line.len() + 10);
    buf.put_slice(line.as_bytes());
    if noreply {
        buf.put_slice(b" noreply");
    }
    buf.put_slice(CRLF);
    buf.freeze()
}
