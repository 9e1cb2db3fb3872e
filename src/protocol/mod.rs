//! Memcached ASCII Protocol Implementation
//!
//! ## Overview
//!
//! The memcached text protocol is line oriented. Commands and replies are
//! space separated tokens terminated by CRLF, and some lines announce a
//! binary data block of a declared length.
//!
//! ## Modules
//!
//! - `types`: Reply classification and outgoing message builders
//! - `parser`: Incremental parser for incoming data
//!
//! ## Example
//!
//! ```ignore
//! use memcache_client::protocol::{StoreCommand, StoreRequest};
//!
//! let request = StoreRequest {
//!     command: StoreCommand::Set,
//!     key: "foo",
//!     flags: 0,
//!     exptime: 60,
//!     data: b"bar",
//!     cas_unique: None,
//!     noreply: false,
//! };
//! assert_eq!(&request.serialize()[..], b"set foo 0 60 3\r\nbar\r\n");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{Disposition, MemcacheParser, ParserHandler, Payload};
pub use types::{
    command_line, retrieval_message, OwnReply, ReplyAction, RetrieveCommand, StoreCommand,
    StoreRequest, CRLF,
};
