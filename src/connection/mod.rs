//! Connection Module
//!
//! One [`Connection`] per socket. Commands written to a connection are
//! pipelined and matched to replies in FIFO order.
//!
//! ## Architecture
//!
//! ```text
//!            Node (pool of connections to one server)
//!                          │
//!                          │ execute(bytes)
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Connection                            │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Writer task │    │ Reader task │───>│ Reply       │      │
//! │  │ (BufWriter) │    │ (parser)    │    │ dispatch    │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                                               ▼             │
//! │  ┌─────────────┐                      ┌─────────────┐       │
//! │  │ Supervisor  │ ── head too old ──>  │ FIFO queue  │       │
//! │  └─────────────┘                      └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `handler`: The connection, its queue and reply dispatch
//! - `supervisor`: Command timeout checks
//! - `transport`: Plain and TLS sockets

pub mod handler;
pub mod supervisor;
pub mod transport;

pub use handler::{Connection, ConnectionObserver, Reply, Results, RetrievalItem, Status};
pub use supervisor::COMMAND_TIMEOUT;
pub use transport::{parse_server, AsyncStream, BoxStream};
