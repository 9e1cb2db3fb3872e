//! # memcache-client - A Pipelining Memcached Client
//!
//! An async client for the memcached ASCII protocol. Commands are pipelined
//! over small pools of connections, spread over one or more servers, with
//! servers that cannot be reached taken out of rotation for a while.
//!
//! ## Features
//!
//! - **Incremental Parsing**: Replies are reassembled from arbitrary TCP fragments
//! - **Pipelining**: Many commands in flight per connection, matched in FIFO order
//! - **Connection Pools**: A bounded pool per server, grown on demand
//! - **Redundancy**: Random or consistent-hash routing with exile and retry
//! - **Timeouts**: A stalled connection fails all its commands and is replaced
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           MemcacheClient                                │
//! │   set / add / replace / append / prepend / cas / get / gets / delete    │
//! │   incr / decr / touch / version / stats / send / cmd                    │
//! └───────────────────────────────────┬─────────────────────────────────────┘
//!                                     │ do_cmd(key, action)
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ServerPool (random or hash ring)                    │
//! │           active servers ◄──── retry sweep ────  exiled servers         │
//! └───────────────────────────────────┬─────────────────────────────────────┘
//!                                     │
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Node (one per server)                            │
//! │   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                │
//! │   │ Connection 1 │   │ Connection 2 │   │     ...N     │                │
//! │   │ FIFO queue   │   │ FIFO queue   │   │              │                │
//! │   │ parser       │   │ parser       │   │              │                │
//! │   └──────────────┘   └──────────────┘   └──────────────┘                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use memcache_client::{ClientConfig, MemcacheClient, StoreOptions};
//!
//! #[tokio::main]
//! async fn main() -> memcache_client::Result<()> {
//!     let client = MemcacheClient::new(ClientConfig::new("127.0.0.1:11211"))?;
//!
//!     client.set("greeting", "hello", StoreOptions::new().lifetime(300)).await?;
//!     if let Some(item) = client.get("greeting").await? {
//!         println!("{}", item.value);
//!     }
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Incremental parser, reply classification, message builders
//! - [`codec`]: Value packing and the flags layout
//! - [`connection`]: Pipelined connections and timeout supervision
//! - [`servers`]: Connection pools, routing and exile
//! - [`client`]: The public command API
//! - [`config`]: Configuration and defaults

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod servers;

#[cfg(test)]
mod test_server;

// Re-export commonly used types for convenience
pub use client::{CommandOptions, MemcacheClient, StoreOptions};
pub use codec::{Compressor, Value};
pub use config::{ClientConfig, ExileConfig, Routing, ServerConfig, ServerEntry, TlsConfig};
pub use connection::{Reply, RetrievalItem};
pub use error::{Error, Result};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
