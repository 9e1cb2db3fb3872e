//! Servers Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ServerPool                           │
//! │        active list ── random pick / hash ring ──┐           │
//! │        exiled list (with timestamps)            │           │
//! │                                                 ▼           │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐              │
//! │  │  Node A   │   │  Node B   │   │  Node C   │   ...        │
//! │  │ conns ≤ N │   │ conns ≤ N │   │ conns ≤ N │              │
//! │  └───────────┘   └───────────┘   └───────────┘              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! - `node`: Bounded connection pool for one server
//! - `pool`: Routing, exile and retry across servers
//! - `ring`: Consistent hash ring

pub mod node;
pub mod pool;
pub mod ring;

pub use node::Node;
pub use pool::{ExiledServer, ServerPool};
pub use ring::HashRing;
