//! Server Set
//!
//! Routes commands to one of several backend servers, each served by its
//! own [`Node`]. With [`Routing::Redundant`] any active server will do and
//! one is picked at random. With [`Routing::ConsistentHash`] the key picks
//! the server on a hash ring.
//!
//! ## Exile and Retry
//!
//! ```text
//!             connect failure
//!   active ─────────────────────> exiled (stamped with time)
//!     ▲                               │
//!     └───────────────────────────────┘
//!      retry sweep: exiled for at least failed_server_out_time,
//!      at most one sweep per retry_failed_server_interval
//! ```
//!
//! Only failures to connect exile a server. An error from a server that
//! was reachable is returned to the caller unchanged. The sweep runs on
//! demand at the start of each command, never on a timer.

use crate::client::ClientContext;
use crate::config::{ExileConfig, Routing, ServerEntry};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::servers::node::Node;
use crate::servers::ring::HashRing;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

/// A server taken out of rotation.
#[derive(Debug, Clone)]
pub struct ExiledServer {
    pub entry: ServerEntry,
    pub since: Instant,
}

#[derive(Debug)]
struct PoolState {
    active: Vec<ServerEntry>,
    exiled: Vec<ExiledServer>,
    last_retry: Option<Instant>,
    ring: Option<HashRing>,
}

impl PoolState {
    fn rebuild_ring(&mut self, routing: Routing) {
        if routing == Routing::ConsistentHash {
            let servers: Vec<&str> = self.active.iter().map(|e| e.server.as_str()).collect();
            self.ring = HashRing::build(&servers);
        }
    }
}

/// The set of servers a client talks to.
#[derive(Debug)]
pub struct ServerPool {
    routing: Routing,
    exile: ExileConfig,
    nodes: HashMap<String, Arc<Node>>,
    state: Mutex<PoolState>,
}

impl ServerPool {
    pub fn new(
        servers: Vec<ServerEntry>,
        exile: ExileConfig,
        routing: Routing,
        context: Arc<ClientContext>,
    ) -> Self {
        let mut nodes = HashMap::new();
        let mut active = Vec::new();
        for entry in servers {
            if nodes.contains_key(&entry.server) {
                warn!(server = %entry.server, "Duplicate server ignored");
                continue;
            }
            let node = Node::new(entry.server.clone(), entry.max_connections, Arc::clone(&context));
            nodes.insert(entry.server.clone(), node);
            active.push(entry);
        }

        let mut state = PoolState {
            active,
            exiled: Vec::new(),
            last_retry: None,
            ring: None,
        };
        state.rebuild_ring(routing);

        Self {
            routing,
            exile,
            nodes,
            state: Mutex::new(state),
        }
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `action` on a connection to the server chosen for `key`.
    ///
    /// Servers that cannot be connected to are exiled and the command is
    /// rerouted to the remaining ones.
    pub async fn do_cmd<F, Fut, T>(&self, key: Option<&str>, action: F) -> Result<T>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let node = self.pick(key)?;
            match node.do_cmd(&action).await {
                Err(e) if e.is_connecting() => {
                    if !self.exile_server(node.server(), &e) {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }

    /// Returns the node a command for `key` would go to right now.
    pub fn node_for(&self, key: Option<&str>) -> Result<Arc<Node>> {
        self.pick(key)
    }

    fn pick(&self, key: Option<&str>) -> Result<Arc<Node>> {
        let mut state = self.lock();
        self.retry_failed_servers(&mut state);

        if state.active.is_empty() {
            return Err(Error::NoServersLeft);
        }

        let server = match (key, &state.ring) {
            (Some(key), Some(ring)) => ring.get(key).to_string(),
            _ => {
                let index = rand::thread_rng().gen_range(0..state.active.len());
                state.active[index].server.clone()
            }
        };

        self.nodes
            .get(&server)
            .cloned()
            .ok_or_else(|| Error::InvalidAddress(server))
    }

    /// Moves a server to the exiled list. Returns false if the command
    /// should fail instead of being rerouted.
    fn exile_server(&self, server: &str, error: &Error) -> bool {
        let mut state = self.lock();

        let Some(pos) = state.active.iter().position(|e| e.server == server) else {
            // Already exiled by a concurrent command
            return true;
        };

        if state.active.len() == 1 && self.exile.keep_last_server {
            warn!(server = %server, error = %error, "Last server failed, keeping it");
            return false;
        }

        let entry = state.active.remove(pos);
        state.exiled.push(ExiledServer {
            entry,
            since: Instant::now(),
        });
        state.rebuild_ring(self.routing);

        warn!(
            server = %server,
            error = %error,
            active = state.active.len(),
            exiled = state.exiled.len(),
            "Server exiled"
        );
        true
    }

    fn retry_failed_servers(&self, state: &mut PoolState) {
        if state.exiled.is_empty() {
            return;
        }

        let now = Instant::now();
        if state
            .last_retry
            .is_some_and(|last| now.duration_since(last) < self.exile.retry_failed_server_interval)
        {
            return;
        }
        state.last_retry = Some(now);

        let out_time = self.exile.failed_server_out_time;
        let (readmit, still_out): (Vec<_>, Vec<_>) = std::mem::take(&mut state.exiled)
            .into_iter()
            .partition(|exiled| now.duration_since(exiled.since) >= out_time);
        state.exiled = still_out;

        if readmit.is_empty() {
            return;
        }

        for exiled in readmit {
            info!(server = %exiled.entry.server, "Retrying exiled server");
            state.active.push(exiled.entry);
        }
        state.rebuild_ring(self.routing);
    }

    pub fn active_servers(&self) -> Vec<String> {
        self.lock().active.iter().map(|e| e.server.clone()).collect()
    }

    pub fn exiled_servers(&self) -> Vec<String> {
        self.lock()
            .exiled
            .iter()
            .map(|e| e.entry.server.clone())
            .collect()
    }

    /// Every configured node, exiled or not.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    /// Shuts down every node.
    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}
