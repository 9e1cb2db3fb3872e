//! Node: a bounded pool of connections to one server
//!
//! Work goes to an idle ready connection if there is one. Otherwise a new
//! connection is opened while the pool is under its cap. Once the pool is
//! full, the connection with the shortest queue is used, waiting for it to
//! finish connecting if needed.

use crate::client::ClientContext;
use crate::connection::{Connection, ConnectionObserver, Status};
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::debug;

/// How a connection was chosen.
enum Pick {
    Ready(Arc<Connection>),
    Opened(Arc<Connection>, JoinHandle<Result<()>>),
    Wait(Arc<Connection>),
}

#[derive(Debug)]
pub struct Node {
    server: String,
    max_connections: usize,
    context: Arc<ClientContext>,
    connections: Mutex<Vec<Arc<Connection>>>,
    me: Weak<Node>,
}

impl Node {
    pub fn new(
        server: impl Into<String>,
        max_connections: usize,
        context: Arc<ClientContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            server: server.into(),
            max_connections,
            context,
            connections: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of open or opening connections.
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// A snapshot of the pool.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `action` on a connection from the pool.
    pub async fn do_cmd<F, Fut, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.acquire().await?;
        action(conn).await
    }

    /// Picks or opens a ready connection.
    pub async fn acquire(&self) -> Result<Arc<Connection>> {
        let pick = {
            let mut connections = self.lock();
            // A connection can be shut down before its end_connection lands.
            connections.retain(|conn| conn.status() != Status::Shutdown);

            if let Some(idle) = connections
                .iter()
                .find(|conn| conn.is_ready() && conn.pending() == 0)
            {
                Pick::Ready(Arc::clone(idle))
            } else if connections.len() < self.max_connections {
                let owner: Weak<dyn ConnectionObserver> = self.me.clone();
                let conn = Connection::new(
                    self.context.next_socket_id(),
                    self.server.clone(),
                    Arc::clone(&self.context),
                    Some(owner),
                );
                connections.push(Arc::clone(&conn));
                debug!(
                    server = %self.server,
                    conn = conn.id(),
                    count = connections.len(),
                    "Opening connection"
                );
                // connect() moves it to CONNECTING before the pool is unlocked.
                // Its own task, so a dropped caller cannot strand waiters.
                let connecting = tokio::spawn(conn.connect());
                Pick::Opened(conn, connecting)
            } else {
                match connections.iter().min_by_key(|conn| conn.pending()) {
                    Some(conn) if conn.is_ready() => Pick::Ready(Arc::clone(conn)),
                    Some(conn) => Pick::Wait(Arc::clone(conn)),
                    None => {
                        return Err(Error::Config(format!(
                            "no connections allowed for {}",
                            self.server
                        )))
                    }
                }
            }
        };

        match pick {
            Pick::Ready(conn) => Ok(conn),
            Pick::Opened(conn, connecting) => {
                connecting.await.map_err(|e| Error::Connect {
                    server: self.server.clone(),
                    reason: e.to_string(),
                })??;
                Ok(conn)
            }
            Pick::Wait(conn) => {
                conn.wait_ready().await?;
                Ok(conn)
            }
        }
    }

    /// Shuts down every connection.
    pub fn shutdown(&self) {
        let connections = std::mem::take(&mut *self.lock());
        for conn in connections {
            conn.shutdown();
        }
    }
}

impl ConnectionObserver for Node {
    fn end_connection(&self, id: u64) {
        let mut connections = self.lock();
        connections.retain(|conn| conn.id() != id);
        debug!(server = %self.server, conn = id, count = connections.len(), "Connection removed");
    }
}
