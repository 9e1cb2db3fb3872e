//! Client Configuration
//!
//! Everything that shapes how the client connects, routes and times out
//! lives here. Values not set explicitly fall back to the constants in
//! [`defaults`].
//!
//! ## Server Lists
//!
//! A server set can be given as:
//!
//! - a single address string: `"localhost:11211"`
//! - a single address with a pool size
//! - a list of entries, each with its own pool size
//!
//! ## Example
//!
//! ```ignore
//! use memcache_client::config::{ClientConfig, ServerConfig, Routing};
//! use std::time::Duration;
//!
//! let config = ClientConfig::new(ServerConfig::list(["10.0.0.1:11211", "10.0.0.2:11211"]))
//!     .with_routing(Routing::ConsistentHash)
//!     .with_cmd_timeout(Duration::from_millis(500));
//! ```

use crate::codec::Compressor;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls;

/// Default values for every tunable.
pub mod defaults {
    use std::time::Duration;

    /// Connections per server
    pub const MAX_CONNECTIONS: usize = 1;

    /// Maximum age of the oldest queued command
    pub const CMD_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Suggested connect timeout. Only applied when configured.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

    /// How long an exiled server stays out of rotation
    pub const FAILED_SERVER_OUT_TIME: Duration = Duration::from_secs(60);

    /// Minimum time between two retry sweeps
    pub const RETRY_FAILED_SERVER_INTERVAL: Duration = Duration::from_secs(10);

    /// How long a timed-out socket may dangle before being destroyed
    pub const DANGLE_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    /// Never exile the last active server
    pub const KEEP_LAST_SERVER: bool = true;

    /// Item lifetime in seconds
    pub const LIFETIME: u32 = 60;

    /// The memcached default port
    pub const PORT: u16 = 11211;

    /// Largest value block accepted in a reply
    pub const MAX_VALUE_LEN: usize = 1024 * 1024;
}

/// One backend address and the size of its connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub server: String,
    pub max_connections: usize,
}

impl ServerEntry {
    pub fn new(server: impl Into<String>, max_connections: usize) -> Self {
        Self {
            server: server.into(),
            max_connections,
        }
    }
}

impl From<&str> for ServerEntry {
    fn from(server: &str) -> Self {
        Self::new(server, defaults::MAX_CONNECTIONS)
    }
}

/// Exile and retry timing for failed servers.
#[derive(Debug, Clone)]
pub struct ExileConfig {
    /// Minimum time between retry sweeps (default: 10s)
    pub retry_failed_server_interval: Duration,

    /// Time a server stays exiled before it may be retried (default: 60s)
    pub failed_server_out_time: Duration,

    /// Keep routing to the last active server instead of exiling it
    pub keep_last_server: bool,
}

impl Default for ExileConfig {
    fn default() -> Self {
        Self {
            retry_failed_server_interval: defaults::RETRY_FAILED_SERVER_INTERVAL,
            failed_server_out_time: defaults::FAILED_SERVER_OUT_TIME,
            keep_last_server: defaults::KEEP_LAST_SERVER,
        }
    }
}

/// The backend servers and how failures among them are handled.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub servers: Vec<ServerEntry>,
    pub exile: ExileConfig,
}

impl ServerConfig {
    /// A single server with the default pool size.
    pub fn single(server: impl Into<String>) -> Self {
        Self::with_max_connections(server, defaults::MAX_CONNECTIONS)
    }

    /// A single server with a pool of `max_connections`.
    pub fn with_max_connections(server: impl Into<String>, max_connections: usize) -> Self {
        Self::entries(vec![ServerEntry::new(server, max_connections)])
    }

    /// Several servers with the default pool size.
    pub fn list<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::entries(
            servers
                .into_iter()
                .map(|s| ServerEntry::new(s, defaults::MAX_CONNECTIONS))
                .collect(),
        )
    }

    /// Several servers, each with its own pool size.
    pub fn entries(servers: Vec<ServerEntry>) -> Self {
        Self {
            servers,
            exile: ExileConfig::default(),
        }
    }

    pub fn with_exile(mut self, exile: ExileConfig) -> Self {
        self.exile = exile;
        self
    }
}

impl From<&str> for ServerConfig {
    fn from(server: &str) -> Self {
        Self::single(server)
    }
}

/// How a command is mapped onto a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Routing {
    /// Any active server, picked at random
    #[default]
    Redundant,
    /// The server owning the key on a hash ring
    ConsistentHash,
}

/// Encrypted transport settings.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
    /// Name to verify. Defaults to the host part of the address.
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            client_config,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Configuration for [`MemcacheClient`](crate::MemcacheClient).
#[derive(Clone)]
pub struct ClientConfig {
    pub servers: ServerConfig,
    pub routing: Routing,
    /// Maximum age of the oldest queued command on a connection
    pub cmd_timeout: Duration,
    /// Applied only when set
    pub connect_timeout: Option<Duration>,
    pub tls: Option<TlsConfig>,
    /// Keep a socket whose connect timed out, to log the OS-level outcome
    pub keep_dangle_socket: bool,
    pub dangle_socket_wait_timeout: Duration,
    /// Default item lifetime in seconds
    pub lifetime: u32,
    /// Treat `NOT_STORED` from `set` as success
    pub ignore_not_stored: bool,
    pub no_delay: bool,
    /// Largest `VALUE` block a reply may announce. Larger ones end the connection.
    pub max_value_len: usize,
    pub compressor: Option<Arc<dyn Compressor>>,
}

impl ClientConfig {
    pub fn new(servers: impl Into<ServerConfig>) -> Self {
        Self {
            servers: servers.into(),
            routing: Routing::default(),
            cmd_timeout: defaults::CMD_TIMEOUT,
            connect_timeout: None,
            tls: None,
            keep_dangle_socket: false,
            dangle_socket_wait_timeout: defaults::DANGLE_SOCKET_WAIT_TIMEOUT,
            lifetime: defaults::LIFETIME,
            ignore_not_stored: false,
            no_delay: false,
            max_value_len: defaults::MAX_VALUE_LEN,
            compressor: None,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Applies [`defaults::CONNECT_TIMEOUT`].
    pub fn with_default_connect_timeout(self) -> Self {
        self.with_connect_timeout(defaults::CONNECT_TIMEOUT)
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_keep_dangle_socket(mut self, keep: bool, wait: Duration) -> Self {
        self.keep_dangle_socket = keep;
        self.dangle_socket_wait_timeout = wait;
        self
    }

    pub fn with_lifetime(mut self, seconds: u32) -> Self {
        self.lifetime = seconds;
        self
    }

    pub fn with_ignore_not_stored(mut self, ignore: bool) -> Self {
        self.ignore_not_stored = ignore;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_max_value_len(mut self, bytes: usize) -> Self {
        self.max_value_len = bytes;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_exile(mut self, exile: ExileConfig) -> Self {
        self.servers.exile = exile;
        self
    }

    /// Checks the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.servers.servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }
        for entry in &self.servers.servers {
            if entry.max_connections == 0 {
                return Err(Error::Config(format!(
                    "max_connections for {} must be at least 1",
                    entry.server
                )));
            }
        }
        if self.cmd_timeout.is_zero() {
            return Err(Error::Config("cmd_timeout must be positive".into()));
        }
        if self.max_value_len == 0 {
            return Err(Error::Config("max_value_len must be positive".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("servers", &self.servers)
            .field("routing", &self.routing)
            .field("cmd_timeout", &self.cmd_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("tls", &self.tls)
            .field("keep_dangle_socket", &self.keep_dangle_socket)
            .field("dangle_socket_wait_timeout", &self.dangle_socket_wait_timeout)
            .field("lifetime", &self.lifetime)
            .field("ignore_not_stored", &self.ignore_not_stored)
            .field("no_delay", &self.no_delay)
            .field("max_value_len", &self.max_value_len)
            .field("compressor", &self.compressor.is_some())
            .finish()
    }
}
