//! Memcache Client
//!
//! The public command API. Each method builds the wire message, hands it
//! to the server pool to run on a connection and turns the reply into a
//! typed result.
//!
//! ## Example
//!
//! ```ignore
//! use memcache_client::{ClientConfig, MemcacheClient, StoreOptions};
//!
//! let client = MemcacheClient::new(ClientConfig::new("localhost:11211"))?;
//! client.set("foo", "bar", StoreOptions::new()).await?;
//! let item = client.get("foo").await?;
//! assert_eq!(item.unwrap().value.as_str(), Some("bar"));
//! ```
//!
//! ## Replies
//!
//! Storage, delete and touch resolve to the reply tokens (`["STORED"]`),
//! or `None` when sent with `noreply` or when an ignored `NOT_STORED` was
//! received. Error replies surface as [`Error::Reply`] whose message is the
//! raw reply line.

pub mod context;
pub mod options;

pub use context::ClientContext;
pub use options::{CommandOptions, StoreOptions};

use crate::codec::Value;
use crate::config::{ClientConfig, Routing};
use crate::connection::{Reply, Results, RetrievalItem};
use crate::error::{Error, Result};
use crate::protocol::{command_line, retrieval_message, RetrieveCommand, StoreCommand, StoreRequest};
use crate::servers::ServerPool;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Longest key the server accepts, in bytes
pub const MAX_KEY_LENGTH: usize = 250;

/// A memcached client.
#[derive(Debug)]
pub struct MemcacheClient {
    context: Arc<ClientContext>,
    servers: ServerPool,
    lifetime: u32,
    ignore_not_stored: bool,
}

impl MemcacheClient {
    /// Creates a client. No connection is opened until the first command.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let context = Arc::new(ClientContext::new(&config));
        let servers = ServerPool::new(
            config.servers.servers.clone(),
            config.servers.exile.clone(),
            config.routing,
            Arc::clone(&context),
        );

        debug!(?config, "Client created");

        Ok(Self {
            context,
            servers,
            lifetime: config.lifetime,
            ignore_not_stored: config.ignore_not_stored,
        })
    }

    pub fn servers(&self) -> &ServerPool {
        &self.servers
    }

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        let ignore = options.ignore_not_stored.unwrap_or(self.ignore_not_stored);
        self.store_with(StoreCommand::Set, key, value.into(), &options, ignore)
            .await
    }

    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        self.store(StoreCommand::Add, key, value, options).await
    }

    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        self.store(StoreCommand::Replace, key, value, options).await
    }

    pub async fn append(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        self.store(StoreCommand::Append, key, value, options).await
    }

    pub async fn prepend(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        self.store(StoreCommand::Prepend, key, value, options).await
    }

    /// Stores only if the item is unchanged since `options.cas_unique` was read.
    pub async fn cas(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        self.store(StoreCommand::Cas, key, value, options).await
    }

    /// Runs any storage command.
    pub async fn store(
        &self,
        command: StoreCommand,
        key: &str,
        value: impl Into<Value>,
        options: StoreOptions,
    ) -> Result<Option<Vec<String>>> {
        let ignore = options.ignore_not_stored.unwrap_or(false);
        self.store_with(command, key, value.into(), &options, ignore)
            .await
    }

    async fn store_with(
        &self,
        command: StoreCommand,
        key: &str,
        value: Value,
        options: &StoreOptions,
        ignore_not_stored: bool,
    ) -> Result<Option<Vec<String>>> {
        validate_key(key)?;

        let cas_unique = match (command, options.cas_unique) {
            (StoreCommand::Cas, None) => {
                return Err(Error::InvalidArgument("cas requires cas_unique".into()))
            }
            (StoreCommand::Cas, cas) => cas,
            _ => None,
        };

        let packed = self.context.packer.pack(&value, options.compress)?;
        let message = StoreRequest {
            command,
            key,
            flags: packed.flags,
            exptime: options.lifetime.unwrap_or(self.lifetime),
            data: &packed.data,
            cas_unique,
            noreply: options.noreply,
        }
        .serialize();

        match self.send_message(Some(key), message, options.noreply).await {
            Ok(reply) => reply.map(Reply::into_tokens).transpose(),
            Err(e) if ignore_not_stored && e.is_reply("NOT_STORED") => {
                debug!(cmd = %command, key = key, "Ignoring NOT_STORED");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetches one item.
    pub async fn get(&self, key: &str) -> Result<Option<RetrievalItem>> {
        self.retrieve_one(RetrieveCommand::Get, key).await
    }

    /// Fetches one item along with its CAS unique.
    pub async fn gets(&self, key: &str) -> Result<Option<RetrievalItem>> {
        self.retrieve_one(RetrieveCommand::Gets, key).await
    }

    pub async fn get_multi<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<String, RetrievalItem>> {
        self.retrieve_multi(RetrieveCommand::Get, keys).await
    }

    pub async fn gets_multi<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<String, RetrievalItem>> {
        self.retrieve_multi(RetrieveCommand::Gets, keys).await
    }

    async fn retrieve_one(
        &self,
        command: RetrieveCommand,
        key: &str,
    ) -> Result<Option<RetrievalItem>> {
        validate_key(key)?;
        let mut results = self.retrieve(command, &[key], key).await?;
        Ok(results.values.remove(key))
    }

    async fn retrieve_multi<K: AsRef<str>>(
        &self,
        command: RetrieveCommand,
        keys: &[K],
    ) -> Result<HashMap<String, RetrievalItem>> {
        let mut groups: HashMap<String, Vec<&str>> = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            validate_key(key)?;
            // Single request unless keys live on different servers
            let server = match self.servers.routing() {
                Routing::ConsistentHash => self.servers.node_for(Some(key))?.server().to_string(),
                Routing::Redundant => String::new(),
            };
            groups.entry(server).or_default().push(key);
        }

        let mut values = HashMap::new();
        for group in groups.into_values() {
            let results = self.retrieve(command, &group, group[0]).await?;
            values.extend(results.values);
        }
        Ok(values)
    }

    async fn retrieve(
        &self,
        command: RetrieveCommand,
        keys: &[&str],
        route_key: &str,
    ) -> Result<Results> {
        let message = retrieval_message(command, keys);
        match self.send_message(Some(route_key), message, false).await? {
            Some(reply) => reply.into_results(),
            None => Err(Error::UnexpectedReply("no reply".into())),
        }
    }

    pub async fn delete(&self, key: &str, options: CommandOptions) -> Result<Option<Vec<String>>> {
        validate_key(key)?;
        let message = command_line(&format!("delete {}", key), options.noreply);
        self.send_message(Some(key), message, options.noreply)
            .await?
            .map(Reply::into_tokens)
            .transpose()
    }

    /// Increments a counter, returning the new value.
    pub async fn incr(&self, key: &str, delta: u64, options: CommandOptions) -> Result<Option<u64>> {
        self.arith("incr", key, delta, options).await
    }

    /// Decrements a counter, returning the new value. Stops at zero.
    pub async fn decr(&self, key: &str, delta: u64, options: CommandOptions) -> Result<Option<u64>> {
        self.arith("decr", key, delta, options).await
    }

    async fn arith(
        &self,
        command: &str,
        key: &str,
        delta: u64,
        options: CommandOptions,
    ) -> Result<Option<u64>> {
        validate_key(key)?;
        let message = command_line(&format!("{} {} {}", command, key, delta), options.noreply);
        let Some(reply) = self.send_message(Some(key), message, options.noreply).await? else {
            return Ok(None);
        };

        let tokens = reply.into_tokens()?;
        tokens[0]
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::UnexpectedReply(tokens.join(" ")))
    }

    /// Updates an item's lifetime.
    pub async fn touch(
        &self,
        key: &str,
        lifetime: u32,
        options: CommandOptions,
    ) -> Result<Option<Vec<String>>> {
        validate_key(key)?;
        let message = command_line(&format!("touch {} {}", key, lifetime), options.noreply);
        self.send_message(Some(key), message, options.noreply)
            .await?
            .map(Reply::into_tokens)
            .transpose()
    }

    /// Returns the version string of one server.
    pub async fn version(&self) -> Result<String> {
        let reply = self.send_message(None, command_line("version", false), false).await?;
        let tokens = reply
            .ok_or_else(|| Error::UnexpectedReply("no reply".into()))?
            .into_tokens()?;
        Ok(tokens.get(1..).map(|rest| rest.join(" ")).unwrap_or_default())
    }

    /// Returns the general statistics of one server.
    pub async fn stats(&self) -> Result<HashMap<String, String>> {
        let reply = self.send_message(None, command_line("stats", false), false).await?;
        let mut results = reply
            .ok_or_else(|| Error::UnexpectedReply("no reply".into()))?
            .into_results()?;

        let stats = results
            .lines
            .remove("STAT")
            .unwrap_or_default()
            .into_iter()
            .filter_map(|mut line| {
                if line.is_empty() {
                    return None;
                }
                let name = line.remove(0);
                Some((name, line.join(" ")))
            })
            .collect();
        Ok(stats)
    }

    /// Writes raw bytes and parses whatever comes back.
    ///
    /// `data` must be complete protocol messages. With `noreply` the
    /// message must carry the `noreply` flag itself.
    pub async fn send(
        &self,
        key: Option<&str>,
        data: impl Into<Bytes>,
        options: CommandOptions,
    ) -> Result<Option<Reply>> {
        self.send_message(key, data.into(), options.noreply).await
    }

    /// Sends a single command line, such as `flush_all` or `verbosity 1`.
    pub async fn cmd(&self, line: &str, options: CommandOptions) -> Result<Option<Reply>> {
        self.send_message(None, command_line(line, options.noreply), options.noreply)
            .await
    }

    async fn send_message(
        &self,
        key: Option<&str>,
        data: Bytes,
        noreply: bool,
    ) -> Result<Option<Reply>> {
        self.servers
            .do_cmd(key, |conn| {
                let data = data.clone();
                async move { conn.execute(data, noreply).await }
            })
            .await
    }

    /// Closes every connection. Queued commands fail.
    pub fn shutdown(&self) {
        self.servers.shutdown();
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "key length must be 1..={} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidArgument(format!("invalid key {:?}", key)));
    }
    Ok(())
}
