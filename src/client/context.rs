//! Shared client context
//!
//! The parts of the configuration every node and connection needs, plus
//! the value packer and the socket id counter.

use crate::codec::ValuePacker;
use crate::config::{ClientConfig, TlsConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct ClientContext {
    pub cmd_timeout: Duration,
    pub connect_timeout: Option<Duration>,
    pub tls: Option<TlsConfig>,
    pub keep_dangle_socket: bool,
    pub dangle_socket_wait_timeout: Duration,
    pub no_delay: bool,
    pub max_value_len: usize,
    pub packer: ValuePacker,
    next_socket_id: AtomicU64,
}

impl ClientContext {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            cmd_timeout: config.cmd_timeout,
            connect_timeout: config.connect_timeout,
            tls: config.tls.clone(),
            keep_dangle_socket: config.keep_dangle_socket,
            dangle_socket_wait_timeout: config.dangle_socket_wait_timeout,
            no_delay: config.no_delay,
            max_value_len: config.max_value_len,
            packer: ValuePacker::new(config.compressor.clone()),
            next_socket_id: AtomicU64::new(1),
        }
    }

    /// Hands out the next connection id.
    pub fn next_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }
}
