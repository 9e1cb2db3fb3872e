//! Socket transport
//!
//! Opens plain TCP or TLS streams to a server and, when a connect attempt
//! is abandoned, optionally keeps watching the dangling socket so the
//! eventual OS-level outcome shows up in the logs.

use crate::config::{defaults, TlsConfig};
use crate::error::{Error, Result};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Any byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Splits `host:port`. A missing port means the memcached default.
///
/// IPv6 literals must be bracketed: `[::1]:11211`.
pub fn parse_server(server: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidAddress(server.to_string());

    let (host, port) = if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match server.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (server, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => defaults::PORT,
    };

    Ok((host.to_string(), port))
}

/// Connects to `host:port`, wrapping the socket in TLS when configured.
pub async fn open(
    host: String,
    port: u16,
    tls: Option<TlsConfig>,
    no_delay: bool,
) -> io::Result<BoxStream> {
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    if no_delay {
        stream.set_nodelay(true)?;
    }

    let Some(tls) = tls else {
        return Ok(Box::new(stream));
    };

    let name = tls.server_name.unwrap_or(host);
    let name = ServerName::try_from(name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let stream = TlsConnector::from(tls.client_config)
        .connect(name, stream)
        .await?;

    Ok(Box::new(stream))
}

/// Waits out an abandoned connect attempt, logging how it ended.
pub async fn wait_dangling(
    mut attempt: JoinHandle<io::Result<BoxStream>>,
    server: String,
    limit: Duration,
) {
    let started = Instant::now();
    info!(event = "dangle-wait", server = %server, "Keeping dangling socket");

    match timeout(limit, &mut attempt).await {
        Ok(Ok(Ok(_stream))) => {
            info!(
                event = "dangle-wait",
                server = %server,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Dangling socket connected late, closing it"
            );
        }
        Ok(Ok(Err(e))) => {
            info!(
                event = "dangle-wait",
                server = %server,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Dangling socket failed"
            );
        }
        Ok(Err(e)) => {
            debug!(event = "dangle-wait", server = %server, error = %e, "Dangling connect task ended");
        }
        Err(_) => {
            attempt.abort();
            info!(
                event = "dangle-wait",
                server = %server,
                "Dangling socket wait timed out, destroying it"
            );
        }
    }
}
