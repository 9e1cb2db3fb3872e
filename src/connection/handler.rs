//! Connection Handler Module
//!
//! A [`Connection`] wraps one socket to one memcached server. Commands are
//! pipelined: every request is written immediately and a context for it is
//! pushed onto a FIFO queue. Replies come back in the same order, so each
//! completed reply belongs to the oldest queued context.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!   INIT ──connect()──> CONNECTING ──connected──> READY
//!     │                     │                       │
//!     │                     │ connect failed        │ socket end / error
//!     │                     │ connect timeout       │ command timeout
//!     │                     ▼                       │ shutdown()
//!     └───────────────> SHUTDOWN <──────────────────┘
//! ```
//!
//! SHUTDOWN is final. Entering it fails every queued command with the
//! shutdown reason, removes the connection from its owner and stops the
//! socket tasks.
//!
//! ## Tasks
//!
//! ```text
//!   execute() ──push ctx + bytes (one critical section)──┐
//!                                                        ▼
//!   ┌──────────────┐   mpsc    ┌──────────────┐      socket
//!   │  FIFO queue  │           │  writer task │ ───────────────> server
//!   └──────▲───────┘           └──────────────┘
//!          │ resolve / peek    ┌──────────────┐
//!          └───────────────────│  reader task │ <─────────────── server
//!                              │  (parser)    │
//!                              └──────────────┘
//!   supervisor task: fails the connection when the head of the queue
//!   has waited longer than the command timeout
//! ```

use crate::client::ClientContext;
use crate::codec::{PackedValue, Value};
use crate::connection::supervisor;
use crate::connection::transport::{self, BoxStream};
use crate::error::{Error, Result};
use crate::protocol::types::is_counter_value;
use crate::protocol::{Disposition, MemcacheParser, OwnReply, ParserHandler, Payload, ReplyAction};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Reserve this much when the read buffer runs low
const READ_RESERVE: usize = 16 * 1024;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Init,
    Connecting,
    Ready,
    Shutdown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Init => "INIT",
            Status::Connecting => "CONNECTING",
            Status::Ready => "READY",
            Status::Shutdown => "SHUTDOWN",
        })
    }
}

/// Notified when a connection shuts down.
pub trait ConnectionObserver: Send + Sync {
    fn end_connection(&self, id: u64);
}

/// One item returned by `get` / `gets`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalItem {
    /// The `VALUE` line tokens
    pub tokens: Vec<String>,
    pub flags: u32,
    /// Present for `gets`
    pub cas_unique: Option<u64>,
    pub value: Value,
}

/// Everything accumulated for one command before its terminating line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    /// Retrieved items by key
    pub values: HashMap<String, RetrievalItem>,
    /// Multi-line replies (`STAT ...`) by keyword, without the keyword
    pub lines: HashMap<String, Vec<Vec<String>>>,
}

/// The reply a command resolved with.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A single reply line, such as `STORED` or `VERSION 1.6.21`
    Tokens(Vec<String>),
    /// An `END`-terminated reply
    Results(Results),
}

impl Reply {
    pub fn into_tokens(self) -> Result<Vec<String>> {
        match self {
            Reply::Tokens(tokens) => Ok(tokens),
            Reply::Results(_) => Err(Error::UnexpectedReply("END".into())),
        }
    }

    pub fn into_results(self) -> Result<Results> {
        match self {
            Reply::Results(results) => Ok(results),
            Reply::Tokens(tokens) => Err(Error::UnexpectedReply(tokens.join(" "))),
        }
    }
}

/// A queued command waiting for its reply.
struct CommandContext {
    queued_at: Instant,
    results: Results,
    error: Option<Error>,
    responder: oneshot::Sender<Result<Reply>>,
}

impl CommandContext {
    fn new(responder: oneshot::Sender<Result<Reply>>) -> Self {
        Self {
            queued_at: Instant::now(),
            results: Results::default(),
            error: None,
            responder,
        }
    }

    fn complete(self, result: Result<Reply>) {
        // The caller may have given up waiting
        let _ = self.responder.send(result);
    }
}

struct Inner {
    status: Status,
    /// Why the connection shut down
    reason: Option<String>,
    /// Shut down before ever becoming ready
    never_connected: bool,
    queue: VecDeque<CommandContext>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    owner: Option<Weak<dyn ConnectionObserver>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    fn pop_and_complete(&mut self, result: Result<Reply>) {
        match self.queue.pop_front() {
            Some(ctx) => ctx.complete(result),
            None => warn!(?result, "Reply with no pending command"),
        }
    }
}

/// A pipelined connection to one memcached server.
pub struct Connection {
    id: u64,
    server: String,
    context: Arc<ClientContext>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<Status>,
}

impl Connection {
    /// Creates a connection in the INIT state.
    pub fn new(
        id: u64,
        server: impl Into<String>,
        context: Arc<ClientContext>,
        owner: Option<Weak<dyn ConnectionObserver>>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(Status::Init);
        Arc::new(Self {
            id,
            server: server.into(),
            context,
            inner: Mutex::new(Inner {
                status: Status::Init,
                reason: None,
                never_connected: false,
                queue: VecDeque::new(),
                writer: None,
                owner,
                tasks: Vec::new(),
            }),
            status_tx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == Status::Ready
    }

    /// Number of commands waiting for a reply.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub(crate) fn cmd_timeout(&self) -> Duration {
        self.context.cmd_timeout
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// How long the oldest queued command has been waiting.
    pub(crate) fn head_age(&self) -> Option<Duration> {
        self.lock().queue.front().map(|ctx| ctx.queued_at.elapsed())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, inner: &mut Inner, status: Status) {
        inner.status = status;
        self.status_tx.send_replace(status);
    }

    /// Starts connecting.
    ///
    /// The state moves to CONNECTING before this returns, so callers can
    /// hand the future to a task and let others wait on [`wait_ready`].
    ///
    /// [`wait_ready`]: Connection::wait_ready
    pub fn connect(self: &Arc<Self>) -> impl Future<Output = Result<()>> + Send + 'static {
        let tls = self.context.tls.clone();
        let no_delay = self.context.no_delay;
        self.connect_with(move |host, port| transport::open(host, port, tls, no_delay))
    }

    /// Like [`connect`](Connection::connect), opening the stream with `open`.
    pub(crate) fn connect_with<O, F>(
        self: &Arc<Self>,
        open: O,
    ) -> impl Future<Output = Result<()>> + Send + 'static
    where
        O: FnOnce(String, u16) -> F + Send + 'static,
        F: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        let target = transport::parse_server(&self.server);
        {
            let mut inner = self.lock();
            if inner.status == Status::Init {
                self.set_status(&mut inner, Status::Connecting);
            }
        }

        let conn = Arc::clone(self);
        async move {
            match target {
                Ok((host, port)) => conn.establish(open(host, port)).await,
                Err(e) => {
                    conn.shutdown_with("connect failed");
                    Err(conn.connect_error(e.to_string()))
                }
            }
        }
    }

    async fn establish<F>(self: Arc<Self>, opening: F) -> Result<()>
    where
        F: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        debug!(conn = self.id, server = %self.server, "Connecting");

        let mut attempt = tokio::spawn(opening);

        let outcome = match self.context.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        event = "timeout",
                        conn = self.id,
                        server = %self.server,
                        timeout_ms = limit.as_millis() as u64,
                        "Connect timeout"
                    );
                    if self.context.keep_dangle_socket {
                        tokio::spawn(transport::wait_dangling(
                            attempt,
                            self.server.clone(),
                            self.context.dangle_socket_wait_timeout,
                        ));
                    } else {
                        attempt.abort();
                    }
                    self.shutdown_with("connect timeout");
                    return Err(self.connect_error("connect timeout".into()));
                }
            },
            None => (&mut attempt).await,
        };

        let failure = match outcome {
            Ok(Ok(stream)) => return self.attach(stream),
            Ok(Err(e)) => e,
            Err(e) => io::Error::other(e),
        };

        warn!(conn = self.id, server = %self.server, error = %failure, "Connect failed");
        self.shutdown_with("connect failed");
        Err(self.connect_error(format!("connect failed: {}", failure)))
    }

    fn connect_error(&self, reason: String) -> Error {
        Error::Connect {
            server: self.server.clone(),
            reason,
        }
    }

    /// Runs the connection over an established stream and marks it READY.
    pub(crate) fn attach(self: &Arc<Self>, stream: BoxStream) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.lock();
        if inner.status == Status::Shutdown {
            let reason = inner.reason.clone().unwrap_or_default();
            return Err(Error::Shutdown(reason));
        }

        inner.writer = Some(tx);
        inner.tasks.push(tokio::spawn(write_loop(Arc::clone(self), writer, rx)));
        inner.tasks.push(tokio::spawn(read_loop(Arc::clone(self), reader)));
        inner.tasks.push(tokio::spawn(supervisor::supervise(Arc::downgrade(self))));
        self.set_status(&mut inner, Status::Ready);
        drop(inner);

        info!(conn = self.id, server = %self.server, "Connected");
        Ok(())
    }

    /// Waits until the connection is READY.
    ///
    /// Fails with a connecting error if it shut down before ever getting
    /// there.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut status_rx = self.status_tx.subscribe();
        loop {
            let status = *status_rx.borrow_and_update();
            match status {
                Status::Ready => return Ok(()),
                Status::Shutdown => {
                    let inner = self.lock();
                    let reason = inner.reason.clone().unwrap_or_default();
                    return Err(if inner.never_connected {
                        self.connect_error(reason)
                    } else {
                        Error::Shutdown(reason)
                    });
                }
                Status::Init | Status::Connecting => {}
            }
            if status_rx.changed().await.is_err() {
                return Err(Error::NotReady {
                    id: self.id,
                    status,
                });
            }
        }
    }

    /// Writes a command and waits for its reply.
    ///
    /// With `noreply` nothing is queued and `Ok(None)` is returned once the
    /// bytes are handed to the writer.
    pub async fn execute(&self, data: Bytes, noreply: bool) -> Result<Option<Reply>> {
        let (receiver, sent) = {
            let mut inner = self.lock();
            if inner.status != Status::Ready {
                return Err(Error::NotReady {
                    id: self.id,
                    status: inner.status,
                });
            }

            let receiver = if noreply {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.queue.push_back(CommandContext::new(tx));
                Some(rx)
            };

            let sent = inner
                .writer
                .as_ref()
                .is_some_and(|writer| writer.send(data).is_ok());
            (receiver, sent)
        };

        if !sent {
            self.shutdown_with("socket closed");
        }

        let Some(receiver) = receiver else {
            return if sent {
                Ok(None)
            } else {
                Err(Error::Shutdown("socket closed".into()))
            };
        };

        match receiver.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(Error::Shutdown(
                self.lock().reason.clone().unwrap_or_default(),
            )),
        }
    }

    /// Shuts the connection down. Calling it again has no effect.
    pub fn shutdown(&self) {
        self.shutdown_with("Shutdown requested");
    }

    pub(crate) fn shutdown_with(&self, reason: &str) {
        let (queue, owner, tasks) = {
            let mut inner = self.lock();
            if inner.status == Status::Shutdown {
                return;
            }
            inner.never_connected = matches!(inner.status, Status::Init | Status::Connecting);
            inner.reason = Some(reason.to_string());
            inner.writer = None;
            self.set_status(&mut inner, Status::Shutdown);
            (
                std::mem::take(&mut inner.queue),
                inner.owner.take(),
                std::mem::take(&mut inner.tasks),
            )
        };

        info!(
            conn = self.id,
            server = %self.server,
            reason = reason,
            pending = queue.len(),
            "Connection shutdown"
        );

        for ctx in queue {
            ctx.complete(Err(Error::Shutdown(reason.to_string())));
        }

        if let Some(owner) = owner.and_then(|owner| owner.upgrade()) {
            owner.end_connection(self.id);
        }

        for task in tasks {
            task.abort();
        }
    }

    /// Acts on one reply line.
    fn dispatch(&self, tokens: &[String]) -> Disposition {
        let action = ReplyAction::classify(&tokens[0]);
        if action.peeks() {
            return self.peek_head(action, tokens);
        }
        self.pop_head(action, tokens);
        Disposition::Handled
    }

    /// Lines that add to the oldest command without completing it.
    fn peek_head(&self, action: ReplyAction, tokens: &[String]) -> Disposition {
        if action == ReplyAction::Own(OwnReply::Value) {
            let Some(length) = tokens.get(3).and_then(|len| len.parse::<usize>().ok()) else {
                return Disposition::Unknown;
            };
            if length > self.context.max_value_len {
                warn!(
                    conn = self.id,
                    length = length,
                    max = self.context.max_value_len,
                    "Value too large"
                );
                self.shutdown_with(&format!(
                    "value of {} bytes exceeds max_value_len {}",
                    length, self.context.max_value_len
                ));
                return Disposition::Unknown;
            }
            return Disposition::ExpectPayload(length);
        }

        let mut inner = self.lock();
        match inner.queue.front_mut() {
            Some(ctx) => ctx
                .results
                .lines
                .entry(tokens[0].clone())
                .or_default()
                .push(tokens[1..].to_vec()),
            None => warn!(conn = self.id, ?tokens, "Result line with no pending command"),
        }
        Disposition::Handled
    }

    /// Lines that complete the oldest command, or are skipped.
    fn pop_head(&self, action: ReplyAction, tokens: &[String]) {
        let mut inner = self.lock();

        match action {
            ReplyAction::Ok | ReplyAction::SingleResult => {
                inner.pop_and_complete(Ok(Reply::Tokens(tokens.to_vec())));
            }
            ReplyAction::Error => {
                inner.pop_and_complete(Err(Error::Reply {
                    tokens: tokens.to_vec(),
                }));
            }
            ReplyAction::Own(OwnReply::End) => match inner.queue.pop_front() {
                Some(mut ctx) => {
                    let result = match ctx.error.take() {
                        Some(e) => Err(e),
                        None => Ok(Reply::Results(std::mem::take(&mut ctx.results))),
                    };
                    ctx.complete(result);
                }
                None => warn!(conn = self.id, "END with no pending command"),
            },
            ReplyAction::Unrecognized => {
                if tokens.len() == 1 && is_counter_value(&tokens[0]) {
                    inner.pop_and_complete(Ok(Reply::Tokens(tokens.to_vec())));
                } else {
                    warn!(conn = self.id, ?tokens, "Unrecognized reply");
                }
            }
            // handled by peek_head
            ReplyAction::Result | ReplyAction::Own(OwnReply::Value) => {}
        }
    }

    /// Stores a completed `VALUE` block into the oldest queued command.
    fn receive_value(&self, payload: Payload) {
        let Payload { tokens, data, .. } = payload;
        let key = tokens.get(1).cloned().unwrap_or_default();
        let flags = tokens.get(2).and_then(|f| f.parse().ok()).unwrap_or(0);
        let cas_unique = tokens.get(4).and_then(|c| c.parse().ok());
        let unpacked = self.context.packer.unpack(PackedValue { flags, data });

        let mut inner = self.lock();
        let Some(ctx) = inner.queue.front_mut() else {
            warn!(conn = self.id, key = %key, "Value with no pending command");
            return;
        };

        match unpacked {
            Ok(value) => {
                ctx.results.values.insert(
                    key,
                    RetrievalItem {
                        tokens,
                        flags,
                        cas_unique,
                        value,
                    },
                );
            }
            Err(e) => {
                warn!(conn = self.id, key = %key, error = %e, "Failed to unpack value");
                ctx.error = Some(e.into());
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("status", &inner.status)
            .field("pending", &inner.queue.len())
            .finish()
    }
}

/// Feeds parsed reply lines into a connection.
struct ReplyDispatcher<'a> {
    conn: &'a Connection,
}

impl ParserHandler for ReplyDispatcher<'_> {
    fn process_cmd(&mut self, tokens: &[String]) -> Disposition {
        self.conn.dispatch(tokens)
    }

    fn receive_result(&mut self, payload: Payload) {
        self.conn.receive_value(payload);
    }
}

/// Reads replies until the socket ends.
async fn read_loop(conn: Arc<Connection>, mut reader: ReadHalf<BoxStream>) {
    let mut parser = MemcacheParser::new();
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

    let reason = loop {
        if buffer.capacity() < 1024 {
            buffer.reserve(READ_RESERVE);
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "socket end".to_string(),
            Ok(n) => {
                trace!(conn = conn.id, bytes = n, "Read data");
                let chunk = buffer.split().freeze();
                parser.on_data(chunk, &mut ReplyDispatcher { conn: &conn });
                if conn.status() == Status::Shutdown {
                    return;
                }
            }
            Err(e) => break format!("socket error {}", e),
        }
    };

    conn.shutdown_with(&reason);
}

/// Writes queued commands, flushing once the channel is drained.
async fn write_loop(
    conn: Arc<Connection>,
    writer: WriteHalf<BoxStream>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(data) = rx.recv().await {
        if let Err(e) = write_batch(&mut writer, &mut rx, data).await {
            conn.shutdown_with(&format!("socket error {}", e));
            return;
        }
    }
}

async fn write_batch(
    writer: &mut BufWriter<WriteHalf<BoxStream>>,
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
    first: Bytes,
) -> io::Result<()> {
    let mut written = first.len();
    writer.write_all(&first).await?;
    while let Ok(more) = rx.try_recv() {
        written += more.len();
        writer.write_all(&more).await?;
    }
    writer.flush().await?;
    trace!(bytes = written, "Sent commands");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    pub(crate) fn test_context(cmd_timeout: Duration) -> Arc<ClientContext> {
        let config = ClientConfig::new("127.0.0.1:11211").with_cmd_timeout(cmd_timeout);
        Arc::new(ClientContext::new(&config))
    }

    fn attached(cmd_timeout: Duration) -> (Arc<Connection>, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let conn = Connection::new(1, "test:11211", test_context(cmd_timeout), None);
        conn.attach(Box::new(client)).unwrap();
        (conn, server)
    }

    /// Reads exactly `expected.len()` bytes and compares them.
    async fn expect_request(server: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), String::from_utf8_lossy(expected));
    }

    #[derive(Default)]
    struct Ended(AtomicU64);

    impl ConnectionObserver for Ended {
        fn end_connection(&self, id: u64) {
            self.0.store(id, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_fifo_under_fragmentation() {
        let (conn, mut server) = attached(Duration::from_secs(5));

        let c1 = Arc::clone(&conn);
        let c2 = Arc::clone(&conn);
        let c3 = Arc::clone(&conn);
        let first = tokio::spawn(async move {
            c1.execute(Bytes::from_static(b"set a 0 0 1\r\n1\r\n"), false).await
        });
        expect_request(&mut server, b"set a 0 0 1\r\n1\r\n").await;
        let second = tokio::spawn(async move {
            c2.execute(Bytes::from_static(b"get a b\r\n"), false).await
        });
        expect_request(&mut server, b"get a b\r\n").await;
        let third = tokio::spawn(async move {
            c3.execute(Bytes::from_static(b"incr n 1\r\n"), false).await
        });
        expect_request(&mut server, b"incr n 1\r\n").await;

        let replies = b"STORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 3\r\nxyz\r\nEND\r\n8\r\n";
        for byte in replies.chunks(1) {
            server.write_all(byte).await.unwrap();
        }

        let first = first.await.unwrap().unwrap().unwrap();
        assert_eq!(first, Reply::Tokens(vec!["STORED".into()]));

        let second = second.await.unwrap().unwrap().unwrap().into_results().unwrap();
        assert_eq!(second.values.len(), 2);
        assert_eq!(second.values["a"].value, Value::from("1"));
        assert_eq!(second.values["b"].value, Value::from("xyz"));
        assert_eq!(second.values["b"].cas_unique, None);

        let third = third.await.unwrap().unwrap().unwrap().into_tokens().unwrap();
        assert_eq!(third, vec!["8".to_string()]);
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_rejects() {
        let (conn, mut server) = attached(Duration::from_secs(5));

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"add k 0 0 1\r\nv\r\n"), false).await
        });
        expect_request(&mut server, b"add k 0 0 1\r\nv\r\n").await;
        server.write_all(b"NOT_STORED\r\n").await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "NOT_STORED");
        assert!(err.is_reply("NOT_STORED"));
    }

    #[tokio::test]
    async fn test_stat_lines_accumulate() {
        let (conn, mut server) = attached(Duration::from_secs(5));

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"stats\r\n"), false).await
        });
        expect_request(&mut server, b"stats\r\n").await;
        server
            .write_all(b"STAT pid 42\r\nSTAT version 1.6.0\r\nEND\r\n")
            .await
            .unwrap();

        let results = pending.await.unwrap().unwrap().unwrap().into_results().unwrap();
        assert_eq!(
            results.lines["STAT"],
            vec![
                vec!["pid".to_string(), "42".to_string()],
                vec!["version".to_string(), "1.6.0".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_unrecognized_line_consumes_nothing() {
        let (conn, mut server) = attached(Duration::from_secs(5));

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"version\r\n"), false).await
        });
        expect_request(&mut server, b"version\r\n").await;
        server
            .write_all(b"HELLO there\r\nVERSION 1.6.0\r\n")
            .await
            .unwrap();

        let tokens = pending.await.unwrap().unwrap().unwrap().into_tokens().unwrap();
        assert_eq!(tokens, vec!["VERSION".to_string(), "1.6.0".to_string()]);
    }

    #[tokio::test]
    async fn test_noreply_queues_nothing() {
        let (conn, mut server) = attached(Duration::from_secs(5));

        let reply = conn
            .execute(Bytes::from_static(b"delete k noreply\r\n"), true)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(conn.pending(), 0);
        expect_request(&mut server, b"delete k noreply\r\n").await;
    }

    #[tokio::test]
    async fn test_mock_fragmented_reads() {
        let stream = tokio_test::io::Builder::new()
            .write(b"gets foo\r\n")
            .read(b"VALUE foo 0 3 9")
            .read(b"9\r\nb")
            .read(b"ar\r")
            .read(b"\nEND")
            .read(b"\r\n")
            .build();

        let conn = Connection::new(7, "mock:11211", test_context(Duration::from_secs(5)), None);
        conn.attach(Box::new(stream)).unwrap();

        let results = conn
            .execute(Bytes::from_static(b"gets foo\r\n"), false)
            .await
            .unwrap()
            .unwrap()
            .into_results()
            .unwrap();
        let item = &results.values["foo"];
        assert_eq!(item.value, Value::from("bar"));
        assert_eq!(item.cas_unique, Some(99));
        assert_eq!(item.tokens, vec!["VALUE", "foo", "0", "3", "99"]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queue_and_is_idempotent() {
        let ended = Arc::new(Ended::default());
        let owner: Weak<dyn ConnectionObserver> = Arc::downgrade(&ended) as Weak<dyn ConnectionObserver>;
        let (client, mut server) = duplex(1024);
        let conn = Connection::new(3, "test:11211", test_context(Duration::from_secs(5)), Some(owner));
        conn.attach(Box::new(client)).unwrap();

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"get k\r\n"), false).await
        });
        expect_request(&mut server, b"get k\r\n").await;

        conn.shutdown();
        conn.shutdown();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Shutdown requested");
        assert_eq!(conn.status(), Status::Shutdown);
        assert_eq!(ended.0.load(Ordering::SeqCst), 3);

        let err = conn.execute(Bytes::from_static(b"get k\r\n"), false).await.unwrap_err();
        assert!(matches!(err, Error::NotReady { status: Status::Shutdown, .. }));
    }

    #[tokio::test]
    async fn test_socket_end_shuts_down() {
        let (conn, server) = attached(Duration::from_secs(5));
        drop(server);

        let mut status = conn.subscribe();
        while *status.borrow_and_update() != Status::Shutdown {
            status.changed().await.unwrap();
        }
        assert!(conn.wait_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let (conn, mut server) = attached(Duration::from_millis(100));

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"get slow\r\n"), false).await
        });
        expect_request(&mut server, b"get slow\r\n").await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Command timeout");
        assert_eq!(conn.status(), Status::Shutdown);
    }

    #[tokio::test]
    async fn test_oversized_value_shuts_down() {
        let (conn, mut server) = attached(Duration::from_secs(5));

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"get k\r\n"), false).await
        });
        expect_request(&mut server, b"get k\r\n").await;
        server
            .write_all(b"VALUE k 0 18446744073709551615\r\nx")
            .await
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Shutdown(_)));
        assert!(err.to_string().contains("exceeds max_value_len"), "{}", err);
        assert_eq!(conn.status(), Status::Shutdown);
    }

    #[tokio::test]
    async fn test_value_limit_is_configurable() {
        let config = ClientConfig::new("127.0.0.1:11211").with_max_value_len(4);
        let (client, mut server) = duplex(1024);
        let conn = Connection::new(12, "test:11211", Arc::new(ClientContext::new(&config)), None);
        conn.attach(Box::new(client)).unwrap();

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move {
            c.execute(Bytes::from_static(b"get k\r\n"), false).await
        });
        expect_request(&mut server, b"get k\r\n").await;
        server.write_all(b"VALUE k 0 5\r\nabcde\r\nEND\r\n").await.unwrap();

        assert!(pending.await.unwrap().is_err());
        assert_eq!(conn.status(), Status::Shutdown);
    }

    fn connect_timeout_context(keep_dangle_socket: bool) -> Arc<ClientContext> {
        let config = ClientConfig::new("127.0.0.1:11211")
            .with_connect_timeout(Duration::from_millis(50))
            .with_keep_dangle_socket(keep_dangle_socket, Duration::from_secs(5));
        Arc::new(ClientContext::new(&config))
    }

    #[tokio::test]
    async fn test_connect_timeout_keeps_dangling_attempt() {
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let conn = Connection::new(13, "127.0.0.1:11211", connect_timeout_context(true), None);

        let err = conn
            .connect_with(move |_host, _port| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = finished_tx.send(());
                Err::<BoxStream, _>(io::Error::other("late"))
            })
            .await
            .unwrap_err();

        assert!(err.is_connecting());
        assert_eq!(err.to_string(), "connect timeout");
        assert_eq!(conn.status(), Status::Shutdown);
        assert!(conn.wait_ready().await.unwrap_err().is_connecting());

        // The abandoned attempt runs to its end
        assert!(finished_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_timeout_aborts_attempt() {
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let conn = Connection::new(14, "127.0.0.1:11211", connect_timeout_context(false), None);

        let err = conn
            .connect_with(move |_host, _port| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = finished_tx.send(());
                Err::<BoxStream, _>(io::Error::other("late"))
            })
            .await
            .unwrap_err();

        assert!(err.is_connecting());
        assert_eq!(err.to_string(), "connect timeout");
        assert_eq!(conn.status(), Status::Shutdown);

        // Aborted before it could report
        assert!(finished_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connecting_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(9, addr.to_string(), test_context(Duration::from_secs(5)), None);
        let connecting = conn.connect();
        assert_eq!(conn.status(), Status::Connecting);

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.wait_ready().await })
        };

        let err = connecting.await.unwrap_err();
        assert!(err.is_connecting());
        assert!(waiter.await.unwrap().unwrap_err().is_connecting());
        assert_eq!(conn.status(), Status::Shutdown);
    }

    #[tokio::test]
    async fn test_connect_and_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = Connection::new(10, addr.to_string(), test_context(Duration::from_secs(5)), None);
        conn.connect().await.unwrap();
        assert!(conn.is_ready());
        conn.wait_ready().await.unwrap();
    }
}
