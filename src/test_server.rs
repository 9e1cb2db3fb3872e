//! In-process memcached-compatible server for tests
//!
//! Speaks enough of the ASCII protocol to exercise the client: storage
//! commands with CAS, get/gets, delete, incr/decr, touch, version and
//! stats. Requests are parsed with the crate's own [`MemcacheParser`].
//! Expiry times are accepted but ignored.

use crate::protocol::{Disposition, MemcacheParser, ParserHandler, Payload, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub(crate) const VERSION: &str = "1.6.0-test";

#[derive(Debug, Clone)]
struct Item {
    flags: u32,
    data: Bytes,
    cas: u64,
}

#[derive(Debug, Default)]
struct Store {
    items: Mutex<HashMap<String, Item>>,
    next_cas: AtomicU64,
}

impl Store {
    fn put(&self, items: &mut HashMap<String, Item>, key: &str, flags: u32, data: Bytes) {
        let cas = self.next_cas.fetch_add(1, Ordering::Relaxed) + 1;
        items.insert(key.to_string(), Item { flags, data, cas });
    }
}

/// A running test server. Stops when dropped.
pub(crate) struct TestServer {
    addr: SocketAddr,
    store: Arc<Store>,
    paused: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Store::default());
        let paused = Arc::new(AtomicBool::new(false));
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let accept = {
            let store = Arc::clone(&store);
            let paused = Arc::clone(&paused);
            let tasks = Arc::clone(&tasks);
            tokio::spawn(async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    debug!(client = %peer, "Test server accepted");
                    let session = tokio::spawn(serve(
                        stream,
                        addr.port(),
                        Arc::clone(&store),
                        Arc::clone(&paused),
                    ));
                    tasks.lock().unwrap().push(session);
                }
            })
        };
        tasks.lock().unwrap().push(accept);

        Self {
            addr,
            store,
            paused,
            tasks,
        }
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// While paused, requests are read but never answered.
    pub(crate) fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn flags_of(&self, key: &str) -> Option<u32> {
        self.store.items.lock().unwrap().get(key).map(|item| item.flags)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.store.items.lock().unwrap().contains_key(key)
    }

    /// Stops accepting and drops every client connection.
    pub(crate) fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A listener that never accepts and whose backlog is full, so connecting
/// to it hangs until the client gives up.
pub(crate) struct StalledListener {
    addr: SocketAddr,
    _listener: TcpListener,
    _held: Vec<TcpStream>,
}

impl StalledListener {
    pub(crate) async fn start() -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut held = Vec::new();
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(stream) => held.push(stream.unwrap()),
                Err(_) => {
                    return Self {
                        addr,
                        _listener: listener,
                        _held: held,
                    }
                }
            }
        }
        panic!("backlog of {} never filled", addr);
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.to_string()
    }
}

async fn serve(mut stream: TcpStream, port: u16, store: Arc<Store>, paused: Arc<AtomicBool>) {
    let mut parser = MemcacheParser::new();
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        buffer.reserve(4096);
        match stream.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => trace!(bytes = n, "Test server read"),
        }

        let mut session = Session {
            store: &store,
            port,
            out: BytesMut::new(),
        };
        parser.on_data(buffer.split().freeze(), &mut session);

        if paused.load(Ordering::SeqCst) || session.out.is_empty() {
            continue;
        }
        if stream.write_all(&session.out).await.is_err() {
            return;
        }
    }
}

/// Executes parsed requests, collecting replies in `out`.
struct Session<'a> {
    store: &'a Store,
    port: u16,
    out: BytesMut,
}

impl Session<'_> {
    fn reply(&mut self, noreply: bool, line: &str) {
        if !noreply {
            self.out.put_slice(line.as_bytes());
            self.out.put_slice(CRLF);
        }
    }

    fn cmd_get(&mut self, keys: &[String], with_cas: bool) {
        let items = self.store.items.lock().unwrap();
        for key in keys {
            if let Some(item) = items.get(key) {
                let header = if with_cas {
                    format!("VALUE {} {} {} {}", key, item.flags, item.data.len(), item.cas)
                } else {
                    format!("VALUE {} {} {}", key, item.flags, item.data.len())
                };
                self.out.put_slice(header.as_bytes());
                self.out.put_slice(CRLF);
                self.out.put_slice(&item.data);
                self.out.put_slice(CRLF);
            }
        }
        self.out.put_slice(b"END\r\n");
    }

    fn cmd_delete(&mut self, tokens: &[String], noreply: bool) {
        let removed = self.store.items.lock().unwrap().remove(&tokens[1]).is_some();
        self.reply(noreply, if removed { "DELETED" } else { "NOT_FOUND" });
    }

    fn cmd_arith(&mut self, tokens: &[String], noreply: bool) {
        let Some(delta) = tokens.get(2).and_then(|d| d.parse::<u64>().ok()) else {
            self.reply(noreply, "CLIENT_ERROR invalid numeric delta argument");
            return;
        };

        let mut items = self.store.items.lock().unwrap();
        let Some(item) = items.get(&tokens[1]).cloned() else {
            drop(items);
            self.reply(noreply, "NOT_FOUND");
            return;
        };
        let Some(current) = std::str::from_utf8(&item.data)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        else {
            drop(items);
            self.reply(
                noreply,
                "CLIENT_ERROR cannot increment or decrement non-numeric value",
            );
            return;
        };

        let value = if tokens[0] == "incr" {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        self.store
            .put(&mut items, &tokens[1], item.flags, Bytes::from(value.to_string()));
        drop(items);
        self.reply(noreply, &value.to_string());
    }

    fn cmd_touch(&mut self, tokens: &[String], noreply: bool) {
        let found = self.store.items.lock().unwrap().contains_key(&tokens[1]);
        self.reply(noreply, if found { "TOUCHED" } else { "NOT_FOUND" });
    }

    fn cmd_stats(&mut self) {
        let count = self.store.items.lock().unwrap().len();
        let stats = [
            ("pid", std::process::id().to_string()),
            ("port", self.port.to_string()),
            ("version", VERSION.to_string()),
            ("curr_items", count.to_string()),
        ];
        for (name, value) in stats {
            self.out.put_slice(format!("STAT {} {}\r\n", name, value).as_bytes());
        }
        self.out.put_slice(b"END\r\n");
    }

    fn cmd_store(&mut self, tokens: &[String], data: Bytes) {
        let noreply = tokens.last().is_some_and(|t| t == "noreply");
        let key = &tokens[1];
        let flags = tokens[2].parse::<u32>().unwrap_or(0);

        let mut items = self.store.items.lock().unwrap();
        let existing = items.get(key).cloned();

        let reply = match (tokens[0].as_str(), existing) {
            ("set", _) => {
                self.store.put(&mut items, key, flags, data);
                "STORED"
            }
            ("add", Some(_)) | ("replace", None) | ("append", None) | ("prepend", None) => {
                "NOT_STORED"
            }
            ("add", None) | ("replace", Some(_)) => {
                self.store.put(&mut items, key, flags, data);
                "STORED"
            }
            ("append", Some(item)) => {
                let joined = [&item.data[..], &data[..]].concat();
                self.store.put(&mut items, key, item.flags, Bytes::from(joined));
                "STORED"
            }
            ("prepend", Some(item)) => {
                let joined = [&data[..], &item.data[..]].concat();
                self.store.put(&mut items, key, item.flags, Bytes::from(joined));
                "STORED"
            }
            ("cas", None) => "NOT_FOUND",
            ("cas", Some(item)) => {
                let expected = tokens.get(5).and_then(|c| c.parse::<u64>().ok());
                if expected == Some(item.cas) {
                    self.store.put(&mut items, key, flags, data);
                    "STORED"
                } else {
                    "EXISTS"
                }
            }
            _ => "ERROR",
        };
        drop(items);
        self.reply(noreply, reply);
    }
}

impl ParserHandler for Session<'_> {
    fn process_cmd(&mut self, tokens: &[String]) -> Disposition {
        let noreply = tokens.last().is_some_and(|t| t == "noreply");

        match tokens[0].as_str() {
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                match tokens.get(4).and_then(|n| n.parse::<usize>().ok()) {
                    Some(length) => return Disposition::ExpectPayload(length),
                    None => self.reply(false, "CLIENT_ERROR bad command line format"),
                }
            }
            "get" => self.cmd_get(&tokens[1..], false),
            "gets" => self.cmd_get(&tokens[1..], true),
            "delete" if tokens.len() >= 2 => self.cmd_delete(tokens, noreply),
            "incr" | "decr" if tokens.len() >= 3 => self.cmd_arith(tokens, noreply),
            "touch" if tokens.len() >= 3 => self.cmd_touch(tokens, noreply),
            "version" => self.reply(false, &format!("VERSION {}", VERSION)),
            "stats" => self.cmd_stats(),
            _ => return Disposition::Unknown,
        }

        Disposition::Handled
    }

    fn receive_result(&mut self, payload: Payload) {
        self.cmd_store(&payload.tokens, payload.data);
    }

    fn unknown_command(&mut self, tokens: &[String]) {
        debug!(?tokens, "Test server unknown command");
        self.reply(false, "ERROR");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(server: &TestServer, request: &[u8], expected: &[u8]) {
        let mut client = TcpStream::connect(server.addr()).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), String::from_utf8_lossy(expected));
    }

    #[tokio::test]
    async fn test_set_then_gets() {
        let server = TestServer::start().await;
        roundtrip(
            &server,
            b"set k 5 0 2\r\nhi\r\ngets k missing\r\n",
            b"STORED\r\nVALUE k 5 2 1\r\nhi\r\nEND\r\n",
        )
        .await;
        assert_eq!(server.flags_of("k"), Some(5));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let server = TestServer::start().await;
        roundtrip(&server, b"bogus\r\n", b"ERROR\r\n").await;
    }

    #[tokio::test]
    async fn test_noreply_is_silent() {
        let server = TestServer::start().await;
        roundtrip(&server, b"set k 0 0 1 noreply\r\nx\r\nversion\r\n", b"VERSION 1.6.0-test\r\n").await;
        assert!(server.contains("k"));
    }
}
