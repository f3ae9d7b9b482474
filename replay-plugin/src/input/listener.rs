use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use http::{header, Version};
use parking_lot::Mutex;
use replay_common::constants::DEFAULT_QUEUE_CAPACITY;
use replay_wire::{
    http::{expects_continue, parse_request, HttpError, HttpRequest, Limits, DEFAULT_MAX_BODY_BYTES},
    Level, Message,
};
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{timeout, timeout_at, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{Delivery, Input, InputError, InputHub, Subscription};

/// Settings of a [`ListenerInput`].
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Requests outside this path prefix are answered with "not found".
    pub path: String,
    /// Time allowed to read a full request, body included.
    pub request_timeout: Duration,
    /// Time allowed to write the reply.
    pub response_timeout: Duration,
    /// Time a kept-alive connection may wait for its next request.
    pub idle_timeout: Duration,
    /// Requests with a larger header section are rejected.
    pub max_header_bytes: usize,
    /// Requests with a larger body are rejected.
    pub max_body_bytes: usize,
    /// Buffer of every subscriber.
    pub capacity: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            path: "/".to_string(),
            request_timeout: Duration::from_millis(1000),
            response_timeout: Duration::from_millis(1000),
            idle_timeout: Duration::from_millis(1000),
            max_header_bytes: 4096,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ListenerOptions {
    /// Creates the default settings for a listener on `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, ..Default::default() }
    }

    /// Sets the path prefix requests must match.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    fn limits(&self) -> Limits {
        Limits { max_header_bytes: self.max_header_bytes, max_body_bytes: self.max_body_bytes }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Acknowledgement sent to the caller. The HTTP status is always `200 OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
}

impl Reply {
    const fn code(self) -> u32 {
        match self {
            Self::Ok => 10200,
            Self::BadRequest => 10400,
            Self::NotFound => 10404,
            Self::Conflict => 10409,
        }
    }

    const fn msg(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadRequest => "bad request.",
            Self::NotFound => "not found.",
            Self::Conflict => "Conflict",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    code: u32,
    msg: &'a str,
    data: Option<()>,
}

/// An input accepting HTTP requests from callers and publishing each one as an HTTP message.
///
/// Callers are acknowledged once the request is handed to the subscribers, whatever happens to
/// it downstream. A single subscriber that falls behind delays the acknowledgements. With more,
/// a subscriber that falls behind misses requests instead.
#[derive(Debug)]
pub struct ListenerInput {
    hub: Arc<InputHub>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerInput {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(options: ListenerOptions, cancel: &CancellationToken) -> Result<Self, InputError> {
        let listener =
            TcpListener::bind(options.addr).await.map_err(|source| InputError::Bind { addr: options.addr, source })?;
        let local_addr = listener.local_addr()?;

        let hub = Arc::new(
            InputHub::new(format!("http listener {local_addr}"), options.capacity).with_delivery(Delivery::Isolated),
        );
        let cancel = cancel.child_token();

        info!(%local_addr, path = %options.path, "HTTP listener started");

        let acceptor = tokio::spawn(accept(listener, Arc::clone(&hub), Arc::new(options), cancel.clone()));

        Ok(Self { hub, local_addr, cancel, acceptor: Mutex::new(Some(acceptor)) })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Input for ListenerInput {
    fn name(&self) -> &str {
        self.hub.name()
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn dropped(&self) -> u64 {
        self.hub.dropped()
    }

    async fn close(&self) {
        self.cancel.cancel();

        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.await;
        }

        self.hub.close();
        debug!(addr = %self.local_addr, "HTTP listener closed");
    }
}

async fn accept(listener: TcpListener, hub: Arc<InputHub>, options: Arc<ListenerOptions>, cancel: CancellationToken) {
    let connections = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(err = ?e, "Failed to accept connection");
                    continue;
                }
            },
        };

        trace!(%peer, "Accepted connection");
        let _ = stream.set_nodelay(true);

        let conn = Connection { stream, peer, buf: BytesMut::new(), hub: Arc::clone(&hub), options: Arc::clone(&options) };
        let cancel = cancel.clone();
        connections.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = conn.serve() => {}
            }
        });
    }

    connections.close();
    connections.wait().await;
}

/// The result of reading one request from a connection.
enum Incoming {
    Request(HttpRequest),
    Malformed(HttpError),
    /// The request did not complete within the request timeout.
    Incomplete,
    /// The peer closed the connection or went idle.
    Closed,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
    hub: Arc<InputHub>,
    options: Arc<ListenerOptions>,
}

impl Connection {
    async fn serve(mut self) {
        let mut first = true;

        loop {
            let wait = if first { self.options.request_timeout } else { self.options.idle_timeout };
            first = false;

            let (reply, keep_alive) = match self.read_request(wait).await {
                Incoming::Request(request) => {
                    let keep_alive = wants_keep_alive(&request);
                    (self.handle(request).await, keep_alive)
                }
                Incoming::Malformed(e) => {
                    debug!(peer = %self.peer, err = ?e, "Malformed request");
                    (Reply::BadRequest, false)
                }
                Incoming::Incomplete => {
                    debug!(peer = %self.peer, buffered = self.buf.len(), "Request incomplete within timeout");
                    (Reply::Conflict, false)
                }
                Incoming::Closed => return,
            };

            if let Err(e) = self.respond(reply, keep_alive).await {
                debug!(peer = %self.peer, err = ?e, "Failed to write reply");
                return;
            }
            if !keep_alive {
                return;
            }
        }
    }

    async fn handle(&self, request: HttpRequest) -> Reply {
        if !request.uri().path().starts_with(self.options.path.as_str()) {
            return Reply::NotFound;
        }

        trace!(peer = %self.peer, method = %request.method(), target = request.path_and_query(), "Received request");
        if self.hub.publish(Message::new(Level::HTTP, request.to_bytes())).await == 0 {
            trace!("No subscribers, request dropped");
        }

        Reply::Ok
    }

    /// Reads the next request. Waits up to `wait` for its first bytes, then up to the request
    /// timeout for the rest. A client expecting `100 Continue` gets it once the header section
    /// is in.
    async fn read_request(&mut self, wait: Duration) -> Incoming {
        if self.buf.is_empty() {
            match timeout(wait, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return Incoming::Closed,
            }
        }

        let deadline = Instant::now() + self.options.request_timeout;
        let limits = self.options.limits();
        let mut continued = false;
        loop {
            match parse_request(&self.buf, limits) {
                Ok(Some((request, len))) => {
                    self.buf.advance(len);
                    return Incoming::Request(request);
                }
                Ok(None) => {}
                Err(e) => return Incoming::Malformed(e),
            }

            if !continued && expects_continue(&self.buf) {
                continued = true;
                trace!(peer = %self.peer, "Sending 100 Continue");
                match timeout_at(deadline, self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        trace!(peer = %self.peer, err = ?e, "Write failed");
                        return Incoming::Closed;
                    }
                    Err(_) => return Incoming::Incomplete,
                }
            }

            match timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => return Incoming::Closed,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    trace!(peer = %self.peer, err = ?e, "Read failed");
                    return Incoming::Closed;
                }
                Err(_) => return Incoming::Incomplete,
            }
        }
    }

    async fn respond(&mut self, reply: Reply, keep_alive: bool) -> std::io::Result<()> {
        let body = serde_json::to_vec(&Envelope { code: reply.code(), msg: reply.msg(), data: None })?;

        let mut out = Vec::with_capacity(128 + body.len());
        out.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=utf-8\r\n");
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        if !keep_alive {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&body);

        match timeout(self.options.response_timeout, self.stream.write_all(&out)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(peer = %self.peer, "Reply timed out");
                Err(std::io::ErrorKind::TimedOut.into())
            }
        }
    }
}

/// HTTP/1.1 keeps the connection unless asked not to, HTTP/1.0 only when asked to.
fn wants_keep_alive(request: &HttpRequest) -> bool {
    let connection = request
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);

    match request.version() {
        Version::HTTP_10 => connection.as_deref() == Some("keep-alive"),
        _ => connection.as_deref() != Some("close"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    async fn listener(options: ListenerOptions) -> ListenerInput {
        ListenerInput::bind(options, &CancellationToken::new()).await.unwrap()
    }

    fn local() -> ListenerOptions {
        ListenerOptions::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    /// Reads one reply and returns its envelope.
    async fn read_reply(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Value {
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                assert!(head.starts_with("HTTP/1.1 200 OK"));
                let len: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.parse().ok())
                    .unwrap();

                let body_start = end + 4;
                if buf.len() >= body_start + len {
                    let value = serde_json::from_slice(&buf[body_start..body_start + len]).unwrap();
                    buf.drain(..body_start + len);
                    return value;
                }
            }

            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before reply");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn publishes_requests_and_acknowledges() {
        let _ = tracing_subscriber::fmt::try_init();

        let input = listener(local()).await;
        let mut sub = input.subscribe();

        let mut stream = TcpStream::connect(input.local_addr()).await.unwrap();
        stream.write_all(b"POST /api/x?y=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc").await.unwrap();

        let mut buf = Vec::new();
        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply["code"], 10200);
        assert_eq!(reply["msg"], "ok");
        assert!(reply["data"].is_null());

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.level(), Level::HTTP);
        let (request, _) = parse_request(msg.raw(), Limits::default()).unwrap().unwrap();
        assert_eq!(request.path_and_query(), "/api/x?y=1");
        assert_eq!(&request.body()[..], b"abc");

        // Same connection, second request
        stream.write_all(b"GET /b HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        assert_eq!(read_reply(&mut stream, &mut buf).await["code"], 10200);
        assert!(sub.recv().await.unwrap().raw().starts_with(b"GET /b"));

        input.close().await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn replies_not_found_outside_path() {
        let input = listener(local().path("/capture")).await;
        let mut stream = TcpStream::connect(input.local_addr()).await.unwrap();

        stream.write_all(b"GET /other HTTP/1.1\r\n\r\n").await.unwrap();
        let reply = read_reply(&mut stream, &mut Vec::new()).await;
        assert_eq!(reply["code"], 10404);
        assert_eq!(reply["msg"], "not found.");

        input.close().await;
    }

    #[tokio::test]
    async fn replies_bad_request_and_closes() {
        let input = listener(local()).await;
        let mut stream = TcpStream::connect(input.local_addr()).await.unwrap();

        stream.write_all(b"NOT\x01AN HTTP REQUEST\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(read_reply(&mut stream, &mut buf).await["code"], 10400);

        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);

        input.close().await;
    }

    #[tokio::test]
    async fn replies_conflict_on_truncated_body() {
        let input = listener(local().request_timeout(Duration::from_millis(100))).await;
        let mut stream = TcpStream::connect(input.local_addr()).await.unwrap();

        stream.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").await.unwrap();
        let reply = read_reply(&mut stream, &mut Vec::new()).await;
        assert_eq!(reply["code"], 10409);
        assert_eq!(reply["msg"], "Conflict");

        input.close().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let input = listener(local()).await;
        let err = ListenerInput::bind(ListenerOptions::new(input.local_addr()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::Bind { .. }));

        assert!(matches!(input.inject(Message::new(Level::HTTP, "x")).await, Err(InputError::Unsupported)));
        input.close().await;
    }

    #[tokio::test]
    async fn answers_expect_continue_before_reading_the_body() {
        let input = listener(local()).await;
        let mut sub = input.subscribe();
        let mut stream = TcpStream::connect(input.local_addr()).await.unwrap();

        stream
            .write_all(b"POST /upload HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 2000\r\n\r\n")
            .await
            .unwrap();

        // The interim response arrives well within the request timeout
        let interim = b"HTTP/1.1 100 Continue\r\n\r\n";
        let mut buf = vec![0u8; interim.len()];
        tokio::time::timeout(Duration::from_millis(500), stream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..], interim);

        let body = vec![b'z'; 2000];
        stream.write_all(&body).await.unwrap();
        assert_eq!(read_reply(&mut stream, &mut Vec::new()).await["code"], 10200);

        let (request, _) = parse_request(sub.recv().await.unwrap().raw(), Limits::default()).unwrap().unwrap();
        assert_eq!(request.path_and_query(), "/upload");
        assert_eq!(&request.body()[..], &body[..]);

        input.close().await;
    }

    #[tokio::test]
    async fn rejects_oversized_body_without_waiting_for_it() {
        let input = listener(local().max_body_bytes(1024)).await;
        let mut stream = TcpStream::connect(input.local_addr()).await.unwrap();

        stream.write_all(b"POST / HTTP/1.1\r\nContent-Length: 1048576\r\n\r\n").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_millis(500), read_reply(&mut stream, &mut Vec::new()))
            .await
            .unwrap();
        assert_eq!(reply["code"], 10400);

        input.close().await;
    }
}
