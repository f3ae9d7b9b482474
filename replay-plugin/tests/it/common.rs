use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use replay_capture::{frame::TcpFrame, CaptureError, LinkType, Packet, PacketSource, SegmentFlags};
use replay_plugin::{OutputError, Output};
use replay_wire::{
    http::{parse_request, HttpRequest, Limits},
    Level, Message,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// Replays a fixed list of packets.
pub struct VecSource(std::vec::IntoIter<Packet>);

impl VecSource {
    pub fn new(packets: Vec<Packet>) -> Box<dyn PacketSource> {
        Box::new(Self(packets.into_iter()))
    }
}

impl PacketSource for VecSource {
    fn name(&self) -> &str {
        "vec"
    }

    fn next_packet(&mut self) -> Option<Result<Packet, CaptureError>> {
        self.0.next().map(Ok)
    }
}

/// A client to server segment of a single connection.
pub fn segment(seq: u32, flags: SegmentFlags, payload: &[u8], ts: u64) -> Packet {
    let src = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 40000));
    let dst = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 80));
    let frame = TcpFrame::new(src, dst, seq).flags(flags).payload(Bytes::copy_from_slice(payload)).build();
    Packet::decode(LinkType::Ethernet, frame, ts)
}

/// A minimal HTTP server answering every request with `200 OK` and reporting what it received.
pub async fn http_server() -> (SocketAddr, mpsc::UnboundedReceiver<HttpRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(serve(stream, tx.clone()));
        }
    });

    (addr, rx)
}

async fn serve(mut stream: TcpStream, tx: mpsc::UnboundedSender<HttpRequest>) {
    let mut buf = BytesMut::new();

    loop {
        if let Ok(Some((request, len))) = parse_request(&buf, Limits::default()) {
            let _ = buf.split_to(len);
            let _ = tx.send(request);

            let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
            if stream.write_all(reply).await.is_err() {
                return;
            }
            continue;
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Accepts connections and reports everything written on each one.
pub async fn tcp_sink() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut data = Vec::new();
                if stream.read_to_end(&mut data).await.is_ok() {
                    let _ = tx.send(data);
                }
            });
        }
    });

    (addr, rx)
}

/// An output recording every message it accepts.
pub struct RecordingOutput {
    name: String,
    level: Level,
    pub received: Mutex<Vec<Message>>,
}

impl RecordingOutput {
    pub fn new(name: &str, level: Level) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), level, received: Mutex::new(Vec::new()) })
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl Output for RecordingOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> Level {
        self.level
    }

    async fn write(&self, msg: Message) -> Result<(), OutputError> {
        if !msg.level().is_subset_of(self.level) {
            return Err(OutputError::LevelMismatch { level: msg.level(), accepted: self.level });
        }
        self.received.lock().push(msg);
        Ok(())
    }

    async fn close(&self) {}
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
