use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use replay_plugin::{DialedStream, Dialer, Output, OutputError, StatService, TcpOutput, TcpOutputOptions, TokioDialer};
use replay_wire::{Level, Message};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::common::tcp_sink;

/// Refuses the first `failures` dials, then dials for real.
struct FlakyDialer {
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Dialer for FlakyDialer {
    async fn dial(&self, addr: &str) -> io::Result<DialedStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        TokioDialer.dial(addr).await
    }
}

#[tokio::test]
async fn delivers_once_after_transient_failures() {
    let _ = tracing_subscriber::fmt::try_init();

    let (addr, mut received) = tcp_sink().await;
    let stats = Arc::new(StatService::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    let output = TcpOutput::with_dialer(
        TcpOutputOptions::new(addr.to_string()).retry_attempts(None).backoff(Duration::from_millis(5)),
        FlakyDialer { failures: 4, attempts: Arc::clone(&attempts) },
        Arc::clone(&stats),
        CancellationToken::new(),
    );

    output.write(Message::new(Level::TCP, "payload")).await.unwrap();

    let data = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"payload");

    output.close().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(stats.count("tcp forwarded"), 1);
    assert_eq!(stats.total(), 1);

    // Give a stray duplicate the chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(received.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn drops_message_when_retries_run_out() {
    let (addr, mut received) = tcp_sink().await;
    let stats = Arc::new(StatService::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    let output = TcpOutput::with_dialer(
        TcpOutputOptions::new(addr.to_string()).retry_attempts(Some(2)).backoff(Duration::from_millis(1)),
        FlakyDialer { failures: usize::MAX, attempts: Arc::clone(&attempts) },
        Arc::clone(&stats),
        CancellationToken::new(),
    );

    output.write(Message::new(Level::TCP, "lost")).await.unwrap();
    output.close().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.count("tcp forward retries exhausted"), 1);
    assert_eq!(stats.count("tcp forwarded"), 0);
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn one_connection_per_message() {
    let (addr, mut received) = tcp_sink().await;
    let stats = Arc::new(StatService::new());

    let output = TcpOutput::new(TcpOutputOptions::new(addr.to_string()), Arc::clone(&stats), CancellationToken::new());

    for payload in ["a", "b", "c"] {
        output.write(Message::new(Level::TCP, payload)).await.unwrap();
    }
    assert!(matches!(
        output.write(Message::new(Level::HTTP, "GET / HTTP/1.1\r\n\r\n")).await,
        Err(OutputError::LevelMismatch { .. })
    ));

    output.close().await;
    assert_eq!(stats.count("tcp forwarded"), 3);

    let mut payloads = Vec::new();
    for _ in 0..3 {
        let data = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        payloads.push(String::from_utf8(data).unwrap());
    }
    payloads.sort();
    assert_eq!(payloads, ["a", "b", "c"]);
}

#[tokio::test]
async fn cancellation_stops_retrying() {
    let stats = Arc::new(StatService::new());
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let output = TcpOutput::with_dialer(
        TcpOutputOptions::new("127.0.0.1:1").retry_attempts(None).backoff(Duration::from_millis(5)),
        FlakyDialer { failures: usize::MAX, attempts: Arc::clone(&attempts) },
        Arc::clone(&stats),
        cancel.clone(),
    );

    output.write(Message::new(Level::TCP, "stuck")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), output.close()).await.unwrap();

    assert!(attempts.load(Ordering::SeqCst) >= 1);
    assert_eq!(stats.total(), 0);
}

#[tokio::test]
async fn forwards_binary_payload_verbatim() {
    let (addr, mut received) = tcp_sink().await;
    let stats = Arc::new(StatService::new());

    let payload: Vec<u8> = {
        let mut rng = rand::thread_rng();
        (0..64 * 1024).map(|_| rng.gen()).collect()
    };

    let output = TcpOutput::new(TcpOutputOptions::new(addr.to_string()), Arc::clone(&stats), CancellationToken::new());
    output.write(Message::new(Level::TCP, payload.clone())).await.unwrap();
    output.close().await;

    let data = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(data, payload);
}
