use std::{sync::Arc, time::Duration};

use http::Method;
use replay_capture::SegmentFlags;
use replay_plugin::{
    CaptureInput, CaptureOptions, HttpOutput, HttpOutputOptions, Input, Output, OutputError, Scheduler,
    StatService,
};
use replay_wire::{Level, Message};
use tokio_util::sync::CancellationToken;

use crate::common::{eventually, http_server, segment, VecSource};

#[tokio::test]
async fn captured_request_is_redirected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (addr, mut received) = http_server().await;
    let cancel = CancellationToken::new();
    let stats = Arc::new(StatService::new());

    let input: Arc<dyn Input> =
        Arc::new(CaptureInput::start("capture", Vec::new(), CaptureOptions::default(), &cancel));
    let output: Arc<dyn Output> = Arc::new(
        HttpOutput::new(
            HttpOutputOptions::new(format!("http://{addr}/")).workers(1),
            Arc::clone(&stats),
            cancel.clone(),
        )
        .unwrap(),
    );

    let scheduler = Scheduler::new();
    scheduler.register_endpoint(Arc::clone(&input), Arc::clone(&output)).unwrap();

    input.inject(Message::new(Level::HTTP, "GET /x HTTP/1.1\r\nHost: a\r\n\r\n")).await.unwrap();

    let request = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(request.method(), &Method::GET);
    assert_eq!(request.path_and_query(), "/x");
    assert_eq!(request.host(), Some(addr.to_string().as_str()));

    eventually(|| stats.count("200 OK") == 1).await;

    scheduler.close().await;
    input.close().await;
    output.close().await;
}

#[tokio::test]
async fn reassembled_capture_is_replayed_exactly() {
    let _ = tracing_subscriber::fmt::try_init();

    let (addr, mut received) = http_server().await;
    let cancel = CancellationToken::new();
    let stats = Arc::new(StatService::new());

    let head = "POST /api/items?filter={\"id\":7}|x HTTP/1.1\r\nHost: origin\r\nX-Trace: abc\r\nContent-Length: 17\r\n\r\n";
    let raw = format!("{head}{{\"name\":\"widget\"}}");
    let raw = raw.as_bytes();
    let (first, rest) = raw.split_at(20);
    let (second, third) = rest.split_at(40);
    let end = 1 + raw.len() as u32;

    // The last segment arrives before the middle one
    let packets = vec![
        segment(0, SegmentFlags { syn: true, ..Default::default() }, b"", 1),
        segment(1, SegmentFlags::default(), first, 2),
        segment(61, SegmentFlags::default(), third, 3),
        segment(21, SegmentFlags::default(), second, 4),
        segment(end, SegmentFlags { fin: true, ..Default::default() }, b"", 5),
    ];

    let input: Arc<dyn Input> = Arc::new(CaptureInput::start(
        "capture",
        vec![VecSource::new(packets)],
        CaptureOptions::default().queue_capacity(1),
        &cancel,
    ));
    let output: Arc<dyn Output> = Arc::new(
        HttpOutput::new(
            HttpOutputOptions::new(format!("http://{addr}/mirror/")).workers(1),
            Arc::clone(&stats),
            cancel.clone(),
        )
        .unwrap(),
    );

    let scheduler = Scheduler::new();
    scheduler.register_endpoint(Arc::clone(&input), Arc::clone(&output)).unwrap();

    let request = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(request.method(), &Method::POST);
    assert_eq!(request.path_and_query(), "/mirror/api/items?filter=%7B%22id%22:7%7D%7Cx");
    assert_eq!(request.headers()["x-trace"], "abc");
    assert_eq!(request.headers()["content-length"], "17");
    assert_eq!(&request.body()[..], br#"{"name":"widget"}"#);

    eventually(|| stats.count("200 OK") == 1).await;
    assert_eq!(input.dropped(), 0);

    scheduler.close().await;
    input.close().await;
    output.close().await;
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn method_query_and_body_are_preserved() {
    let (addr, mut received) = http_server().await;
    let stats = Arc::new(StatService::new());

    let output = HttpOutput::new(
        HttpOutputOptions::new(format!("http://{addr}/mirror/")).workers(1),
        Arc::clone(&stats),
        CancellationToken::new(),
    )
    .unwrap();

    let raw = "PUT /v1/items?id=7 HTTP/1.1\r\nHost: origin\r\nX-Trace: 1\r\nContent-Length: 5\r\n\r\nhello";
    output.write(Message::new(Level::HTTP, raw)).await.unwrap();

    let request = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(request.method(), &Method::PUT);
    assert_eq!(request.path_and_query(), "/mirror/v1/items?id=7");
    assert_eq!(request.headers()["x-trace"], "1");
    assert_eq!(&request.body()[..], b"hello");

    output.close().await;
    assert_eq!(stats.count("200 OK"), 1);
}

#[tokio::test]
async fn close_drains_queued_messages() {
    let (addr, mut received) = http_server().await;
    let stats = Arc::new(StatService::new());

    let output = HttpOutput::new(
        HttpOutputOptions::new(format!("http://{addr}/")).workers(1),
        Arc::clone(&stats),
        CancellationToken::new(),
    )
    .unwrap();

    for i in 0..5 {
        let raw = format!("GET /drain/{i} HTTP/1.1\r\nHost: a\r\n\r\n");
        output.write(Message::new(Level::HTTP, raw)).await.unwrap();
    }

    output.close().await;

    assert_eq!(stats.total(), 5);
    assert_eq!(stats.count("200 OK"), 5);

    let mut paths = Vec::new();
    while let Ok(request) = received.try_recv() {
        paths.push(request.path_and_query().to_string());
    }
    paths.sort();
    assert_eq!(paths, (0..5).map(|i| format!("/drain/{i}")).collect::<Vec<_>>());

    assert!(matches!(output.write(Message::new(Level::HTTP, "GET / HTTP/1.1\r\n\r\n")).await, Err(OutputError::Closed)));
}

#[tokio::test]
async fn raw_levels_only_replayed_when_enabled() {
    let (addr, mut received) = http_server().await;
    let stats = Arc::new(StatService::new());
    let raw = "GET /raw HTTP/1.1\r\nHost: a\r\n\r\n";

    let output = HttpOutput::new(
        HttpOutputOptions::new(format!("http://{addr}/")).workers(1),
        Arc::clone(&stats),
        CancellationToken::new(),
    )
    .unwrap();
    output.write(Message::new(Level::TCP, raw)).await.unwrap();
    assert!(matches!(
        output.write(Message::new(Level::SOCKET, raw)).await,
        Err(OutputError::LevelMismatch { .. })
    ));
    output.close().await;
    assert_eq!(stats.total(), 0);

    let output = HttpOutput::new(
        HttpOutputOptions::new(format!("http://{addr}/")).workers(1).replay_raw(true),
        Arc::clone(&stats),
        CancellationToken::new(),
    )
    .unwrap();
    output.write(Message::new(Level::TCP, raw)).await.unwrap();
    output.close().await;

    assert_eq!(stats.count("200 OK"), 1);
    assert_eq!(received.recv().await.unwrap().path_and_query(), "/raw");
}

#[tokio::test]
async fn unreachable_destination_is_counted() {
    // Bind and drop to get a port nothing listens on
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let stats = Arc::new(StatService::new());

    let output = HttpOutput::new(
        HttpOutputOptions::new(format!("http://{addr}/")).workers(1),
        Arc::clone(&stats),
        CancellationToken::new(),
    )
    .unwrap();
    output.write(Message::new(Level::HTTP, "GET / HTTP/1.1\r\n\r\n")).await.unwrap();
    output.close().await;

    assert_eq!(stats.total(), 1);
    assert_eq!(stats.count("200 OK"), 0);
}
