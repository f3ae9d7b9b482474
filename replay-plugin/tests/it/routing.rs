use std::{sync::Arc, time::Duration};

use replay_plugin::{
    CaptureInput, CaptureOptions, Input, Output, Scheduler, SchedulerError, StatService, TcpOutput,
    TcpOutputOptions,
};
use replay_wire::{Level, Message};
use tokio_util::sync::CancellationToken;

use crate::common::{eventually, RecordingOutput};

fn input(name: &str) -> Arc<CaptureInput> {
    Arc::new(CaptureInput::start(name, Vec::new(), CaptureOptions::default(), &CancellationToken::new()))
}

#[tokio::test]
async fn binds_every_input_to_every_output() {
    let _ = tracing_subscriber::fmt::try_init();

    let inputs = [input("a"), input("b")];
    let outputs = [
        RecordingOutput::new("x", Level::ALL),
        RecordingOutput::new("y", Level::ALL),
        RecordingOutput::new("z", Level::ALL),
    ];

    let scheduler = Scheduler::new();
    let dyn_inputs: Vec<Arc<dyn Input>> = inputs.iter().map(|i| Arc::clone(i) as Arc<dyn Input>).collect();
    let dyn_outputs: Vec<Arc<dyn Output>> = outputs.iter().map(|o| Arc::clone(o) as Arc<dyn Output>).collect();

    let ids = scheduler.bind_all(&dyn_inputs, &dyn_outputs).unwrap();
    assert_eq!(ids.len(), 6);
    assert_eq!(scheduler.endpoints(), ids);

    inputs[0].inject(Message::new(Level::HTTP, "from a")).await.unwrap();
    inputs[1].inject(Message::new(Level::TCP, "from b")).await.unwrap();

    eventually(|| outputs.iter().all(|o| o.len() == 2)).await;

    for output in &outputs {
        let mut raws: Vec<_> = output.received.lock().iter().map(|m| m.raw().clone()).collect();
        raws.sort();
        assert_eq!(raws, ["from a", "from b"]);
    }

    scheduler.close().await;
    assert!(scheduler.endpoints().is_empty());
}

#[tokio::test]
async fn outputs_only_receive_accepted_levels() {
    let source = input("mixed");
    let tcp_only = RecordingOutput::new("tcp", Level::TCP);
    let http_only = RecordingOutput::new("http", Level::HTTP);

    let scheduler = Scheduler::new();
    scheduler.register_endpoint(source.clone(), tcp_only.clone()).unwrap();
    scheduler.register_endpoint(source.clone(), http_only.clone()).unwrap();

    source.inject(Message::new(Level::HTTP, "h1")).await.unwrap();
    source.inject(Message::new(Level::TCP, "t1")).await.unwrap();
    source.inject(Message::new(Level::PACKET, "p1")).await.unwrap();
    source.inject(Message::new(Level::HTTP, "h2")).await.unwrap();

    eventually(|| http_only.len() == 2 && tcp_only.len() == 1).await;
    assert_eq!(tcp_only.received.lock()[0].raw(), "t1");

    // Rejections don't end the endpoints
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.endpoints().len(), 2);

    scheduler.close().await;
}

#[tokio::test]
async fn closed_output_ends_its_endpoint() {
    let source = input("src");
    let stats = Arc::new(StatService::new());
    let tcp: Arc<dyn Output> =
        Arc::new(TcpOutput::new(TcpOutputOptions::new("127.0.0.1:1"), stats, CancellationToken::new()));
    let recorder = RecordingOutput::new("rec", Level::ALL);

    let scheduler = Scheduler::new();
    scheduler.register_endpoint(source.clone(), Arc::clone(&tcp)).unwrap();
    let kept = scheduler.register_endpoint(source.clone(), recorder.clone()).unwrap();

    tcp.close().await;
    source.inject(Message::new(Level::TCP, "after close")).await.unwrap();

    eventually(|| scheduler.endpoints() == vec![kept]).await;
    assert_eq!(recorder.len(), 1);

    scheduler.close().await;
}

#[tokio::test]
async fn ended_inputs_let_the_scheduler_finish() {
    let source = input("ending");
    let recorder = RecordingOutput::new("rec", Level::ALL);

    let scheduler = Scheduler::new();
    scheduler.register_endpoint(source.clone(), recorder.clone()).unwrap();

    source.inject(Message::new(Level::HTTP, "last")).await.unwrap();
    source.close().await;

    tokio::time::timeout(Duration::from_secs(5), scheduler.join()).await.unwrap();
    assert_eq!(recorder.len(), 1);
    assert!(scheduler.endpoints().is_empty());
}

#[tokio::test]
async fn rejects_invalid_bindings() {
    let source = input("src");
    let recorder = RecordingOutput::new("rec", Level::ALL);

    let scheduler = Scheduler::new();
    scheduler.register_endpoint(source.clone(), recorder.clone()).unwrap();
    assert!(matches!(
        scheduler.register_endpoint(source.clone(), recorder.clone()),
        Err(SchedulerError::InvalidBinding(_))
    ));

    scheduler.close().await;
    assert!(matches!(
        scheduler.register_endpoint(source, recorder),
        Err(SchedulerError::InvalidBinding(_))
    ));
}
