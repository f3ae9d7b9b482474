use std::sync::Arc;

use parking_lot::RwLock;
use replay_wire::{Level, Message};
use tokio::sync::{mpsc, Mutex};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

use crate::OutputError;

mod http;
pub use self::http::{HttpClientOptions, HttpOutput, HttpOutputOptions, ProxyOptions};

mod tcp;
pub use tcp::{DialedStream, Dialer, TcpOutput, TcpOutputOptions, TokioDialer};

/// The intake queue of an output, shared by its workers.
///
/// Writers wait while the queue is full. Closing drops the sending side, so workers drain what
/// is queued and then see the end of the queue.
#[derive(Debug)]
pub(crate) struct Intake {
    name: String,
    level: Level,
    tx: RwLock<Option<mpsc::Sender<Message>>>,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    workers: TaskTracker,
    cancel: CancellationToken,
}

impl Intake {
    pub(crate) fn new(name: impl Into<String>, level: Level, capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            level,
            tx: RwLock::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            workers: TaskTracker::new(),
            cancel,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn level(&self) -> Level {
        self.level
    }

    /// Spawns a worker calling `handle` for every message until the queue ends or the stopping
    /// signal is raised.
    pub(crate) fn spawn_worker<H, Fut>(&self, id: usize, mut handle: H)
    where
        H: FnMut(Message) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let rx = Arc::clone(&self.rx);
        let cancel = self.cancel.clone();
        let name = self.name.clone();

        self.workers.spawn(async move {
            while let Some(msg) = next_message(&rx, &cancel).await {
                handle(msg).await;
            }
            debug!(output = %name, worker = id, "Worker exited");
        });
    }

    pub(crate) async fn push(&self, msg: Message) -> Result<(), OutputError> {
        if !msg.level().is_subset_of(self.level) {
            return Err(OutputError::LevelMismatch { level: msg.level(), accepted: self.level });
        }

        // Don't hold the lock across the send
        let tx = self.tx.read().clone().ok_or(OutputError::Closed)?;
        tx.send(msg).await.map_err(|_| OutputError::Closed)
    }

    /// Stops accepting messages and waits for the workers to drain the queue.
    pub(crate) async fn close(&self) {
        if self.tx.write().take().is_some() {
            debug!(output = %self.name, "Closing output, draining queue");
        }
        self.workers.close();
        self.workers.wait().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }
}

async fn next_message(rx: &Mutex<mpsc::Receiver<Message>>, cancel: &CancellationToken) -> Option<Message> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        msg = async { rx.lock().await.recv().await } => msg,
    }
}
