use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use replay_assembly::{spawn_assembly, AssemblyHandle, AssemblyOptions};
use replay_capture::{spawn_source, CaptureError, PacketSource};
use replay_common::constants::DEFAULT_QUEUE_CAPACITY;
use replay_wire::{
    http::{RequestCodec, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES},
    Message,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{Delivery, Input, InputError, InputHub, Subscription};

/// Settings of a [`CaptureInput`].
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Reassembler settings.
    pub assembly: AssemblyOptions,
    /// Capacity of the packet queue and of every subscriber's buffer.
    pub queue_capacity: usize,
    /// Requests with a larger header section are skipped.
    pub max_header_bytes: usize,
    /// Requests with a larger body are skipped.
    pub max_body_bytes: usize,
    /// What happens when a subscriber falls behind. Lossless by default, which paces file
    /// replays to the slowest endpoint.
    pub delivery: Delivery,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            assembly: AssemblyOptions::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            delivery: Delivery::Lossless,
        }
    }
}

impl CaptureOptions {
    /// Sets the reassembler settings.
    pub fn assembly(mut self, assembly: AssemblyOptions) -> Self {
        self.assembly = assembly;
        self
    }

    /// Sets the capacity of the packet queue and of every subscriber's buffer.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the header section limit.
    pub fn max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    /// Sets the body limit.
    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Sets the delivery policy.
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }
}

/// An input producing the TCP and HTTP messages reassembled from captured packets.
///
/// Every packet source runs on its own blocking thread. All of them feed a single reassembler.
/// With lossless delivery, a subscriber that falls behind holds back the reassembler and, through
/// the packet queue, the sources. Once every source is exhausted, the remaining streams are
/// flushed and the input ends by itself. An input started without sources only carries injected messages and stays open until
/// closed.
#[derive(Debug)]
pub struct CaptureInput {
    hub: Arc<InputHub>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureInput {
    /// Starts capturing from `sources`. Must be called from within a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        sources: Vec<Box<dyn PacketSource>>,
        options: CaptureOptions,
        cancel: &CancellationToken,
    ) -> Self {
        let hub = Arc::new(InputHub::new(name, options.queue_capacity).with_delivery(options.delivery));
        let cancel = cancel.child_token();
        let capacity = options.queue_capacity.max(1);
        let (packets_tx, packets_rx) = mpsc::channel(capacity);

        let source_count = sources.len();
        let names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
        let readers: Vec<_> = sources
            .into_iter()
            .map(|source| spawn_source(source, packets_tx.clone(), cancel.clone()))
            .collect();
        drop(packets_tx);

        let codec = RequestCodec::new()
            .max_header_bytes(options.max_header_bytes)
            .max_body_bytes(options.max_body_bytes);
        let (messages_tx, messages_rx) = mpsc::channel(capacity);
        let assembly = spawn_assembly(packets_rx, messages_tx, options.assembly, codec, cancel.clone());

        info!(input = hub.name(), sources = ?names, delivery = ?options.delivery, "Started capture input");

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&hub),
            names,
            readers,
            assembly,
            messages_rx,
            cancel.clone(),
            source_count > 0,
        ));

        Self { hub, cancel, supervisor: Mutex::new(Some(supervisor)) }
    }
}

/// Publishes the reassembled messages into the hub while waiting for the readers and the
/// reassembler, then ends the input if it had sources.
async fn supervise(
    hub: Arc<InputHub>,
    names: Vec<String>,
    readers: Vec<JoinHandle<Result<u64, CaptureError>>>,
    assembly: AssemblyHandle,
    mut messages: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    close_when_done: bool,
) {
    let publish = async {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = messages.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = hub.publish(msg) => {}
            }
        }
    };

    let finish = async {
        for (name, reader) in names.iter().zip(readers) {
            match reader.await {
                Ok(Ok(packets)) => info!(source = %name, packets, "Packet source finished"),
                Ok(Err(e)) => error!(source = %name, err = ?e, "Packet source failed"),
                Err(e) => error!(source = %name, err = ?e, "Packet reader panicked"),
            }
        }
        assembly.join().await
    };

    let ((), stats) = tokio::join!(publish, finish);
    info!(input = hub.name(), ?stats, dropped = hub.dropped(), "Reassembly finished");

    if close_when_done {
        hub.close();
    }
}

#[async_trait]
impl Input for CaptureInput {
    fn name(&self) -> &str {
        self.hub.name()
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    async fn inject(&self, msg: Message) -> Result<(), InputError> {
        if self.hub.is_closed() {
            return Err(InputError::Closed);
        }
        self.hub.publish(msg).await;
        Ok(())
    }

    fn dropped(&self) -> u64 {
        self.hub.dropped()
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.hub.close();

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }
}
