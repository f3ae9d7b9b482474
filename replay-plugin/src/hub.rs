use std::{
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use replay_wire::Message;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{trace, warn};

/// What publishing does when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Wait for room in every buffer. Nothing is lost and the slowest subscriber sets the pace.
    #[default]
    Lossless,
    /// Wait only while there is a single subscriber. With more, a full subscriber misses the
    /// message so it can't hold back the others.
    Isolated,
}

/// Fan-out point of an input. Every subscriber gets its own bounded receive buffer.
#[derive(Debug)]
pub struct InputHub {
    name: String,
    capacity: usize,
    delivery: Delivery,
    /// `None` once closed.
    subscribers: Mutex<Option<Vec<mpsc::Sender<Message>>>>,
    dropped: AtomicU64,
}

impl InputHub {
    /// Creates a lossless hub whose subscribers buffer up to `capacity` messages each.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            delivery: Delivery::default(),
            subscribers: Mutex::new(Some(Vec::new())),
            dropped: AtomicU64::new(0),
        }
    }

    /// Sets the delivery policy.
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// The name of the input, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes a message to every current subscriber, waiting for room as the delivery policy
    /// says. Returns the number of subscribers it was delivered to.
    pub async fn publish(&self, msg: Message) -> usize {
        let subscribers = match self.subscribers.lock().as_ref() {
            Some(subscribers) => subscribers.clone(),
            None => return 0,
        };

        let wait = match self.delivery {
            Delivery::Lossless => true,
            Delivery::Isolated => subscribers.len() == 1,
        };

        let mut delivered = 0;
        let mut gone = false;
        for tx in &subscribers {
            if wait {
                match tx.send(msg.clone()).await {
                    Ok(()) => delivered += 1,
                    Err(_) => gone = true,
                }
                continue;
            }

            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => self.record_drop(),
                Err(TrySendError::Closed(_)) => gone = true,
            }
        }

        if gone {
            if let Some(subscribers) = self.subscribers.lock().as_mut() {
                subscribers.retain(|tx| !tx.is_closed());
            }
        }

        delivered
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 {
            warn!(input = %self.name, "Subscriber buffer full, dropping messages for it");
        } else {
            trace!(input = %self.name, dropped, "Subscriber buffer full, message dropped");
        }
    }

    /// Subscribes to the messages published from now on. Subscribing to a closed hub returns a
    /// subscription that has already ended.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.push(tx);
        }

        Subscription { input: self.name.clone(), inner: ReceiverStream::new(rx) }
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().as_ref().map_or(0, |subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Returns the buffer size of every subscriber.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of messages subscribers missed because their buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ends every subscription once the messages already buffered are consumed.
    pub fn close(&self) {
        self.subscribers.lock().take();
    }

    /// Returns `true` once the hub is closed.
    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().is_none()
    }
}

/// A subscription to an input.
pub struct Subscription {
    input: String,
    inner: ReceiverStream<Message>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("input", &self.input).finish_non_exhaustive()
    }
}

impl Subscription {
    /// Waits for the next message. Returns `None` once the input has closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}
