use std::{
    io,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use async_trait::async_trait;
use futures::StreamExt;
use replay_common::constants::DEFAULT_QUEUE_CAPACITY;
use replay_wire::{Level, Message};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::Intake;
use crate::{ExponentialBackoff, Outcome, Output, OutputError, StatEntry, StatService};

/// Outcome label of a successful forward.
pub(crate) const FORWARDED: &str = "tcp forwarded";
/// Outcome label of a message dropped after its retries ran out.
pub(crate) const RETRIES_EXHAUSTED: &str = "tcp forward retries exhausted";

/// A connection the TCP output writes one message to.
pub type DialedStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens connections to the forward destination.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> io::Result<DialedStream>;
}

/// Dials plain TCP with `TCP_NODELAY` set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
    async fn dial(&self, addr: &str) -> io::Result<DialedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone)]
pub struct TcpOutputOptions {
    /// Destination, as `host:port`.
    pub addr: String,
    /// Retries per message after the first attempt. `None` retries forever.
    pub retry_attempts: Option<usize>,
    /// Backoff before the first retry. Doubles with every retry.
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
}

impl TcpOutputOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            retry_attempts: Some(8),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn retry_attempts(mut self, attempts: Option<usize>) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Forwards TCP level messages verbatim to a fixed destination, one connection per message.
#[derive(Debug)]
pub struct TcpOutput {
    intake: Intake,
}

impl TcpOutput {
    pub fn new(options: TcpOutputOptions, stats: Arc<StatService>, cancel: CancellationToken) -> Self {
        Self::with_dialer(options, TokioDialer, stats, cancel)
    }

    /// Creates the output with a custom [`Dialer`] and starts its worker.
    pub fn with_dialer<D: Dialer>(
        options: TcpOutputOptions,
        dialer: D,
        stats: Arc<StatService>,
        cancel: CancellationToken,
    ) -> Self {
        let intake = Intake::new(format!("tcp -> {}", options.addr), Level::TCP, options.queue_capacity, cancel.clone());

        let forwarder = Arc::new(Forwarder { dialer, options, stats, cancel });
        intake.spawn_worker(0, move |msg| {
            let forwarder = Arc::clone(&forwarder);
            async move { forwarder.forward(msg).await }
        });

        info!(output = intake.name(), "Started TCP output");

        Self { intake }
    }
}

#[async_trait]
impl Output for TcpOutput {
    fn name(&self) -> &str {
        self.intake.name()
    }

    fn level(&self) -> Level {
        self.intake.level()
    }

    async fn write(&self, msg: Message) -> Result<(), OutputError> {
        self.intake.push(msg).await
    }

    async fn close(&self) {
        self.intake.close().await;
    }
}

struct Forwarder<D> {
    dialer: D,
    options: TcpOutputOptions,
    stats: Arc<StatService>,
    cancel: CancellationToken,
}

impl<D: Dialer> Forwarder<D> {
    /// Delivers the message, retrying in place with exponential backoff.
    async fn forward(&self, msg: Message) {
        let target = format!("tcp://{}", self.options.addr);
        let started_at = SystemTime::now();
        let start = Instant::now();

        let mut backoff = ExponentialBackoff::new(self.options.backoff, self.options.retry_attempts)
            .max_backoff(self.options.max_backoff);

        loop {
            match self.deliver(msg.raw()).await {
                Ok(()) => {
                    trace!(%target, bytes = msg.len(), retries = backoff.retry_count(), "Forwarded message");
                    self.stats.record(StatEntry::new(target, Outcome::Done(FORWARDED), started_at, start.elapsed()));
                    return;
                }
                Err(e) => {
                    debug!(err = ?e, %target, attempt = backoff.retry_count() + 1, "Forward failed, backing off");
                }
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(%target, "Stopping retries, output cancelled");
                    return;
                }
                next = backoff.next() => next,
            };

            if next.is_none() {
                error!(%target, retries = backoff.retry_count(), bytes = msg.len(), "Retries exhausted, dropping message");
                self.stats.record(StatEntry::new(
                    target,
                    Outcome::Failed(RETRIES_EXHAUSTED.to_string()),
                    started_at,
                    start.elapsed(),
                ));
                return;
            }
        }
    }

    async fn deliver(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = self.dialer.dial(&self.options.addr).await?;
        stream.write_all(data).await?;
        stream.shutdown().await
    }
}
