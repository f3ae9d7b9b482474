#![doc(issue_tracker_base_url = "https://github.com/xy1884/traffic-replay/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Adapters moving [`Message`]s from inputs to outputs.
//!
//! An [`Input`] produces messages, an [`Output`] consumes the ones whose [`Level`] it accepts.
//! The [`Scheduler`] binds every input to every output through an endpoint, each with its own
//! subscription and routing task. Outputs report the outcome of every replay attempt to a
//! shared [`StatService`].

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use replay_capture::CaptureError;
use replay_wire::{Level, Message};
use thiserror::Error;

mod backoff;
pub use backoff::ExponentialBackoff;

mod hub;
pub use hub::{Delivery, InputHub, Subscription};

pub mod input;
pub use input::{CaptureInput, CaptureOptions, ListenerInput, ListenerOptions};

pub mod output;
pub use output::{
    DialedStream, Dialer, HttpClientOptions, HttpOutput, HttpOutputOptions, ProxyOptions,
    TcpOutput, TcpOutputOptions, TokioDialer,
};

mod scheduler;
pub use scheduler::{EndpointId, Scheduler};

mod stats;
pub use stats::{Outcome, StatEntry, StatService};

/// Errors raised by inputs.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("Input does not accept injected messages")]
    Unsupported,
    #[error("Input closed")]
    Closed,
}

/// Errors raised by outputs.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Message level {level} not accepted (accepts {accepted})")]
    LevelMismatch { level: Level, accepted: Level },
    #[error("Output closed")]
    Closed,
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Errors raised by the [`Scheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid binding: {0}")]
    InvalidBinding(&'static str),
}

/// A producer of [`Message`]s.
///
/// Inputs are multicast: every [`Subscription`] sees every message published after it was
/// created. The sequence is lazy and cannot be restarted.
#[async_trait]
pub trait Input: Send + Sync + 'static {
    /// A name for logging.
    fn name(&self) -> &str;

    /// Subscribes to the messages produced from now on.
    fn subscribe(&self) -> Subscription;

    /// Injects a message as if the input had produced it. Waits like the input's own messages
    /// do when subscribers are full.
    async fn inject(&self, msg: Message) -> Result<(), InputError> {
        let _ = msg;
        Err(InputError::Unsupported)
    }

    /// Number of messages subscribers missed because their buffer was full.
    fn dropped(&self) -> u64 {
        0
    }

    /// Stops producing. Subscriptions end once messages already produced are consumed.
    async fn close(&self);
}

/// A consumer of [`Message`]s.
#[async_trait]
pub trait Output: Send + Sync + 'static {
    /// A name for logging.
    fn name(&self) -> &str;

    /// The set of levels this output accepts.
    fn level(&self) -> Level;

    /// Queues a message. Waits while the intake queue is full.
    ///
    /// Fails with [`OutputError::LevelMismatch`] if the message level is not a subset of
    /// [`Output::level`], and with [`OutputError::Closed`] once the output is closed.
    async fn write(&self, msg: Message) -> Result<(), OutputError>;

    /// Stops accepting messages, processes everything already queued and waits for the
    /// workers to exit.
    async fn close(&self);
}
