#![doc(issue_tracker_base_url = "https://github.com/xy1884/traffic-replay/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! TCP stream reassembly.
//!
//! The [`Assembler`] turns captured [`Packet`](replay_capture::Packet)s into ordered byte
//! streams, one per direction of every TCP connection, and hands them to a [`StreamFactory`].
//! [`spawn_assembly`] drives an assembler from a packet channel and decodes the client halves
//! of each connection into HTTP request [`Message`](replay_wire::Message)s.

use std::time::Duration;

use thiserror::Error;

mod assembler;
pub use assembler::{Assembler, AssemblyStats, StreamFactory, StreamSink};

mod connection;
pub use connection::{ConnectionKey, Flow};

mod decoder;

mod driver;
pub use driver::{spawn_assembly, AssemblyHandle};

mod half;

/// Errors raised while reassembling.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),
}

/// Tuning knobs of the reassembler and its driver.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    /// How often idle connections are flushed.
    pub flush_interval: Duration,
    /// Connections without activity for this long (in capture time) are discarded on flush.
    pub retention: Duration,
    /// Maximum out-of-order segments buffered per direction before gaps are skipped.
    pub max_buffered_segments: usize,
    /// How long (in capture time) a segment may wait for missing data before gaps are skipped.
    pub reorder_window: Duration,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            retention: Duration::from_secs(120),
            max_buffered_segments: 1024,
            reorder_window: Duration::from_millis(1000),
        }
    }
}

impl AssemblyOptions {
    /// Sets how often idle connections are flushed.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets how long an idle connection is kept.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets how many out-of-order segments a direction may buffer.
    pub fn max_buffered_segments(mut self, max: usize) -> Self {
        self.max_buffered_segments = max;
        self
    }

    /// Sets how long a segment may wait for missing data.
    pub fn reorder_window(mut self, window: Duration) -> Self {
        self.reorder_window = window;
        self
    }
}
