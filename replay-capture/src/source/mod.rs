use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{CaptureError, Filter, Packet};

mod file;
pub use file::PcapFileSource;

mod live;
pub use live::{LiveOptions, LiveSource, ALL_DEVICES};

/// A blocking source of captured packets.
pub trait PacketSource: Send + 'static {
    /// A human readable name for logging (device name or file path).
    fn name(&self) -> &str;

    /// Reads the next packet. Returns `None` once the source is exhausted.
    ///
    /// Live sources return [`CaptureError::Timeout`] periodically when idle, so callers get a
    /// chance to observe cancellation.
    fn next_packet(&mut self) -> Option<Result<Packet, CaptureError>>;

    /// Wraps the source so that only packets matching `filter` are returned.
    fn filtered(self, filter: Filter) -> Filtered<Self>
    where
        Self: Sized,
    {
        Filtered { inner: self, filter }
    }
}

impl PacketSource for Box<dyn PacketSource> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn next_packet(&mut self) -> Option<Result<Packet, CaptureError>> {
        (**self).next_packet()
    }
}

/// A [`PacketSource`] that drops packets not matching a [`Filter`].
#[derive(Debug)]
pub struct Filtered<S> {
    inner: S,
    filter: Filter,
}

impl<S: PacketSource> PacketSource for Filtered<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn next_packet(&mut self) -> Option<Result<Packet, CaptureError>> {
        loop {
            match self.inner.next_packet()? {
                Ok(packet) if !self.filter.matches(&packet) => continue,
                other => return Some(other),
            }
        }
    }
}

/// Drives a [`PacketSource`] on the blocking thread pool, forwarding packets into `tx`.
///
/// The task ends when the source is exhausted, the receiver is dropped, the token is cancelled,
/// or the source fails with a non-transient error. It resolves to the number of packets
/// forwarded.
pub fn spawn_source<S: PacketSource>(
    mut source: S,
    tx: mpsc::Sender<Packet>,
    cancel: CancellationToken,
) -> JoinHandle<Result<u64, CaptureError>> {
    tokio::task::spawn_blocking(move || {
        let mut forwarded = 0;

        while !cancel.is_cancelled() {
            match source.next_packet() {
                Some(Ok(packet)) => {
                    trace!(source = source.name(), %packet, "Captured packet");
                    if tx.blocking_send(packet).is_err() {
                        debug!(source = source.name(), "Packet receiver dropped, stopping source");
                        break;
                    }
                    forwarded += 1;
                }
                Some(Err(e)) if e.is_transient() => continue,
                Some(Err(e)) => {
                    error!(source = source.name(), err = ?e, "Capture source failed");
                    return Err(e);
                }
                None => {
                    debug!(source = source.name(), forwarded, "Capture source exhausted");
                    break;
                }
            }
        }

        Ok(forwarded)
    })
}
