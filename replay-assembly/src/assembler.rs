use bytes::Bytes;
use replay_capture::Packet;
use replay_common::duration_nanos;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    half::{HalfStream, Limits},
    AssemblyError, AssemblyOptions, ConnectionKey, Flow,
};

/// Receives the reassembled bytes of one direction of a connection.
pub trait StreamSink {
    /// Called with in-order bytes, in stream order.
    fn reassembled(&mut self, data: Bytes);

    /// Called when `bytes` missing bytes were skipped over.
    fn skipped(&mut self, bytes: u64) {
        let _ = bytes;
    }

    /// Called once when the stream ends, either closed by FIN/RST or discarded.
    fn finished(&mut self);
}

/// Creates a [`StreamSink`] for every new half stream.
pub trait StreamFactory {
    /// The sink created for every half stream.
    type Sink: StreamSink;

    /// Creates the sink of the half stream `flow` travels on.
    fn new_stream(&mut self, key: &ConnectionKey, flow: Flow) -> Self::Sink;
}

/// Counters maintained by an [`Assembler`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssemblyStats {
    /// Packets submitted.
    pub packets: u64,
    /// Packets rejected as malformed.
    pub malformed: u64,
    /// Segments that carried no new bytes.
    pub duplicates: u64,
    /// Segments received after their half stream closed.
    pub late_segments: u64,
    /// In-order bytes handed to sinks.
    pub delivered_bytes: u64,
    /// Missing bytes jumped over.
    pub skipped_bytes: u64,
    /// Buffered segments dropped when an idle stream was discarded.
    pub abandoned_segments: u64,
    /// Connections discarded for being idle.
    pub flushed_connections: u64,
}

#[derive(Debug)]
struct Connection<S> {
    halves: [Option<HalfStream<S>>; 2],
    /// Capture time of the last packet seen in either direction.
    last_seen: u64,
}

impl<S: StreamSink> Connection<S> {
    /// A direction that never carried a stream counts as closed.
    fn is_closed(&self) -> bool {
        self.halves.iter().all(|half| half.as_ref().map_or(true, HalfStream::is_closed))
    }
}

/// Reassembles TCP connections from captured packets.
///
/// Each connection is tracked as two independent half streams. A half stream anchors on its SYN;
/// one whose SYN was never seen buffers segments until it can anchor on the lowest one (FIN or
/// RST seen, too many segments buffered, the reorder window expired, or an explicit flush).
pub struct Assembler<F: StreamFactory> {
    factory: F,
    limits: Limits,
    connections: FxHashMap<ConnectionKey, Connection<F::Sink>>,
    stats: AssemblyStats,
}

impl<F: StreamFactory> std::fmt::Debug for Assembler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("connections", &self.connections.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<F: StreamFactory> Assembler<F> {
    /// Creates an assembler handing new half streams to `factory`.
    pub fn new(factory: F, options: &AssemblyOptions) -> Self {
        Self {
            factory,
            limits: Limits {
                max_buffered_segments: options.max_buffered_segments,
                reorder_window_nanos: duration_nanos(options.reorder_window),
            },
            connections: FxHashMap::default(),
            stats: AssemblyStats::default(),
        }
    }

    /// Routes a packet to its connection and delivers any bytes that became contiguous.
    pub fn submit(&mut self, packet: &Packet) -> Result<(), AssemblyError> {
        self.stats.packets += 1;

        let Some((source, destination)) = packet.endpoints() else {
            self.stats.malformed += 1;
            return Err(AssemblyError::MalformedPacket(if packet.network().is_none() {
                "no network layer"
            } else {
                "no TCP layer"
            }));
        };
        let Some(segment) = packet.transport() else {
            self.stats.malformed += 1;
            return Err(AssemblyError::MalformedPacket("no TCP layer"));
        };

        let flow = Flow::new(source, destination);
        let key = ConnectionKey::from(flow);
        let side = key.side(&flow);
        let now = packet.timestamp_nanos();

        let opens_stream = !segment.payload.is_empty()
            || segment.flags.syn
            || segment.flags.fin
            || segment.flags.rst;

        if !self.connections.contains_key(&key) {
            // Bare ACKs don't start tracking
            if !opens_stream {
                return Ok(());
            }
            trace!(conn = %key, "New connection");
            self.connections.insert(key, Connection { halves: [None, None], last_seen: now });
        }
        let Some(connection) = self.connections.get_mut(&key) else {
            return Ok(());
        };
        connection.last_seen = connection.last_seen.max(now);

        let slot = &mut connection.halves[side];
        if slot.is_none() {
            if !opens_stream {
                return Ok(());
            }
            *slot = Some(HalfStream::new(self.factory.new_stream(&key, flow)));
        }
        if let Some(half) = slot {
            half.push(segment, now, self.limits, &mut self.stats);
        }

        if connection.is_closed() {
            trace!(conn = %key, "Connection closed");
            self.connections.remove(&key);
        }

        Ok(())
    }

    /// Discards connections whose last activity is older than `cutoff_nanos` (capture time),
    /// abandoning their undelivered bytes. Live connections are left alone, their gaps are only
    /// skipped by the reorder window. Returns the number of connections discarded.
    pub fn flush_idle(&mut self, cutoff_nanos: u64) -> usize {
        let before = self.connections.len();
        let stats = &mut self.stats;

        self.connections.retain(|key, connection| {
            if connection.last_seen >= cutoff_nanos {
                return true;
            }

            trace!(conn = %key, "Discarding idle connection");
            for half in connection.halves.iter_mut().flatten() {
                half.abandon(stats);
            }
            false
        });

        let flushed = before - self.connections.len();
        self.stats.flushed_connections += flushed as u64;
        flushed
    }

    /// Delivers everything still buffered, skipping gaps, then closes every stream.
    pub fn flush_all(&mut self) {
        for (_, mut connection) in self.connections.drain() {
            for half in connection.halves.iter_mut().flatten() {
                half.flush(&mut self.stats);
                half.abandon(&mut self.stats);
            }
        }
    }

    /// Returns `true` if the connection is being tracked.
    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    /// Returns the number of tracked connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if no connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns the counters.
    pub fn stats(&self) -> &AssemblyStats {
        &self.stats
    }

    /// Returns the stream factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }
}
