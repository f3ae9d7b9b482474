use std::time::Duration;

use replay_capture::Packet;
use replay_common::CaptureClock;
use replay_wire::{http::RequestCodec, Message};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{decoder::DecoderFactory, Assembler, AssemblyOptions, AssemblyStats};

/// Handle to a running assembly driver.
#[derive(Debug)]
pub struct AssemblyHandle {
    task: JoinHandle<AssemblyStats>,
}

impl AssemblyHandle {
    /// Waits for the driver to finish and returns its final counters.
    pub async fn join(self) -> AssemblyStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(err = ?e, "Assembly driver failed");
                AssemblyStats::default()
            }
        }
    }

    /// Returns `true` once the driver has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns the assembly driver.
///
/// The driver feeds packets from `packets` into an [`Assembler`] whose half streams are decoded
/// into messages sent to `out`. Everything decoded from a packet is sent before the next packet
/// is taken, so a full `out` holds back the packet channel and, through it, the packet sources.
/// Idle connections are flushed every `flush_interval`, measured against capture time. When
/// `packets` closes, remaining streams are flushed and their messages sent before the driver
/// finishes. Cancelling `cancel` stops everything immediately.
pub fn spawn_assembly(
    packets: mpsc::Receiver<Packet>,
    out: mpsc::Sender<Message>,
    options: AssemblyOptions,
    codec: RequestCodec,
    cancel: CancellationToken,
) -> AssemblyHandle {
    let (factory, outbox) = DecoderFactory::new(codec);
    let assembler = Assembler::new(factory, &options);
    let task = tokio::spawn(run(assembler, outbox, packets, out, options, cancel));

    AssemblyHandle { task }
}

async fn run(
    mut assembler: Assembler<DecoderFactory>,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    mut packets: mpsc::Receiver<Packet>,
    out: mpsc::Sender<Message>,
    options: AssemblyOptions,
    cancel: CancellationToken,
) -> AssemblyStats {
    let period = options.flush_interval.max(Duration::from_millis(1));
    let mut flush = interval_at(Instant::now() + period, period);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut clock = CaptureClock::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Assembly driver cancelled");
                return assembler.stats().clone();
            }
            _ = flush.tick() => {
                let flushed = assembler.flush_idle(clock.cutoff(options.retention));
                if flushed > 0 {
                    debug!(flushed, remaining = assembler.len(), "Flushed idle connections");
                }
            }
            packet = packets.recv() => {
                let Some(packet) = packet else {
                    break;
                };

                clock.observe(packet.timestamp_nanos());
                if let Err(e) = assembler.submit(&packet) {
                    debug!(err = ?e, %packet, "Dropping packet");
                }
            }
        }

        if !forward(&mut outbox, &out, &cancel).await {
            debug!("Assembly driver cancelled");
            return assembler.stats().clone();
        }
    }

    assembler.flush_all();
    forward(&mut outbox, &out, &cancel).await;

    let stats = assembler.stats().clone();
    info!(
        packets = stats.packets,
        malformed = stats.malformed,
        delivered_bytes = stats.delivered_bytes,
        skipped_bytes = stats.skipped_bytes,
        "Packet input exhausted"
    );

    stats
}

/// Sends the decoded messages downstream, waiting for room. Returns `false` if cancelled.
async fn forward(
    outbox: &mut mpsc::UnboundedReceiver<Message>,
    out: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
) -> bool {
    while let Ok(msg) = outbox.try_recv() {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return false,
            res = out.send(msg) => {
                if res.is_err() {
                    // Nobody downstream anymore
                    while outbox.try_recv().is_ok() {}
                    return true;
                }
            }
        }
    }

    true
}
