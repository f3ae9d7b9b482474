use std::{error::Error, sync::Arc, time::Duration};

use futures::future::join_all;
use replay::{
    capture::{Filter, LiveOptions, LiveSource, PacketSource, PcapFileSource},
    CaptureInput, HttpOutput, Input, ListenerInput, Output, Scheduler, StatService,
    TcpOutput,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CaptureConfig, Config};

/// A running set of inputs and outputs bound by a scheduler.
pub(crate) struct App {
    scheduler: Scheduler,
    inputs: Vec<Arc<dyn Input>>,
    outputs: Vec<Arc<dyn Output>>,
    stats: Arc<StatService>,
    cancel: CancellationToken,
    drain_timeout: Duration,
}

impl App {
    /// Builds the outputs, then the inputs, and binds them. Fails if an input can't open its
    /// capture source or bind its listener.
    pub(crate) async fn start(config: &Config) -> Result<Self, Box<dyn Error>> {
        let cancel = CancellationToken::new();
        let stats = Arc::new(StatService::new());
        let capacity = config.queue_capacity;

        let mut outputs: Vec<Arc<dyn Output>> = Vec::new();
        if let Some(http) = &config.http_output {
            outputs.push(Arc::new(HttpOutput::new(http.options(capacity), Arc::clone(&stats), cancel.clone())?));
        }
        if let Some(tcp) = &config.tcp_output {
            outputs.push(Arc::new(TcpOutput::new(tcp.options(capacity), Arc::clone(&stats), cancel.clone())));
        }

        let mut inputs: Vec<Arc<dyn Input>> = Vec::new();
        if let Some(listener) = &config.listener {
            inputs.push(Arc::new(ListenerInput::bind(listener.options(capacity), &cancel).await?));
        }
        if let Some(capture) = &config.capture {
            let source = open_source(capture)?;
            let options = capture.options(config.assembly.options(), capacity);
            inputs.push(Arc::new(CaptureInput::start(source.name().to_string(), vec![source], options, &cancel)));
        }

        let scheduler = Scheduler::new();
        scheduler.bind_all(&inputs, &outputs)?;

        Ok(Self { scheduler, inputs, outputs, stats, cancel, drain_timeout: config.drain_timeout() })
    }

    /// Runs until a shutdown signal arrives or every input has ended, then shuts down.
    pub(crate) async fn run(self) {
        tokio::select! {
            _ = shutdown_signal() => info!("Shutdown signal received"),
            _ = self.scheduler.join() => info!("All inputs finished"),
        }

        self.shutdown().await;
    }

    async fn shutdown(self) {
        self.scheduler.close().await;
        join_all(self.inputs.iter().map(|input| input.close())).await;
        for input in &self.inputs {
            let dropped = input.dropped();
            if dropped > 0 {
                warn!(input = input.name(), dropped, "Outputs missed messages from a lagging subscription");
                self.stats.add(&format!("{} dropped", input.name()), dropped);
            }
        }

        let drain = join_all(self.outputs.iter().map(|output| output.close()));
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(timeout = ?self.drain_timeout, "Outputs did not drain in time, stopping them");
            self.cancel.cancel();
            join_all(self.outputs.iter().map(|output| output.close())).await;
        }
        self.cancel.cancel();

        println!("{}", self.stats.summarize());
    }
}

fn open_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>, Box<dyn Error>> {
    let filter = match &config.filter {
        Some(expr) => Filter::parse(expr)?,
        None => Filter::default(),
    };

    let source: Box<dyn PacketSource> = match (&config.pcap_file, &config.device) {
        (Some(path), _) => Box::new(PcapFileSource::open(path)?.filtered(filter)),
        (None, Some(device)) => {
            let mut options = LiveOptions::default().device(device.clone()).promiscuous(config.promiscuous);
            if let Some(size) = config.buffer_size {
                options = options.buffer_size(size);
            }
            Box::new(LiveSource::open(options)?.filtered(filter))
        }
        (None, None) => return Err("capture needs a device or a pcap_file".into()),
    };

    Ok(source)
}

/// Resolves on SIGINT, and on SIGTERM or SIGQUIT on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(mut term), Ok(mut quit)) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                    _ = quit.recv() => {}
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(err = ?e, "Failed to install signal handlers, only listening for ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(err = ?e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
