use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;

use app::App;
use cli::Cli;
use config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let (mut config, path) = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    info!(
        config = ?path,
        listener = ?config.listener.as_ref().map(|l| l.port),
        capture = config.capture.is_some(),
        http_output = ?config.http_output.as_ref().map(|o| &o.redirect_url),
        tcp_output = ?config.tcp_output.as_ref().map(|o| &o.addr),
        "Starting replay"
    );

    App::start(&config).await?.run().await;

    info!("Replay exited");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .try_init();
}
