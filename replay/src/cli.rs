use std::path::PathBuf;

use clap::Parser;
use replay::capture::ALL_DEVICES;

use crate::config::{CaptureConfig, Config, HttpOutputConfig, ListenerConfig, TcpOutputConfig};

/// Capture HTTP and TCP traffic and replay it to other destinations.
#[derive(Debug, Parser)]
#[command(name = "replay", version, about)]
pub(crate) struct Cli {
    /// Config file. Defaults to the first of ./replay.toml, ~/.config/replay/config.toml and
    /// /etc/replay/config.toml that exists.
    #[arg(short, long, env = "REPLAY_CONFIG", value_name = "PATH")]
    pub(crate) config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub(crate) debug: bool,

    /// Accept requests on an HTTP listener bound to this port.
    #[arg(long, value_name = "PORT")]
    pub(crate) input_http: Option<u16>,

    /// Capture TCP traffic to this port on every network interface.
    #[arg(long, value_name = "PORT", conflicts_with = "input_file")]
    pub(crate) input_raw: Option<u16>,

    /// Read captured traffic from a pcap file.
    #[arg(long, value_name = "PCAP")]
    pub(crate) input_file: Option<PathBuf>,

    /// Replay HTTP requests to this base URL.
    #[arg(long, value_name = "URL")]
    pub(crate) output_http: Option<String>,

    /// Forward raw TCP payloads to this address.
    #[arg(long, value_name = "ADDR")]
    pub(crate) output_tcp: Option<String>,

    /// Number of HTTP output workers. 0 means twice the available parallelism.
    #[arg(long, value_name = "N")]
    pub(crate) workers: Option<usize>,
}

impl Cli {
    /// Overrides the file configuration with the command line flags.
    pub(crate) fn apply(&self, config: &mut Config) {
        if let Some(port) = self.input_http {
            let listener = config.listener.get_or_insert_with(|| ListenerConfig::on_port(port));
            listener.port = port;
        }

        if let Some(port) = self.input_raw {
            config.capture = Some(CaptureConfig {
                device: Some(ALL_DEVICES.to_string()),
                filter: Some(format!("tcp and dst port {port}")),
                ..Default::default()
            });
        }

        if let Some(path) = &self.input_file {
            let filter = config.capture.take().and_then(|c| c.filter);
            config.capture = Some(CaptureConfig { pcap_file: Some(path.clone()), filter, ..Default::default() });
        }

        if let Some(url) = &self.output_http {
            match &mut config.http_output {
                Some(output) => output.redirect_url = url.clone(),
                None => config.http_output = Some(HttpOutputConfig::new(url.clone())),
            }
        }

        if let (Some(workers), Some(output)) = (self.workers, config.http_output.as_mut()) {
            output.workers = workers;
        }

        if let Some(addr) = &self.output_tcp {
            match &mut config.tcp_output {
                Some(output) => output.addr = addr.clone(),
                None => config.tcp_output = Some(TcpOutputConfig::new(addr.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("replay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_build_a_configuration() {
        let cli = parse(&["--input-raw", "8080", "--output-http", "http://staging:9999/", "--workers", "3"]);

        let mut config = Config::default();
        cli.apply(&mut config);
        config.validate().unwrap();

        let capture = config.capture.unwrap();
        assert_eq!(capture.device.as_deref(), Some(ALL_DEVICES));
        assert_eq!(capture.filter.as_deref(), Some("tcp and dst port 8080"));

        let http = config.http_output.unwrap();
        assert_eq!(http.redirect_url, "http://staging:9999/");
        assert_eq!(http.workers, 3);
    }

    #[test]
    fn flags_override_the_file() {
        let mut config = Config::parse(
            r#"
            [listener]
            port = 1
            path = "/in"

            [tcp_output]
            addr = "old:1"
            retry_attempts = 3
            "#,
        )
        .unwrap();

        parse(&["--input-http", "2", "--output-tcp", "new:2"]).apply(&mut config);

        let listener = config.listener.unwrap();
        assert_eq!(listener.port, 2);
        assert_eq!(listener.path, "/in");

        let tcp = config.tcp_output.unwrap();
        assert_eq!(tcp.addr, "new:2");
        assert_eq!(tcp.retry_attempts, 3);
    }

    #[test]
    fn raw_and_file_inputs_conflict() {
        let res = Cli::try_parse_from(["replay", "--input-raw", "80", "--input-file", "a.pcap"]);
        assert!(res.is_err());
    }
}
