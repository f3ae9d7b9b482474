//! TOML configuration.
//!
//! Every adapter section is optional and an absent section disables the adapter. The command line
//! is applied on top.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use replay::{
    assembly::AssemblyOptions, common::constants::DEFAULT_QUEUE_CAPACITY, http::DEFAULT_MAX_BODY_BYTES,
    CaptureOptions, Delivery, HttpClientOptions, HttpOutputOptions, ListenerOptions, ProxyOptions,
    TcpOutputOptions,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default = "default_queue_capacity")]
    pub(crate) queue_capacity: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub(crate) drain_timeout_ms: u64,
    pub(crate) listener: Option<ListenerConfig>,
    pub(crate) capture: Option<CaptureConfig>,
    #[serde(default)]
    pub(crate) assembly: AssemblyConfig,
    pub(crate) http_output: Option<HttpOutputConfig>,
    pub(crate) tcp_output: Option<TcpOutputConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
            listener: None,
            capture: None,
            assembly: AssemblyConfig::default(),
            http_output: None,
            tcp_output: None,
        }
    }
}

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

const fn default_drain_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ListenerConfig {
    #[serde(default = "default_listen_addr")]
    pub(crate) addr: IpAddr,
    pub(crate) port: u16,
    #[serde(default = "default_path")]
    pub(crate) path: String,
    #[serde(default = "default_timeout_ms")]
    pub(crate) request_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub(crate) response_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub(crate) idle_timeout_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    pub(crate) max_header_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub(crate) max_body_bytes: usize,
}

const fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_path() -> String {
    "/".to_string()
}

const fn default_timeout_ms() -> u64 {
    1000
}

const fn default_max_header_bytes() -> usize {
    4096
}

const fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl ListenerConfig {
    pub(crate) fn on_port(port: u16) -> Self {
        Self {
            addr: default_listen_addr(),
            port,
            path: default_path(),
            request_timeout_ms: default_timeout_ms(),
            response_timeout_ms: default_timeout_ms(),
            idle_timeout_ms: default_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }

    pub(crate) fn options(&self, capacity: usize) -> ListenerOptions {
        ListenerOptions::new(SocketAddr::new(self.addr, self.port))
            .path(self.path.clone())
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .response_timeout(Duration::from_millis(self.response_timeout_ms))
            .idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .max_header_bytes(self.max_header_bytes)
            .max_body_bytes(self.max_body_bytes)
            .capacity(capacity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CaptureConfig {
    /// Interface name, or `"all"`.
    pub(crate) device: Option<String>,
    pub(crate) pcap_file: Option<PathBuf>,
    pub(crate) filter: Option<String>,
    #[serde(default)]
    pub(crate) promiscuous: bool,
    pub(crate) buffer_size: Option<usize>,
    /// Requests with a larger body are skipped. Defaults to
    /// [`DEFAULT_MAX_BODY_BYTES`](replay::http::DEFAULT_MAX_BODY_BYTES).
    pub(crate) max_body_bytes: Option<usize>,
}

impl CaptureConfig {
    /// Live traffic can't be slowed down, so a lagging output misses messages instead of
    /// holding back the others. A capture file is read at the pace of the slowest output.
    pub(crate) fn options(&self, assembly: AssemblyOptions, capacity: usize) -> CaptureOptions {
        let delivery = if self.pcap_file.is_some() { Delivery::Lossless } else { Delivery::Isolated };

        CaptureOptions::default()
            .assembly(assembly)
            .queue_capacity(capacity)
            .max_body_bytes(self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES))
            .delivery(delivery)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AssemblyConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub(crate) flush_interval_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub(crate) retention_secs: u64,
    #[serde(default = "default_max_buffered_segments")]
    pub(crate) max_buffered_segments: usize,
    #[serde(default = "default_reorder_window_ms")]
    pub(crate) reorder_window_ms: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            retention_secs: default_retention_secs(),
            max_buffered_segments: default_max_buffered_segments(),
            reorder_window_ms: default_reorder_window_ms(),
        }
    }
}

const fn default_flush_interval_secs() -> u64 {
    60
}

const fn default_retention_secs() -> u64 {
    120
}

const fn default_max_buffered_segments() -> usize {
    1024
}

const fn default_reorder_window_ms() -> u64 {
    1000
}

impl AssemblyConfig {
    pub(crate) fn options(&self) -> AssemblyOptions {
        AssemblyOptions::default()
            .flush_interval(Duration::from_secs(self.flush_interval_secs))
            .retention(Duration::from_secs(self.retention_secs))
            .max_buffered_segments(self.max_buffered_segments)
            .reorder_window(Duration::from_millis(self.reorder_window_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HttpOutputConfig {
    pub(crate) redirect_url: String,
    #[serde(default)]
    pub(crate) workers: usize,
    #[serde(default)]
    pub(crate) replay_raw: bool,
    #[serde(default)]
    pub(crate) client: HttpClientConfig,
}

impl HttpOutputConfig {
    pub(crate) fn new(redirect_url: impl Into<String>) -> Self {
        Self { redirect_url: redirect_url.into(), workers: 0, replay_raw: false, client: HttpClientConfig::default() }
    }

    pub(crate) fn options(&self, capacity: usize) -> HttpOutputOptions {
        HttpOutputOptions::new(self.redirect_url.clone())
            .workers(self.workers)
            .replay_raw(self.replay_raw)
            .queue_capacity(capacity)
            .client(self.client.options())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HttpClientConfig {
    #[serde(default = "default_client_timeout_ms")]
    pub(crate) timeout_ms: u64,
    pub(crate) user_agent: Option<String>,
    pub(crate) referer: Option<String>,
    pub(crate) proxy_url: Option<String>,
    pub(crate) proxy_username: Option<String>,
    pub(crate) proxy_password: Option<String>,
    #[serde(default)]
    pub(crate) cookie_store: bool,
    #[serde(default)]
    pub(crate) allow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub(crate) max_redirects: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_client_timeout_ms(),
            user_agent: None,
            referer: None,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            cookie_store: false,
            allow_redirects: false,
            max_redirects: default_max_redirects(),
        }
    }
}

const fn default_client_timeout_ms() -> u64 {
    5000
}

const fn default_max_redirects() -> usize {
    10
}

impl HttpClientConfig {
    fn options(&self) -> HttpClientOptions {
        HttpClientOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            user_agent: self.user_agent.clone(),
            referer: self.referer.clone(),
            proxy: self.proxy_url.clone().map(|url| ProxyOptions {
                url,
                username: self.proxy_username.clone(),
                password: self.proxy_password.clone(),
            }),
            cookie_store: self.cookie_store,
            allow_redirects: self.allow_redirects,
            max_redirects: self.max_redirects,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TcpOutputConfig {
    pub(crate) addr: String,
    /// 0 retries forever.
    #[serde(default = "default_retry_attempts")]
    pub(crate) retry_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub(crate) backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub(crate) max_backoff_ms: u64,
}

const fn default_retry_attempts() -> usize {
    8
}

const fn default_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl TcpOutputConfig {
    pub(crate) fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            retry_attempts: default_retry_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub(crate) fn options(&self, capacity: usize) -> TcpOutputOptions {
        TcpOutputOptions::new(self.addr.clone())
            .retry_attempts((self.retry_attempts > 0).then_some(self.retry_attempts))
            .backoff(Duration::from_millis(self.backoff_ms))
            .max_backoff(Duration::from_millis(self.max_backoff_ms))
            .queue_capacity(capacity)
    }
}

impl Config {
    /// Loads the configuration from `path`, or from the first existing default location. Falls
    /// back to the defaults if there is no file at all.
    pub(crate) fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => search_paths().into_iter().find(|p| p.is_file()),
        };

        let Some(path) = path else {
            return Ok((Self::default(), None));
        };

        let contents =
            std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        Ok((Self::parse(&contents)?, Some(path)))
    }

    pub(crate) fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub(crate) fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Checks the settings that only make sense together.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(capture) = &self.capture {
            match (&capture.device, &capture.pcap_file) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid("capture.device and capture.pcap_file are exclusive".into()))
                }
                (None, None) => {
                    return Err(ConfigError::Invalid("capture needs a device or a pcap_file".into()))
                }
                _ => {}
            }
        }

        if self.listener.is_none() && self.capture.is_none() {
            return Err(ConfigError::Invalid("no input configured".into()));
        }
        if self.http_output.is_none() && self.tcp_output.is_none() {
            return Err(ConfigError::Invalid("no output configured".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }

        Ok(())
    }
}

/// Default config file locations, in lookup order.
fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("replay.toml")];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config/replay/config.toml"));
    }
    paths.push(PathBuf::from("/etc/replay/config.toml"));
    paths
}
