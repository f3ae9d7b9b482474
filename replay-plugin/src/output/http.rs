use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use ::http::{header, HeaderMap, HeaderValue};
use async_trait::async_trait;
use replay_common::constants::DEFAULT_QUEUE_CAPACITY;
use replay_wire::{
    http::{parse_request, Limits},
    Level, Message,
};
use reqwest::{redirect, Client, Proxy, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::Intake;
use crate::{Outcome, Output, OutputError, StatEntry, StatService};

/// Proxy settings for the outbound client.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Settings of the outbound HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// Timeout of a whole request, response body included.
    pub timeout: Duration,
    /// Overrides the captured `User-Agent`.
    pub user_agent: Option<String>,
    /// Overrides the captured `Referer`.
    pub referer: Option<String>,
    pub proxy: Option<ProxyOptions>,
    pub cookie_store: bool,
    pub allow_redirects: bool,
    pub max_redirects: usize,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            referer: None,
            proxy: None,
            cookie_store: false,
            allow_redirects: false,
            max_redirects: 10,
        }
    }
}

impl HttpClientOptions {
    fn build(&self) -> Result<Client, OutputError> {
        let mut builder = Client::builder().timeout(self.timeout).cookie_store(self.cookie_store);

        builder = builder.redirect(if self.allow_redirects {
            redirect::Policy::limited(self.max_redirects)
        } else {
            redirect::Policy::none()
        });

        if let Some(proxy) = &self.proxy {
            let mut p = Proxy::all(proxy.url.as_str())?;
            if let Some(username) = &proxy.username {
                p = p.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
            }
            builder = builder.proxy(p);
        }

        Ok(builder.build()?)
    }
}

#[derive(Debug, Clone)]
pub struct HttpOutputOptions {
    /// Base URL requests are redirected to. The captured path is appended to its path.
    pub redirect_url: String,
    /// Number of workers. 0 means twice the available parallelism.
    pub workers: usize,
    /// Also replay packet and TCP level messages that parse as a complete request.
    pub replay_raw: bool,
    pub queue_capacity: usize,
    pub client: HttpClientOptions,
}

impl HttpOutputOptions {
    pub fn new(redirect_url: impl Into<String>) -> Self {
        Self {
            redirect_url: redirect_url.into(),
            workers: 0,
            replay_raw: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            client: HttpClientOptions::default(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn replay_raw(mut self, replay_raw: bool) -> Self {
        self.replay_raw = replay_raw;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn client(mut self, client: HttpClientOptions) -> Self {
        self.client = client;
        self
    }

    fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get()) * 2
    }
}

/// Redirects captured HTTP requests to another server.
#[derive(Debug)]
pub struct HttpOutput {
    intake: Intake,
}

impl HttpOutput {
    /// Creates the output and starts its workers.
    pub fn new(
        options: HttpOutputOptions,
        stats: Arc<StatService>,
        cancel: CancellationToken,
    ) -> Result<Self, OutputError> {
        let redirect = Url::parse(&options.redirect_url)
            .map_err(|e| OutputError::InvalidUrl(format!("{}: {e}", options.redirect_url)))?;
        if redirect.cannot_be_a_base() {
            return Err(OutputError::InvalidUrl(options.redirect_url));
        }

        let replayer = Arc::new(Replayer {
            client: options.client.build()?,
            redirect,
            referer: options.client.referer.clone(),
            user_agent: options.client.user_agent.clone(),
            replay_raw: options.replay_raw,
            stats,
        });

        let intake = Intake::new(
            format!("http -> {}", options.redirect_url),
            Level::PACKET | Level::TCP | Level::HTTP,
            options.queue_capacity,
            cancel,
        );

        let workers = options.worker_count();
        for id in 0..workers {
            let replayer = Arc::clone(&replayer);
            intake.spawn_worker(id, move |msg| {
                let replayer = Arc::clone(&replayer);
                async move { replayer.send(msg).await }
            });
        }

        info!(output = intake.name(), workers, "Started HTTP output");

        Ok(Self { intake })
    }
}

#[async_trait]
impl Output for HttpOutput {
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

#[derive(Debug)]
struct Replayer {
    client: Client,
    redirect: Url,
    referer: Option<String>,
    user_agent: Option<String>,
    replay_raw: bool,
    stats: Arc<StatService>,
}

impl Replayer {
    async fn send(&self, msg: Message) {
        if msg.level() != Level::HTTP && !self.replay_raw {
            trace!(level = %msg.level(), "Skipping raw message");
            return;
        }

        let request = match parse_request(msg.raw(), Limits::default()) {
            Ok(Some((request, _))) => request,
            Ok(None) => {
                debug!(level = %msg.level(), len = msg.len(), "Incomplete request, not replaying");
                return;
            }
            Err(e) => {
                debug!(err = ?e, level = %msg.level(), "Unparsable request, not replaying");
                return;
            }
        };

        let url = redirect_target(&self.redirect, request.path_and_query());
        let target = url.to_string();
        let (method, _, headers, body) = request.into_parts();
        let headers = self.outbound_headers(headers);

        let started_at = SystemTime::now();
        let start = Instant::now();

        let result = self.client.request(method, url).headers(headers).body(body).send().await;

        let entry = match result {
            Ok(response) => {
                let status = response.status();
                // A body that fails to arrive still counts as answered
                let body = response.bytes().await.unwrap_or_default();
                StatEntry::new(target, Outcome::Status(status), started_at, start.elapsed()).with_body(body)
            }
            Err(e) => {
                debug!(err = ?e, %target, "Replay failed");
                StatEntry::new(target, Outcome::Failed(e.to_string()), started_at, start.elapsed())
            }
        };

        trace!(target = %entry.target, outcome = %entry.outcome.label(), rtt = ?entry.round_trip, "Replayed request");
        self.stats.record(entry);
    }

    /// Drops the headers the client recomputes and applies the overrides. The body is sent
    /// whole, so `Expect` goes too.
    fn outbound_headers(&self, mut headers: HeaderMap) -> HeaderMap {
        for name in [header::HOST, header::CONTENT_LENGTH, header::CONNECTION, header::TRANSFER_ENCODING, header::EXPECT] {
            headers.remove(name);
        }

        if let Some(value) = self.user_agent.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::USER_AGENT, value);
        }
        if let Some(value) = self.referer.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::REFERER, value);
        }

        headers
    }
}

/// Joins a captured request target onto the redirect URL: the redirect path without its trailing
/// slash, followed by the captured path, with the captured query.
pub(crate) fn redirect_target(base: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut joined = base.path().trim_end_matches('/').to_string();
    if !path.starts_with('/') {
        joined.push('/');
    }
    joined.push_str(path);

    let mut url = base.clone();
    url.set_path(&joined);
    url.set_query(query);
    url
}
