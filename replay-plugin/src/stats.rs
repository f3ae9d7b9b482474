use std::{
    collections::BTreeMap,
    fmt::Write as _,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;

/// How a replay attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The destination answered with a status code.
    Status(StatusCode),
    /// The attempt completed without a status (raw TCP forwarding).
    Done(&'static str),
    /// The attempt failed.
    Failed(String),
}

impl Outcome {
    /// The label the outcome is counted under, e.g. `200 OK`.
    pub fn label(&self) -> String {
        match self {
            Self::Status(status) => match status.canonical_reason() {
                Some(reason) => format!("{} {reason}", status.as_str()),
                None => status.as_str().to_string(),
            },
            Self::Done(label) => (*label).to_string(),
            Self::Failed(err) => err.clone(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One completed or failed replay attempt.
#[derive(Debug, Clone)]
pub struct StatEntry {
    /// Where the message was replayed to.
    pub target: String,
    pub outcome: Outcome,
    pub round_trip: Duration,
    pub started_at: SystemTime,
    /// The response body, if any.
    pub body: Bytes,
}

impl StatEntry {
    pub fn new(target: impl Into<String>, outcome: Outcome, started_at: SystemTime, round_trip: Duration) -> Self {
        Self { target: target.into(), outcome, round_trip, started_at, body: Bytes::new() }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    by_label: BTreeMap<String, u64>,
    total: u64,
    total_round_trip: Duration,
}

/// Counts replay outcomes by label. Shared by every output.
#[derive(Debug, Default)]
pub struct StatService {
    counters: Mutex<Counters>,
}

impl StatService {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the entry under its outcome label. The entry is not retained.
    pub fn record(&self, entry: StatEntry) {
        let label = entry.outcome.label();

        let mut counters = self.counters.lock();
        *counters.by_label.entry(label).or_default() += 1;
        counters.total += 1;
        counters.total_round_trip = counters.total_round_trip.saturating_add(entry.round_trip);
    }

    /// Returns the counters by label.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().by_label.clone()
    }

    /// Returns the count recorded under `label`.
    pub fn count(&self, label: &str) -> u64 {
        self.counters.lock().by_label.get(label).copied().unwrap_or(0)
    }

    /// Adds `n` to the counter of `label` without counting it as a replayed entry.
    pub fn add(&self, label: &str, n: u64) {
        let mut counters = self.counters.lock();
        *counters.by_label.entry(label.to_string()).or_default() += n;
    }

    /// Number of entries recorded.
    pub fn total(&self) -> u64 {
        self.counters.lock().total
    }

    /// Mean round trip over every recorded entry.
    pub fn mean_round_trip(&self) -> Duration {
        let counters = self.counters.lock();
        match u32::try_from(counters.total) {
            Ok(0) => Duration::ZERO,
            Ok(total) => counters.total_round_trip / total,
            Err(_) => Duration::from_secs_f64(counters.total_round_trip.as_secs_f64() / counters.total as f64),
        }
    }

    /// Renders every counter, sorted by label.
    pub fn summarize(&self) -> String {
        let mean = self.mean_round_trip();
        let counters = self.counters.lock();

        let mut out = String::from("==================== replay summary ====================\n");
        for (label, count) in &counters.by_label {
            let _ = writeln!(out, "'{label}' --> {count}");
        }
        let _ = writeln!(out, "total: {}, mean round trip: {mean:?}", counters.total);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: Outcome, millis: u64) -> StatEntry {
        StatEntry::new("http://localhost/x", outcome, SystemTime::now(), Duration::from_millis(millis))
    }

    #[test]
    fn counts_by_label() {
        let stats = StatService::new();
        stats.record(entry(Outcome::Status(StatusCode::OK), 10));
        stats.record(entry(Outcome::Status(StatusCode::OK), 30));
        stats.record(entry(Outcome::Failed("connection refused".to_string()), 20));
        stats.record(entry(Outcome::Done("tcp forwarded"), 0));

        assert_eq!(stats.count("200 OK"), 2);
        assert_eq!(stats.count("connection refused"), 1);
        assert_eq!(stats.count("tcp forwarded"), 1);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.mean_round_trip(), Duration::from_millis(15));
        assert_eq!(stats.snapshot().len(), 3);
    }

    #[test]
    fn summary_lists_sorted_labels() {
        let stats = StatService::new();
        assert!(stats.summarize().contains("total: 0"));

        stats.record(entry(Outcome::Status(StatusCode::NOT_FOUND), 1));
        stats.record(entry(Outcome::Status(StatusCode::OK), 1));

        let summary = stats.summarize();
        let ok = summary.find("'200 OK' --> 1").unwrap();
        let not_found = summary.find("'404 Not Found' --> 1").unwrap();
        assert!(ok < not_found);
    }

    #[test]
    fn added_counters_are_not_replays() {
        let stats = StatService::new();
        stats.record(entry(Outcome::Status(StatusCode::OK), 10));
        stats.add("capture dropped", 3);
        stats.add("capture dropped", 2);

        assert_eq!(stats.count("capture dropped"), 5);
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.mean_round_trip(), Duration::from_millis(10));
        assert!(stats.summarize().contains("'capture dropped' --> 5"));
    }

    #[test]
    fn unknown_status_has_code_only() {
        let status = StatusCode::from_u16(599).unwrap();
        assert_eq!(Outcome::Status(status).label(), "599");
    }
}
