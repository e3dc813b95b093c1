//! Metrics instrumentation for multicluster-dns.
//!
//! All metrics are prefixed with `mc_dns.`

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Register descriptions for every metric. Call after a recorder is installed.
pub fn describe() {
    describe_counter!("mc_dns.query.count", "DNS queries by record type and result");
    describe_histogram!(
        "mc_dns.query.duration.seconds",
        Unit::Seconds,
        "Time spent answering a DNS query"
    );
    describe_histogram!(
        "mc_dns.query.answers_returned",
        Unit::Count,
        "Answer records per successful query"
    );
    describe_counter!("mc_dns.watch.event.count", "Watch events by collection and kind");
    describe_counter!("mc_dns.watch.error.count", "Watch stream errors by collection");
    describe_counter!("mc_dns.watch.restart.count", "Watch (re)starts by collection and reason");
    describe_counter!("mc_dns.state.change.count", "Effective changes that advanced the serial");
    describe_gauge!("mc_dns.state.services.count", "Cached service imports");
    describe_gauge!("mc_dns.state.endpoints.count", "Cached endpoint records");
    describe_gauge!("mc_dns.state.namespaces.count", "Cached namespaces");
    describe_gauge!("mc_dns.state.serial", "Current SOA serial");
}

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::NoData => "nodata",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::NotReady => "not_ready",
        QueryResult::Delegated => "delegated",
        QueryResult::Error => "error",
    };

    counter!("mc_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("mc_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// Query returned records.
    Success,
    /// Name exists but has no records of the requested type.
    NoData,
    /// Name not found.
    NxDomain,
    /// Name not found while the cache is still syncing.
    NotReady,
    /// Handed to the next handler.
    Delegated,
    /// Query failed with an error.
    Error,
}

/// Record a watch event for one of the cached collections.
pub fn record_watch_event(collection: &str, event_type: WatchEventType) {
    let event_str = match event_type {
        WatchEventType::Apply => "apply",
        WatchEventType::Delete => "delete",
        WatchEventType::Init => "init",
        WatchEventType::InitApply => "init_apply",
        WatchEventType::InitDone => "init_done",
    };

    counter!("mc_dns.watch.event.count", "collection" => collection.to_string(), "event" => event_str)
        .increment(1);
}

/// Watch event types.
#[derive(Debug, Clone, Copy)]
pub enum WatchEventType {
    /// Object added or modified.
    Apply,
    /// Object deleted.
    Delete,
    /// A relist started.
    Init,
    /// Object seen during a relist.
    InitApply,
    /// Relist complete.
    InitDone,
}

/// Record a watch stream error. The watcher retries on its own.
pub fn record_watch_error(collection: &str) {
    counter!("mc_dns.watch.error.count", "collection" => collection.to_string()).increment(1);
}

/// Record a watch (re)start.
pub fn record_watch_restart(collection: &str, reason: RestartReason) {
    let reason_str = match reason {
        RestartReason::InitialConnect => "initial_connect",
        RestartReason::StreamEnded => "stream_ended",
    };

    counter!("mc_dns.watch.restart.count", "collection" => collection.to_string(), "reason" => reason_str)
        .increment(1);
}

/// Restart reasons.
#[derive(Debug, Clone, Copy)]
pub enum RestartReason {
    /// First watch of the collection.
    InitialConnect,
    /// Watch stream ended and was re-created.
    StreamEnded,
}

/// Record an effective change that advanced the modification clock.
pub fn record_state_change(collection: &str) {
    counter!("mc_dns.state.change.count", "collection" => collection.to_string()).increment(1);
}

/// Record state counts (call periodically or on change).
pub fn record_state_counts(services: usize, endpoints: usize, namespaces: usize) {
    gauge!("mc_dns.state.services.count").set(services as f64);
    gauge!("mc_dns.state.endpoints.count").set(endpoints as f64);
    gauge!("mc_dns.state.namespaces.count").set(namespaces as f64);
}

/// Record readiness state.
pub fn record_ready_state(services_ready: bool, endpoints_ready: bool, namespaces_ready: bool) {
    gauge!("mc_dns.state.services_ready").set(if services_ready { 1.0 } else { 0.0 });
    gauge!("mc_dns.state.endpoints_ready").set(if endpoints_ready { 1.0 } else { 0.0 });
    gauge!("mc_dns.state.namespaces_ready").set(if namespaces_ready { 1.0 } else { 0.0 });
}

/// Record the SOA serial number.
pub fn record_serial(serial: u32) {
    gauge!("mc_dns.state.serial").set(serial as f64);
}

/// Record answer records returned for a successful lookup.
pub fn record_answers_returned(count: usize) {
    histogram!("mc_dns.query.answers_returned").record(count as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
