//! Metrics instrumentation for meridian-dns.
//!
//! All metrics are prefixed with `meridian_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a routed DNS query.
pub fn record_query(outcome: QueryOutcome, duration: std::time::Duration) {
    let outcome_str = match outcome {
        QueryOutcome::LocalHit => "local_hit",
        QueryOutcome::Redirect => "redirect",
        QueryOutcome::Forwarded => "forwarded",
        QueryOutcome::Fallthrough => "fallthrough",
        QueryOutcome::FormErr => "formerr",
        QueryOutcome::ServFail => "servfail",
    };

    counter!("meridian_dns.query.count", "outcome" => outcome_str).increment(1);
    histogram!("meridian_dns.query.duration.seconds", "outcome" => outcome_str)
        .record(duration.as_secs_f64());
}

/// How a query was resolved, for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryOutcome {
    /// Answered with this cluster's own IP.
    LocalHit,
    /// Answered with the closest peer site's IP.
    Redirect,
    /// Answered from an upstream resolver.
    Forwarded,
    /// Outside the base domain, ignored, or no upstream available.
    Fallthrough,
    /// Upstream reply failed question validation.
    FormErr,
    /// All upstreams failed.
    ServFail,
}

/// Record the result of one upstream liveness probe.
pub fn record_probe(upstream: &str, healthy: bool) {
    let result = if healthy { "ok" } else { "fail" };
    counter!("meridian_dns.probe.count", "upstream" => upstream.to_string(), "result" => result)
        .increment(1);
}

/// Record a forwarding attempt against one upstream.
pub fn record_forward(upstream: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("meridian_dns.forward.count", "upstream" => upstream.to_string(), "result" => result)
        .increment(1);
}

/// Record a service-table push.
pub fn record_table_push(ok: bool) {
    let result = if ok { "ok" } else { "rejected" };
    counter!("meridian_dns.table.push.count", "result" => result).increment(1);
}

/// Record table size gauges (call periodically or on change).
pub fn record_table_counts(services: usize, sites: usize) {
    gauge!("meridian_dns.table.services.count").set(services as f64);
    gauge!("meridian_dns.table.sites.count").set(sites as f64);
}

/// Record the size of the local service set.
pub fn record_local_services(count: usize) {
    gauge!("meridian_dns.local_services.count").set(count as f64);
}

/// Record the failure counter of one upstream.
pub fn record_proxy_fails(upstream: &str, fails: u32) {
    gauge!("meridian_dns.proxy.fails", "upstream" => upstream.to_string()).set(fails as f64);
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
