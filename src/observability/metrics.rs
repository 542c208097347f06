// Request metrics
//
// Process-wide counters for request outcomes, deadline kills and workspace
// cleanup failures, plus a request latency histogram. Everything is atomic;
// recording never blocks a request flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::ErrorKind;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram with fixed bucket bounds in seconds
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new_latency() -> Self {
        let bounds = vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (le, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *le {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_micros(&self) -> u64 {
        self.sum_micros.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of the registry, suitable for logging as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub since: DateTime<Utc>,
    pub requests_total: u64,
    pub succeeded: u64,
    pub unsupported: u64,
    pub compile_errors: u64,
    pub runtime_errors: u64,
    pub timeouts: u64,
    pub system_errors: u64,
    pub deadline_kills: u64,
    pub cleanup_failures: u64,
    pub mean_latency_ms: u64,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    since: DateTime<Utc>,
    pub requests_total: Counter,
    pub succeeded: Counter,
    pub unsupported: Counter,
    pub compile_errors: Counter,
    pub runtime_errors: Counter,
    pub timeouts: Counter,
    pub system_errors: Counter,
    /// Steps whose process group was terminated at the deadline
    pub deadline_kills: Counter,
    pub cleanup_failures: Counter,
    pub request_latency: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            since: Utc::now(),
            requests_total: Counter::new(),
            succeeded: Counter::new(),
            unsupported: Counter::new(),
            compile_errors: Counter::new(),
            runtime_errors: Counter::new(),
            timeouts: Counter::new(),
            system_errors: Counter::new(),
            deadline_kills: Counter::new(),
            cleanup_failures: Counter::new(),
            request_latency: Histogram::new_latency(),
        }
    }

    /// Record one finished request.
    pub fn record_outcome(&self, error_kind: Option<ErrorKind>, elapsed: Duration) {
        self.requests_total.inc();
        self.request_latency.observe(elapsed);

        match error_kind {
            None => self.succeeded.inc(),
            Some(ErrorKind::Unsupported) => self.unsupported.inc(),
            Some(ErrorKind::CompileError) => self.compile_errors.inc(),
            Some(ErrorKind::RuntimeError) => self.runtime_errors.inc(),
            Some(ErrorKind::Timeout) => self.timeouts.inc(),
            Some(ErrorKind::SystemError) => self.system_errors.inc(),
        }
    }

    pub fn record_deadline_kill(&self) {
        self.deadline_kills.inc();
    }

    pub fn record_cleanup_failure(&self) {
        self.cleanup_failures.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.request_latency.count();
        let mean_latency_ms = if count == 0 {
            0
        } else {
            self.request_latency.sum_micros() / count / 1000
        };

        MetricsSnapshot {
            since: self.since,
            requests_total: self.requests_total.get(),
            succeeded: self.succeeded.get(),
            unsupported: self.unsupported.get(),
            compile_errors: self.compile_errors.get(),
            runtime_errors: self.runtime_errors.get(),
            timeouts: self.timeouts.get(),
            system_errors: self.system_errors.get(),
            deadline_kills: self.deadline_kills.get(),
            cleanup_failures: self.cleanup_failures.get(),
            mean_latency_ms,
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP polyrun_requests_total Total number of requests\n");
        output.push_str("# TYPE polyrun_requests_total counter\n");
        output.push_str(&format!("polyrun_requests_total {}\n", self.requests_total.get()));

        output.push_str("# HELP polyrun_requests_by_kind Requests by error kind\n");
        output.push_str("# TYPE polyrun_requests_by_kind counter\n");
        let by_kind = [
            ("none", &self.succeeded),
            (ErrorKind::Unsupported.as_str(), &self.unsupported),
            (ErrorKind::CompileError.as_str(), &self.compile_errors),
            (ErrorKind::RuntimeError.as_str(), &self.runtime_errors),
            (ErrorKind::Timeout.as_str(), &self.timeouts),
            (ErrorKind::SystemError.as_str(), &self.system_errors),
        ];
        for (kind, counter) in by_kind {
            output.push_str(&format!(
                "polyrun_requests_by_kind{{kind=\"{}\"}} {}\n",
                kind,
                counter.get()
            ));
        }

        output.push_str("# TYPE polyrun_deadline_kills_total counter\n");
        output.push_str(&format!(
            "polyrun_deadline_kills_total {}\n",
            self.deadline_kills.get()
        ));
        output.push_str("# TYPE polyrun_cleanup_failures_total counter\n");
        output.push_str(&format!(
            "polyrun_cleanup_failures_total {}\n",
            self.cleanup_failures.get()
        ));

        output.push_str("# HELP polyrun_request_latency_seconds Request latency\n");
        output.push_str("# TYPE polyrun_request_latency_seconds histogram\n");
        let latency = &self.request_latency;
        for (le, bucket) in latency.bounds.iter().zip(&latency.buckets) {
            output.push_str(&format!(
                "polyrun_request_latency_seconds_bucket{{le=\"{}\"}} {}\n",
                le,
                bucket.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "polyrun_request_latency_seconds_sum {}\n",
            latency.sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "polyrun_request_latency_seconds_count {}\n",
            latency.count()
        ));

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn global() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
