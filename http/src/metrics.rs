//! per-worker metrics.
//!
//! Everything lives in one flat struct of `Cell` counters owned by the
//! worker's event loop thread. Serialisation to the Prometheus text
//! exposition format happens in the handler module where the rest of
//! the worker state (slots, limiter, tls) is in reach.

use core::cell::Cell;

use crate::router::Route;

/// Cumulative latency bucket upper bounds in milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1000, 5000];

#[derive(Default)]
pub struct MetricsRegistry {
    pub requests_processed: Cell<u64>,
    pub connections_accepted: Cell<u64>,
    pub connections_rejected_rate: Cell<u64>,
    pub connections_rejected_slot: Cell<u64>,
    pub connections_rejected_blocked: Cell<u64>,
    pub connections_allowlisted: Cell<u64>,

    // cumulative buckets; the +Inf bucket doubles as the sample count.
    latency_buckets: [Cell<u64>; 8],
    latency_inf: Cell<u64>,
    latency_sum_seconds: Cell<f64>,

    pub status_200: Cell<u64>,
    pub status_400: Cell<u64>,
    pub status_404: Cell<u64>,
    pub status_408: Cell<u64>,
    pub status_429: Cell<u64>,
    pub status_503: Cell<u64>,
    pub status_2xx: Cell<u64>,
    pub status_4xx: Cell<u64>,
    pub status_5xx: Cell<u64>,

    pub method_get: Cell<u64>,
    pub method_post: Cell<u64>,
    pub method_other: Cell<u64>,

    pub tls_handshakes_tls12: Cell<u64>,
    pub tls_handshakes_tls13: Cell<u64>,
    pub tls_handshake_errors: Cell<u64>,

    pub h2_streams_total: Cell<u64>,
    pub h2_streams_active: Cell<u64>,
    pub h2_rst_stream_total: Cell<u64>,
    pub h2_goaway_sent: Cell<u64>,

    pub errors_timeout: Cell<u64>,
    pub errors_parse: Cell<u64>,
    pub errors_tls: Cell<u64>,

    pub response_bytes_total: Cell<u64>,
    pub slowloris_kills: Cell<u64>,
    pub slot_promotion_failures: Cell<u64>,
    pub keepalive_reuses: Cell<u64>,

    endpoint_hits: [Cell<u64>; Route::COUNT],
}

pub fn inc(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

pub fn dec(cell: &Cell<u64>) {
    if cell.get() > 0 {
        cell.set(cell.get() - 1);
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request.
    pub fn record_request(&self, status: u16, method: &str, duration_secs: f64, bytes: u64, reused: bool) {
        inc(&self.requests_processed);
        self.observe_latency(duration_secs);
        self.count_status(status);
        self.count_method(method);
        self.response_bytes_total
            .set(self.response_bytes_total.get() + bytes);
        if reused {
            inc(&self.keepalive_reuses);
        }
    }

    pub fn observe_latency(&self, duration_secs: f64) {
        let ms = duration_secs * 1000.0;
        for (cell, bound) in self.latency_buckets.iter().zip(LATENCY_BUCKETS_MS) {
            if ms <= bound as f64 {
                inc(cell);
            }
        }
        inc(&self.latency_inf);
        self.latency_sum_seconds
            .set(self.latency_sum_seconds.get() + duration_secs);
    }

    pub fn count_status(&self, status: u16) {
        match status {
            200..=299 => inc(&self.status_2xx),
            400..=499 => inc(&self.status_4xx),
            500..=599 => inc(&self.status_5xx),
            _ => {}
        }
        match status {
            200 => inc(&self.status_200),
            400 => inc(&self.status_400),
            404 => inc(&self.status_404),
            408 => inc(&self.status_408),
            429 => inc(&self.status_429),
            503 => inc(&self.status_503),
            _ => {}
        }
    }

    pub fn count_method(&self, method: &str) {
        match method {
            "GET" => inc(&self.method_get),
            "POST" => inc(&self.method_post),
            _ => inc(&self.method_other),
        }
    }

    pub fn endpoint_hit(&self, route: Route) {
        // 404s are visible through the status counters instead.
        if route != Route::Error {
            inc(&self.endpoint_hits[route.index()]);
        }
    }

    pub fn endpoint_count(&self, route: Route) -> u64 {
        self.endpoint_hits[route.index()].get()
    }

    pub fn latency_bucket(&self, idx: usize) -> u64 {
        self.latency_buckets[idx].get()
    }

    pub fn latency_count(&self) -> u64 {
        self.latency_inf.get()
    }

    pub fn latency_sum(&self) -> f64 {
        self.latency_sum_seconds.get()
    }
}
