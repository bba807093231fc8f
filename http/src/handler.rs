//! route handlers shared by the http/1.1 and http/2 paths.
//!
//! A handler produces a [Reply]; the protocol dispatchers own encoding
//! and transmission. Broadcast is the only handler that suspends: it
//! waits for the node's verdict before the response exists at all.

use core::fmt::Write as _;

use bytes::Bytes;
use http::StatusCode;
use tracing::warn;

use crate::metrics::LATENCY_BUCKETS_MS;
use crate::pages::HTML_CONTENT_TYPE;
use crate::router::{route_path, Route, ACME_PREFIX};
use crate::slot::Tier;
use crate::state::WorkerState;

/// ACME challenge files are tiny; anything larger is not a token.
const ACME_MAX_FILE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cache {
    /// Configured `cache_max_age`, or `no-store` when it is zero.
    Static,
    NoStore,
}

pub struct Reply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub cache: Cache,
    pub body: Bytes,
    /// Force `Connection: close` regardless of the request preference.
    pub close: bool,
}

impl Reply {
    fn page(status: StatusCode, body: Bytes) -> Self {
        Self {
            status,
            content_type: HTML_CONTENT_TYPE,
            cache: Cache::Static,
            body,
            close: false,
        }
    }

    fn json(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json",
            cache: Cache::NoStore,
            body: Bytes::from(body),
            close: false,
        }
    }

    fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            cache: Cache::NoStore,
            body: body.into(),
            close: false,
        }
    }
}

/// Route a parsed request and produce its reply.
pub async fn dispatch(state: &WorkerState, path: &str) -> Reply {
    let route = route_path(path);
    state.metrics.endpoint_hit(route);

    match route {
        Route::Health => health(state),
        Route::Ready => ready(state),
        Route::Alive => Reply::text(StatusCode::OK, Bytes::new()),
        Route::Version => version(),
        Route::Metrics => metrics(state),
        Route::AcmeChallenge => acme_challenge(state, path).await,
        Route::Broadcast => broadcast(state, path).await,
        Route::Home | Route::Result | Route::Docs | Route::Status | Route::Logos => {
            match state.pages.for_route(route) {
                Some(body) => Reply::page(StatusCode::OK, body.clone()),
                None => not_found(state),
            }
        }
        Route::Error => not_found(state),
    }
}

fn not_found(state: &WorkerState) -> Reply {
    Reply::page(StatusCode::NOT_FOUND, state.pages.error.clone())
}

fn version() -> Reply {
    Reply::json(format!("{{\"version\":\"{}\"}}", env!("CARGO_PKG_VERSION")))
}

fn ready(state: &WorkerState) -> Reply {
    let status = if state.is_draining() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Reply::text(status, Bytes::new())
}

fn health(state: &WorkerState) -> Reply {
    let open_fds = open_fds().unwrap_or(-1);
    let max_fds = max_fds().unwrap_or(-1);
    let fd_usage = if open_fds >= 0 && max_fds > 0 {
        100.0 * open_fds as f64 / max_fds as f64
    } else {
        0.0
    };

    let (tls_enabled, cert_days, cert_warning) = match &state.tls {
        Some(tls) => {
            let days = tls.cert_days_remaining();
            (true, days, days < 30)
        }
        None => (false, 0, false),
    };

    let body = serde_json::json!({
        "status": "healthy",
        "worker_id": state.worker_id,
        "uptime_seconds": state.started.elapsed().as_secs(),
        "active_connections": state.active_connections(),
        "requests_processed": state.metrics.requests_processed.get(),
        "slots": {
            "normal": { "used": state.slots.used(Tier::Normal), "max": state.slots.capacity(Tier::Normal) },
            "large": { "used": state.slots.used(Tier::Large), "max": state.slots.capacity(Tier::Large) },
            "huge": { "used": state.slots.used(Tier::Huge), "max": state.slots.capacity(Tier::Huge) },
        },
        "rate_limiter_entries": state.limiter.borrow().entry_count(),
        "tls": {
            "enabled": tls_enabled,
            "cert_expires_in_days": cert_days,
            "cert_expiry_warning": cert_warning,
        },
        "resources": {
            "open_fds": open_fds,
            "max_fds": max_fds,
            "fd_usage_percent": fd_usage,
        },
    });

    Reply::json(body.to_string())
}

fn metrics(state: &WorkerState) -> Reply {
    Reply {
        status: StatusCode::OK,
        content_type: "text/plain; version=0.0.4; charset=utf-8",
        cache: Cache::NoStore,
        body: Bytes::from(render_metrics(state)),
        // metrics scrapers get a fresh connection every time.
        close: true,
    }
}

async fn acme_challenge(state: &WorkerState, path: &str) -> Reply {
    let not_found = || Reply::text(StatusCode::NOT_FOUND, "Not Found");

    let Some(token) = path.strip_prefix(ACME_PREFIX) else {
        return not_found();
    };

    // base64url alphabet only; no separators, no traversal.
    let token_ok = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !token_ok {
        warn!("acme: rejected challenge token {token:?}");
        return not_found();
    }

    let file = state.config.acme_challenge_dir.join(token);
    match tokio::fs::metadata(&file).await {
        Ok(meta) if meta.is_file() && meta.len() <= ACME_MAX_FILE_SIZE => {}
        Ok(_) | Err(_) => {
            warn!("acme: challenge file not served: {}", file.display());
            return not_found();
        }
    }

    match tokio::fs::read(&file).await {
        Ok(content) => Reply::text(StatusCode::OK, content),
        Err(e) => {
            warn!("acme: failed to read {}: {e}", file.display());
            not_found()
        }
    }
}

async fn broadcast(state: &WorkerState, path: &str) -> Reply {
    let hex = path.trim_start_matches('/');
    match state.rpc.broadcast(hex).await {
        Ok(_txid) => Reply::page(StatusCode::OK, state.pages.broadcast.clone()),
        Err(e) => Reply::text(StatusCode::BAD_GATEWAY, format!("Broadcast failed: {e}\n")),
    }
}

/// Prometheus text exposition v0.0.4 for the whole worker.
pub fn render_metrics(state: &WorkerState) -> String {
    let m = &state.metrics;
    let w = state.worker_id;
    let mut out = String::with_capacity(8 * 1024);

    fn counter(out: &mut String, w: usize, name: &str, help: &str, value: u64) {
        let _ = write!(
            out,
            "# HELP txrelay_{name} {help}\n# TYPE txrelay_{name} counter\ntxrelay_{name}{{worker=\"{w}\"}} {value}\n\n"
        );
    }

    counter(&mut out, w, "requests_total", "Total requests processed", m.requests_processed.get());
    counter(
        &mut out,
        w,
        "connections_accepted_total",
        "Total connections accepted",
        m.connections_accepted.get(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_connections_rejected_total Rejected connections by reason\n\
         # TYPE txrelay_connections_rejected_total counter\n\
         txrelay_connections_rejected_total{{worker=\"{w}\",reason=\"rate_limit\"}} {}\n\
         txrelay_connections_rejected_total{{worker=\"{w}\",reason=\"slot_limit\"}} {}\n\
         txrelay_connections_rejected_total{{worker=\"{w}\",reason=\"blocked\"}} {}\n\n",
        m.connections_rejected_rate.get(),
        m.connections_rejected_slot.get(),
        m.connections_rejected_blocked.get(),
    );

    counter(
        &mut out,
        w,
        "connections_allowlisted_total",
        "Connections that bypassed rate limiting",
        m.connections_allowlisted.get(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_active_connections Current active connections\n\
         # TYPE txrelay_active_connections gauge\n\
         txrelay_active_connections{{worker=\"{w}\"}} {}\n\n",
        state.active_connections(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_request_duration_seconds Request latency histogram\n\
         # TYPE txrelay_request_duration_seconds histogram\n"
    );
    for (idx, bound_ms) in LATENCY_BUCKETS_MS.iter().enumerate() {
        let le = *bound_ms as f64 / 1000.0;
        let _ = write!(
            out,
            "txrelay_request_duration_seconds_bucket{{worker=\"{w}\",le=\"{le}\"}} {}\n",
            m.latency_bucket(idx),
        );
    }
    let _ = write!(
        out,
        "txrelay_request_duration_seconds_bucket{{worker=\"{w}\",le=\"+Inf\"}} {count}\n\
         txrelay_request_duration_seconds_sum{{worker=\"{w}\"}} {sum:.6}\n\
         txrelay_request_duration_seconds_count{{worker=\"{w}\"}} {count}\n\n",
        count = m.latency_count(),
        sum = m.latency_sum(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_http_requests_total HTTP requests by status code\n\
         # TYPE txrelay_http_requests_total counter\n\
         txrelay_http_requests_total{{worker=\"{w}\",status=\"200\"}} {}\n\
         txrelay_http_requests_total{{worker=\"{w}\",status=\"400\"}} {}\n\
         txrelay_http_requests_total{{worker=\"{w}\",status=\"404\"}} {}\n\
         txrelay_http_requests_total{{worker=\"{w}\",status=\"408\"}} {}\n\
         txrelay_http_requests_total{{worker=\"{w}\",status=\"429\"}} {}\n\
         txrelay_http_requests_total{{worker=\"{w}\",status=\"503\"}} {}\n\n\
         # HELP txrelay_http_requests_by_class_total HTTP requests by status class\n\
         # TYPE txrelay_http_requests_by_class_total counter\n\
         txrelay_http_requests_by_class_total{{worker=\"{w}\",class=\"2xx\"}} {}\n\
         txrelay_http_requests_by_class_total{{worker=\"{w}\",class=\"4xx\"}} {}\n\
         txrelay_http_requests_by_class_total{{worker=\"{w}\",class=\"5xx\"}} {}\n\n",
        m.status_200.get(),
        m.status_400.get(),
        m.status_404.get(),
        m.status_408.get(),
        m.status_429.get(),
        m.status_503.get(),
        m.status_2xx.get(),
        m.status_4xx.get(),
        m.status_5xx.get(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_requests_by_method_total HTTP requests by method\n\
         # TYPE txrelay_requests_by_method_total counter\n\
         txrelay_requests_by_method_total{{worker=\"{w}\",method=\"GET\"}} {}\n\
         txrelay_requests_by_method_total{{worker=\"{w}\",method=\"POST\"}} {}\n\
         txrelay_requests_by_method_total{{worker=\"{w}\",method=\"OTHER\"}} {}\n\n",
        m.method_get.get(),
        m.method_post.get(),
        m.method_other.get(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_process_start_time_seconds Unix timestamp of process start\n\
         # TYPE txrelay_process_start_time_seconds gauge\n\
         txrelay_process_start_time_seconds{{worker=\"{w}\"}} {}\n\n\
         # HELP txrelay_process_uptime_seconds Process uptime in seconds\n\
         # TYPE txrelay_process_uptime_seconds gauge\n\
         txrelay_process_uptime_seconds{{worker=\"{w}\"}} {:.3}\n\n",
        state.started_wallclock,
        state.started.elapsed().as_secs_f64(),
    );

    if let (Some(open), Some(max)) = (open_fds(), max_fds()) {
        let _ = write!(
            out,
            "# HELP txrelay_open_fds Current number of open file descriptors\n\
             # TYPE txrelay_open_fds gauge\n\
             txrelay_open_fds{{worker=\"{w}\"}} {open}\n\n\
             # HELP txrelay_max_fds Maximum file descriptors allowed\n\
             # TYPE txrelay_max_fds gauge\n\
             txrelay_max_fds{{worker=\"{w}\"}} {max}\n\n",
        );
    }

    let _ = write!(
        out,
        "# HELP txrelay_tls_handshakes_total TLS handshakes by protocol version\n\
         # TYPE txrelay_tls_handshakes_total counter\n\
         txrelay_tls_handshakes_total{{worker=\"{w}\",protocol=\"TLSv1.2\"}} {}\n\
         txrelay_tls_handshakes_total{{worker=\"{w}\",protocol=\"TLSv1.3\"}} {}\n\n\
         # HELP txrelay_tls_handshake_errors_total TLS handshake errors\n\
         # TYPE txrelay_tls_handshake_errors_total counter\n\
         txrelay_tls_handshake_errors_total{{worker=\"{w}\"}} {}\n\n",
        m.tls_handshakes_tls12.get(),
        m.tls_handshakes_tls13.get(),
        m.tls_handshake_errors.get(),
    );

    if let Some(tls) = &state.tls {
        if tls.cert_expiry() > 0 {
            let _ = write!(
                out,
                "# HELP txrelay_tls_cert_expiry_timestamp_seconds Unix timestamp when certificate expires\n\
                 # TYPE txrelay_tls_cert_expiry_timestamp_seconds gauge\n\
                 txrelay_tls_cert_expiry_timestamp_seconds{{worker=\"{w}\"}} {}\n\n",
                tls.cert_expiry(),
            );
        }
    }

    counter(&mut out, w, "http2_streams_total", "Total HTTP/2 streams opened", m.h2_streams_total.get());
    let _ = write!(
        out,
        "# HELP txrelay_http2_streams_active Current active HTTP/2 streams\n\
         # TYPE txrelay_http2_streams_active gauge\n\
         txrelay_http2_streams_active{{worker=\"{w}\"}} {}\n\n",
        m.h2_streams_active.get(),
    );
    counter(
        &mut out,
        w,
        "http2_rst_stream_total",
        "HTTP/2 RST_STREAM frames sent",
        m.h2_rst_stream_total.get(),
    );
    counter(&mut out, w, "http2_goaway_total", "HTTP/2 GOAWAY frames sent", m.h2_goaway_sent.get());

    let _ = write!(
        out,
        "# HELP txrelay_errors_total Errors by type\n\
         # TYPE txrelay_errors_total counter\n\
         txrelay_errors_total{{worker=\"{w}\",type=\"timeout\"}} {}\n\
         txrelay_errors_total{{worker=\"{w}\",type=\"parse_error\"}} {}\n\
         txrelay_errors_total{{worker=\"{w}\",type=\"tls_error\"}} {}\n\n",
        m.errors_timeout.get(),
        m.errors_parse.get(),
        m.errors_tls.get(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_slots_used Slots currently in use by tier\n\
         # TYPE txrelay_slots_used gauge\n"
    );
    for tier in Tier::ALL {
        let _ = write!(
            out,
            "txrelay_slots_used{{worker=\"{w}\",tier=\"{}\"}} {}\n",
            tier.name(),
            state.slots.used(tier),
        );
    }
    let _ = write!(
        out,
        "\n# HELP txrelay_slots_max Maximum slots by tier\n# TYPE txrelay_slots_max gauge\n"
    );
    for tier in Tier::ALL {
        let _ = write!(
            out,
            "txrelay_slots_max{{worker=\"{w}\",tier=\"{}\"}} {}\n",
            tier.name(),
            state.slots.capacity(tier),
        );
    }

    let _ = write!(
        out,
        "\n# HELP txrelay_rate_limiter_entries Current rate limiter table size\n\
         # TYPE txrelay_rate_limiter_entries gauge\n\
         txrelay_rate_limiter_entries{{worker=\"{w}\"}} {}\n\n",
        state.limiter.borrow().entry_count(),
    );

    counter(&mut out, w, "response_bytes_total", "Total response bytes sent", m.response_bytes_total.get());
    counter(
        &mut out,
        w,
        "slowloris_kills_total",
        "Connections killed by slowloris detection",
        m.slowloris_kills.get(),
    );
    counter(
        &mut out,
        w,
        "slot_promotion_failures_total",
        "Tier promotion failures due to no slots",
        m.slot_promotion_failures.get(),
    );
    counter(
        &mut out,
        w,
        "keepalive_reuses_total",
        "Requests served on reused keep-alive connections",
        m.keepalive_reuses.get(),
    );

    let _ = write!(
        out,
        "# HELP txrelay_endpoint_requests_total Requests by endpoint\n\
         # TYPE txrelay_endpoint_requests_total counter\n"
    );
    for route in [
        Route::Health,
        Route::Ready,
        Route::Alive,
        Route::Version,
        Route::Metrics,
        Route::Home,
        Route::Broadcast,
        Route::Result,
        Route::Docs,
        Route::Status,
        Route::Logos,
        Route::AcmeChallenge,
    ] {
        let _ = write!(
            out,
            "txrelay_endpoint_requests_total{{worker=\"{w}\",endpoint=\"{}\"}} {}\n",
            route.name(),
            state.metrics.endpoint_count(route),
        );
    }
    out.push('\n');

    counter(
        &mut out,
        w,
        "rpc_broadcasts_total",
        "Total transaction broadcast attempts",
        state.rpc.total_broadcasts.get(),
    );
    counter(
        &mut out,
        w,
        "rpc_broadcasts_success_total",
        "Successful transaction broadcasts",
        state.rpc.successful_broadcasts.get(),
    );
    counter(
        &mut out,
        w,
        "rpc_broadcasts_failed_total",
        "Failed transaction broadcasts",
        state.rpc.failed_broadcasts.get(),
    );

    if !state.rpc.clients().is_empty() {
        let _ = write!(
            out,
            "# HELP txrelay_rpc_requests_total Total RPC requests to Bitcoin node\n\
             # TYPE txrelay_rpc_requests_total counter\n"
        );
        for client in state.rpc.clients() {
            let _ = write!(
                out,
                "txrelay_rpc_requests_total{{worker=\"{w}\",chain=\"{}\"}} {}\n",
                client.chain(),
                client.request_count.get(),
            );
        }
        let _ = write!(
            out,
            "\n# HELP txrelay_rpc_errors_total Total RPC errors by chain\n\
             # TYPE txrelay_rpc_errors_total counter\n"
        );
        for client in state.rpc.clients() {
            let _ = write!(
                out,
                "txrelay_rpc_errors_total{{worker=\"{w}\",chain=\"{}\"}} {}\n",
                client.chain(),
                client.error_count.get(),
            );
        }
        let _ = write!(
            out,
            "\n# HELP txrelay_rpc_node_up Bitcoin node availability (1=up, 0=down)\n\
             # TYPE txrelay_rpc_node_up gauge\n"
        );
        for client in state.rpc.clients() {
            let _ = write!(
                out,
                "txrelay_rpc_node_up{{worker=\"{w}\",chain=\"{}\"}} {}\n",
                client.chain(),
                client.available.get() as u8,
            );
        }
    }

    out
}

#[cfg(target_os = "linux")]
fn open_fds() -> Option<i64> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.count() as i64)
}

#[cfg(not(target_os = "linux"))]
fn open_fds() -> Option<i64> {
    None
}

fn max_fds() -> Option<i64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we hand it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    (rc == 0).then_some(limit.rlim_cur as i64)
}

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::io::Write;

    use crate::chain::{Chain, ChainMode};
    use crate::config::Config;
    use crate::state::WorkerState;

    use super::*;

    fn test_state() -> std::rc::Rc<WorkerState> {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "index.html",
            "broadcast.html",
            "result.html",
            "error.html",
            "docs.html",
            "status.html",
            "logos.html",
        ] {
            let mut f = File::create(dir.path().join(name)).unwrap();
            write!(f, "<html>{name}</html>").unwrap();
        }
        let mut config = Config {
            static_dir: dir.path().to_owned(),
            chain: ChainMode::Single(Chain::Regtest),
            ..Config::default()
        };
        config.acme_challenge_dir = dir.path().join("acme");
        std::fs::create_dir_all(&config.acme_challenge_dir).unwrap();
        // the tempdir must outlive the state; leak it for the test.
        std::mem::forget(dir);
        WorkerState::new(0, config).unwrap()
    }

    #[tokio::test]
    async fn static_routes_serve_pages() {
        let state = test_state();
        let reply = dispatch(&state, "/").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body.as_ref(), b"<html>index.html</html>");
        assert_eq!(reply.cache, Cache::Static);

        let reply = dispatch(&state, "/docs").await;
        assert_eq!(reply.body.as_ref(), b"<html>docs.html</html>");

        let reply = dispatch(&state, "/nonsense").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.body.as_ref(), b"<html>error.html</html>");
    }

    #[tokio::test]
    async fn ready_flips_on_drain() {
        let state = test_state();
        assert_eq!(dispatch(&state, "/ready").await.status, StatusCode::OK);
        state.begin_drain();
        assert_eq!(dispatch(&state, "/ready").await.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(dispatch(&state, "/alive").await.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_shape() {
        let state = test_state();
        let reply = dispatch(&state, "/health").await;
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["slots"]["normal"]["max"], 100);
        assert_eq!(body["tls"]["enabled"], false);
        assert_eq!(reply.cache, Cache::NoStore);
    }

    #[tokio::test]
    async fn version_reports_crate_version() {
        let state = test_state();
        let reply = dispatch(&state, "/version").await;
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn metrics_exposition_shape() {
        let state = test_state();
        state.metrics.record_request(200, "GET", 0.004, 128, false);
        let reply = dispatch(&state, "/metrics").await;
        assert!(reply.close, "metrics connections are single use");
        let text = core::str::from_utf8(&reply.body).unwrap();
        assert!(text.contains("# TYPE txrelay_requests_total counter"));
        assert!(text.contains("txrelay_requests_total{worker=\"0\"} 1"));
        assert!(text.contains("txrelay_request_duration_seconds_bucket{worker=\"0\",le=\"0.005\"} 1"));
        assert!(text.contains("txrelay_request_duration_seconds_bucket{worker=\"0\",le=\"+Inf\"} 1"));
        assert!(text.contains("txrelay_slots_max{worker=\"0\",tier=\"huge\"} 5"));
        assert!(text.contains("txrelay_endpoint_requests_total{worker=\"0\",endpoint=\"/metrics\"} 1"));
    }

    #[tokio::test]
    async fn acme_serves_valid_token() {
        let state = test_state();
        std::fs::write(state.config.acme_challenge_dir.join("tok-123_abc"), b"proof").unwrap();

        let reply = dispatch(&state, "/.well-known/acme-challenge/tok-123_abc").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body.as_ref(), b"proof");

        let reply = dispatch(&state, "/.well-known/acme-challenge/missing").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn acme_rejects_bad_tokens() {
        let state = test_state();
        // the router never classifies traversal paths as acme, and the
        // handler rejects them again by charset.
        let reply = acme_challenge(&state, "/.well-known/acme-challenge/..%2fsecret").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        let reply = acme_challenge(&state, "/.well-known/acme-challenge/a.b").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn broadcast_without_backend_is_bad_gateway() {
        let state = test_state();
        let path = format!("/{}", "ab".repeat(100));
        let reply = dispatch(&state, &path).await;
        assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
        assert!(reply.body.starts_with(b"Broadcast failed:"));
    }

    #[tokio::test]
    async fn oversized_acme_file_not_served() {
        let state = test_state();
        let big = vec![b'x'; 5000];
        std::fs::write(state.config.acme_challenge_dir.join("big"), &big).unwrap();
        let reply = dispatch(&state, "/.well-known/acme-challenge/big").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }
}
