//! per-connection request loop.
//!
//! One task per accepted connection drives the whole life cycle:
//! ingest under slowloris checks, tier promotion by buffered size,
//! dispatch, response write, keep-alive reset. The task being the only
//! driver of its socket is what guarantees responses never reorder on
//! one connection.

use core::net::SocketAddr;
use core::time::Duration;

use std::io;
use std::rc::Rc;

use bytes::BytesMut;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::handler;
use crate::metrics::inc;
use crate::slot::{SlotGuard, Tier};
use crate::state::WorkerState;

use super::proto::{self, HeadError, PathCheck};

pub(crate) const THROUGHPUT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const MIN_BYTES_PER_CHECK: u64 = 100;
pub(crate) const MAX_REQUEST_TIME: Duration = Duration::from_secs(120);

/// Why the connection ended without (or despite) a response.
enum End {
    Eof,
    Io(io::Error),
    Timeout,
    Slowloris,
}

/// Serve one accepted http/1.1 connection until close.
pub async fn serve<Io>(io: Io, state: Rc<WorkerState>, peer: SocketAddr, slot: SlotGuard)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(io, state, peer, slot);

    match conn.run().await {
        Ok(()) | Err(End::Eof) => {}
        Err(End::Io(e)) => {
            debug!("connection error from {}: {e}", conn.client());
        }
        Err(End::Timeout) => {
            inc(&conn.state.metrics.errors_timeout);
            warn!("connection timeout from {}", conn.client());
        }
        Err(End::Slowloris) => {
            inc(&conn.state.metrics.slowloris_kills);
            warn!("slowloris kill for {}", conn.client());
        }
    }

    let _ = conn.io.shutdown().await;
}

struct Connection<Io> {
    io: Io,
    state: Rc<WorkerState>,
    peer: SocketAddr,
    slot: SlotGuard,

    read_buf: BytesMut,
    write_buf: BytesMut,

    request_id: String,
    keep_alive: bool,
    requests_served: u64,

    start: Instant,
    window_start: Instant,
    bytes_at_window: u64,
    total_read: u64,
    headers_scanned: usize,
}

impl<Io> Connection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    fn new(io: Io, state: Rc<WorkerState>, peer: SocketAddr, slot: SlotGuard) -> Self {
        let now = Instant::now();
        let request_id = state.next_request_id();
        let initial = state.config.initial_buffer_size;
        Self {
            io,
            state,
            peer,
            slot,
            read_buf: BytesMut::with_capacity(initial),
            write_buf: BytesMut::new(),
            request_id,
            keep_alive: true,
            requests_served: 0,
            start: now,
            window_start: now,
            bytes_at_window: 0,
            total_read: 0,
            headers_scanned: 0,
        }
    }

    fn client(&self) -> String {
        self.state.client_label(self.peer.ip())
    }

    async fn run(&mut self) -> Result<(), End> {
        loop {
            let keep = self.serve_one().await?;
            if !keep {
                return Ok(());
            }
            if !self.reset_for_keepalive() {
                // no normal slot for the next request.
                return Ok(());
            }
        }
    }

    /// Read one byte-progress unit under the three clocks: total
    /// request age, read inactivity, throughput floor.
    async fn fill(&mut self) -> Result<usize, End> {
        if self.start.elapsed() > MAX_REQUEST_TIME {
            return Err(End::Slowloris);
        }

        let n = timeout(self.state.config.read_timeout, self.io.read_buf(&mut self.read_buf))
            .await
            .map_err(|_| End::Timeout)?
            .map_err(End::Io)?;
        if n == 0 {
            return Err(End::Eof);
        }
        self.total_read += n as u64;

        if self.window_start.elapsed() >= THROUGHPUT_CHECK_INTERVAL {
            if self.total_read - self.bytes_at_window < MIN_BYTES_PER_CHECK {
                return Err(End::Slowloris);
            }
            self.window_start = Instant::now();
            self.bytes_at_window = self.total_read;
        }

        Ok(n)
    }

    async fn serve_one(&mut self) -> Result<bool, End> {
        let max_buffer = self.state.config.max_buffer_size;
        let large = self.state.config.tier_large_threshold;
        let huge = self.state.config.tier_huge_threshold;

        // ---- ingest the request head ----
        let head_end = loop {
            if self.read_buf.len() > max_buffer {
                warn!("request head exceeds max buffer size from {}", self.client());
                return self
                    .finish_error(StatusCode::PAYLOAD_TOO_LARGE, "???", "/")
                    .await;
            }

            let required = Tier::for_size(self.read_buf.len(), large, huge);
            if !self.slot.promote_for(required) {
                inc(&self.state.metrics.slot_promotion_failures);
                warn!(
                    "cannot promote {} to {} tier, rejecting",
                    self.client(),
                    required.name()
                );
                return self
                    .finish_error(StatusCode::SERVICE_UNAVAILABLE, "???", "/")
                    .await;
            }

            if let Some(end) = proto::find_headers_end(&self.read_buf, self.headers_scanned) {
                break end;
            }
            self.headers_scanned = proto::scan_watermark(self.read_buf.len());

            if proto::early_path_check(&self.read_buf) == PathCheck::Invalid {
                inc(&self.state.metrics.errors_parse);
                warn!("invalid characters in path from {}", self.client());
                return self.finish_error(StatusCode::BAD_REQUEST, "???", "/").await;
            }

            self.fill().await?;
        };

        // the head may have completed in the same read as its invalid
        // tail; run the path check once more over the finished head.
        if proto::early_path_check(&self.read_buf[..head_end]) == PathCheck::Invalid {
            inc(&self.state.metrics.errors_parse);
            warn!("invalid characters in path from {}", self.client());
            return self.finish_error(StatusCode::BAD_REQUEST, "???", "/").await;
        }

        let head = match proto::parse_head(&self.read_buf[..head_end]) {
            Ok(head) => head,
            Err(HeadError::Malformed) | Err(HeadError::BadContentLength) => {
                inc(&self.state.metrics.errors_parse);
                warn!("unparseable request head from {}", self.client());
                return self.finish_error(StatusCode::BAD_REQUEST, "???", "/").await;
            }
        };
        self.keep_alive = head.keep_alive;

        if head.content_length > max_buffer as u64 {
            warn!(
                "content-length {} above max buffer size from {}",
                head.content_length,
                self.client()
            );
            return self
                .finish_error(StatusCode::PAYLOAD_TOO_LARGE, &head.method, &head.path)
                .await;
        }

        // ---- drain the body ----
        let _ = self.read_buf.split_to(head_end);
        let mut received = (self.read_buf.len() as u64).min(head.content_length);
        // trailing bytes past the declared body would be a pipelined
        // request; both are discarded alike.
        self.read_buf.clear();
        while received < head.content_length {
            let n = self.fill().await? as u64;
            received += n.min(head.content_length - received);
            self.read_buf.clear();
        }

        // response phase only needs a normal slot.
        self.slot.demote_to_normal();
        if !self.slot.is_held() {
            self.keep_alive = false;
        }

        // ---- dispatch and respond ----
        let reply = handler::dispatch(&self.state, &head.path).await;
        let keep = self.keep_alive && !reply.close;

        let status = reply.status.as_u16();
        let bytes = reply.body.len() as u64;
        proto::encode_reply(
            &mut self.write_buf,
            &reply,
            keep,
            &self.request_id,
            self.state.config.cache_max_age,
        );
        self.flush_response().await?;

        self.record(status, &head.method, &head.path, bytes);
        Ok(keep)
    }

    async fn finish_error(&mut self, status: StatusCode, method: &str, path: &str) -> Result<bool, End> {
        self.keep_alive = false;
        let bytes = proto::encode_error(&mut self.write_buf, status, &self.request_id);
        self.flush_response().await?;
        self.record(status.as_u16(), method, path, bytes);
        Ok(false)
    }

    async fn flush_response(&mut self) -> Result<(), End> {
        self.io.write_all(&self.write_buf).await.map_err(End::Io)?;
        self.io.flush().await.map_err(End::Io)?;
        self.write_buf.clear();
        Ok(())
    }

    fn record(&self, status: u16, method: &str, path: &str, bytes: u64) {
        let duration = self.start.elapsed().as_secs_f64();
        self.state
            .metrics
            .record_request(status, method, duration, bytes, self.requests_served > 0);
        self.state.log_access(
            self.peer.ip(),
            method,
            path,
            status,
            bytes,
            duration * 1000.0,
            &self.request_id,
        );
    }

    /// Rearm the connection for the next request on the wire.
    fn reset_for_keepalive(&mut self) -> bool {
        if !self.slot.reacquire_normal() {
            return false;
        }
        self.read_buf.clear();
        self.headers_scanned = 0;
        self.request_id = self.state.next_request_id();
        self.start = Instant::now();
        self.window_start = self.start;
        self.bytes_at_window = self.total_read;
        self.requests_served += 1;
        true
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::io::Write;

    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
    use tokio::task::LocalSet;

    use crate::chain::{Chain, ChainMode};
    use crate::config::Config;
    use crate::slot::Tier;

    use super::*;

    fn test_config() -> Config {
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
        let config = Config {
            static_dir: dir.path().to_owned(),
            chain: ChainMode::Single(Chain::Regtest),
            ..Config::default()
        };
        std::mem::forget(dir);
        config
    }

    fn test_state(config: Config) -> Rc<WorkerState> {
        WorkerState::new(0, config).unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Spawn the dispatcher over an in-memory pipe and hand back the
    /// client end.
    fn spawn_conn(local: &LocalSet, state: &Rc<WorkerState>) -> DuplexStream {
        let (client, server) = duplex(256 * 1024);
        let state = state.clone();
        local.spawn_local(async move {
            let slot = SlotGuard::acquire(&state.slots, Tier::Normal).unwrap();
            serve(server, state, peer(), slot).await;
        });
        client
    }

    async fn read_until_closed(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    async fn read_one_response(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "connection closed before a full response");
            out.extend_from_slice(&chunk[..n]);
            if let Some(head_end) = out.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&out[..head_end]).into_owned();
                let body_len: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .map(|v| v.parse().unwrap())
                    .unwrap_or(0);
                if out.len() >= head_end + 4 + body_len {
                    return String::from_utf8(out).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn health_round_trip() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                client
                    .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
                    .await
                    .unwrap();
                let response = read_until_closed(&mut client).await;

                assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
                assert!(response.contains("X-Request-ID: 0-"));
                assert!(response.contains("Cache-Control: no-store"));
                assert!(response.contains("\"status\":\"healthy\""));
                assert_eq!(state.metrics.requests_processed.get(), 1);
                assert_eq!(state.metrics.status_200.get(), 1);
                assert_eq!(state.slots.total(), 0, "slot released on close");
            })
            .await;
    }

    #[tokio::test]
    async fn keep_alive_reuse() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                client
                    .write_all(b"GET /health HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                    .await
                    .unwrap();
                let first = read_one_response(&mut client).await;
                assert!(first.contains("Connection: keep-alive"));

                client.write_all(b"GET /alive HTTP/1.1\r\n\r\n").await.unwrap();
                let second = read_one_response(&mut client).await;
                assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));

                assert_eq!(state.metrics.requests_processed.get(), 2);
                assert_eq!(state.metrics.keepalive_reuses.get(), 1);

                let first_id = first.lines().find(|l| l.starts_with("X-Request-ID:")).unwrap();
                let second_id = second.lines().find(|l| l.starts_with("X-Request-ID:")).unwrap();
                assert_ne!(first_id, second_id, "request id regenerated per request");

                drop(client);
            })
            .await;
    }

    #[tokio::test]
    async fn long_junk_path_fails_fast() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                // an unfinished request line: validation must not wait
                // for the full head.
                let line = format!("GET /{}", "z".repeat(200));
                client.write_all(line.as_bytes()).await.unwrap();
                let response = read_until_closed(&mut client).await;

                assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
                assert!(response.contains("Connection: close"));
                assert_eq!(state.metrics.errors_parse.get(), 1);
                assert_eq!(state.metrics.status_400.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn hex_path_of_exactly_64_serves_result_page() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                let request = format!("GET /{} HTTP/1.1\r\nConnection: close\r\n\r\n", "a".repeat(64));
                client.write_all(request.as_bytes()).await.unwrap();
                let response = read_until_closed(&mut client).await;
                assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
                assert!(response.ends_with("<html>result.html</html>"));
            })
            .await;
    }

    #[tokio::test]
    async fn content_length_sign_is_rejected() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                client
                    .write_all(b"GET /health HTTP/1.1\r\nContent-Length: +5\r\n\r\n")
                    .await
                    .unwrap();
                let response = read_until_closed(&mut client).await;
                assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            })
            .await;
    }

    #[tokio::test]
    async fn content_length_boundary() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut config = test_config();
                config.max_buffer_size = 8192;
                let state = test_state(config);

                // exactly max_buffer_size is allowed.
                let mut client = spawn_conn(&local, &state);
                let body = "x".repeat(8192);
                let request =
                    format!("POST /health HTTP/1.1\r\nContent-Length: 8192\r\nConnection: close\r\n\r\n{body}");
                client.write_all(request.as_bytes()).await.unwrap();
                let response = read_until_closed(&mut client).await;
                assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

                // one byte more is not.
                let mut client = spawn_conn(&local, &state);
                client
                    .write_all(b"POST /health HTTP/1.1\r\nContent-Length: 8193\r\n\r\n")
                    .await
                    .unwrap();
                let response = read_until_closed(&mut client).await;
                assert!(response.starts_with("HTTP/1.1 413 "), "{response}");
            })
            .await;
    }

    #[tokio::test]
    async fn promotion_failure_returns_503() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut config = test_config();
                config.tier_large_threshold = 1024;
                config.tier_huge_threshold = 64 * 1024;
                config.slots_large_max = 0;
                let state = test_state(config);
                let mut client = spawn_conn(&local, &state);

                let request = format!("GET /{} HTTP/1.1\r\n\r\n", "ab".repeat(2000));
                client.write_all(request.as_bytes()).await.unwrap();
                let response = read_until_closed(&mut client).await;

                assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
                assert!(response.contains("Retry-After: 5"));
                assert_eq!(state.metrics.slot_promotion_failures.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn dual_tier_promotion_exhausts_huge() {
        let local = LocalSet::new();
        local
            .run_until(async {
                // large fits, huge does not: the request must die when
                // it crosses the huge threshold.
                let mut config = test_config();
                config.tier_large_threshold = 1024;
                config.tier_huge_threshold = 16 * 1024;
                config.slots_normal_max = 1;
                config.slots_large_max = 1;
                config.slots_huge_max = 0;
                let state = test_state(config);
                let mut client = spawn_conn(&local, &state);

                let request = format!("GET /{} HTTP/1.1\r\n\r\n", "ab".repeat(20_000));
                client.write_all(request.as_bytes()).await.unwrap();
                let response = read_until_closed(&mut client).await;

                assert!(response.starts_with("HTTP/1.1 503 "));
                assert_eq!(state.metrics.slot_promotion_failures.get(), 1);
                assert_eq!(state.slots.total(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn pipelined_request_is_discarded() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                client
                    .write_all(
                        b"GET /alive HTTP/1.1\r\n\r\nGET /health HTTP/1.1\r\n\r\n",
                    )
                    .await
                    .unwrap();
                let first = read_one_response(&mut client).await;
                assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

                // the trailing request was dropped with the buffer; eof
                // now ends the connection with exactly one response.
                client.shutdown().await.unwrap();
                let rest = read_until_closed(&mut client).await;
                assert_eq!(rest, "");
                assert_eq!(state.metrics.requests_processed.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                // no bytes at all; the read timeout closes the socket.
                let response = read_until_closed(&mut client).await;
                assert_eq!(response, "");
                assert_eq!(state.metrics.errors_timeout.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dribble_is_killed() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let state = test_state(test_config());
                let mut client = spawn_conn(&local, &state);

                client.write_all(b"GET /aaaa").await.unwrap();
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_secs(6)).await;
                    if client.write_all(b"aaaaaaaaaa").await.is_err() {
                        break;
                    }
                }

                let response = read_until_closed(&mut client).await;
                assert_eq!(response, "", "killed without a response");
                assert_eq!(state.metrics.slowloris_kills.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn large_request_demotes_after_ingest() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut config = test_config();
                config.tier_large_threshold = 64;
                config.tier_huge_threshold = 1024 * 1024;
                let state = test_state(config);
                let mut client = spawn_conn(&local, &state);

                // the head alone crosses the large threshold; after the
                // response the connection must be back on a normal slot.
                let hex = "ab".repeat(32);
                let request = format!("GET /tx/{hex} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
                client.write_all(request.as_bytes()).await.unwrap();
                let response = read_one_response(&mut client).await;
                assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

                assert_eq!(state.slots.used(Tier::Large), 0, "large slot given back");
                assert_eq!(state.slots.used(Tier::Normal), 1, "connection kept a normal slot");
                drop(client);
            })
            .await;
    }
}
