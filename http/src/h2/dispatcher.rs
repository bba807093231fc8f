//! http/2 session and stream life cycle.
//!
//! The session task owns the `h2` connection and keeps polling accept;
//! each accepted stream passes admission (slot, path shape, tier) right
//! there, because the path length is known before any body arrives.
//! Accepted streams run as their own tasks, so responses complete in
//! whatever order their handlers finish.

use core::net::SocketAddr;
use core::time::Duration;

use std::rc::Rc;

use bytes::Bytes;
use ::h2::server::SendResponse;
use ::h2::{Reason, RecvStream};
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::handler::{self, Cache};
use crate::hex::is_all_hex;
use crate::metrics::{dec, inc};
use crate::slot::{SlotGuard, Tier};
use crate::state::WorkerState;

use super::guard::SlowlorisGuard;

pub(crate) const MAX_CONCURRENT_STREAMS: u32 = 100;
pub(crate) const INITIAL_WINDOW_SIZE: u32 = 1 << 20;
// one stream must not be able to throttle the whole session.
pub(crate) const CONNECTION_WINDOW_SIZE: u32 = 16 << 20;
const HEADER_LIST_SLACK: u32 = 1024;

// rapid-reset containment: cap tracked reset streams per window.
const RESET_STREAM_LIMIT: usize = 1000;
const RESET_STREAM_WINDOW: Duration = Duration::from_secs(33);

/// Serve one http/2 connection until close or drain.
///
/// `slot` is the connection's own admission slot from the accept path;
/// every stream additionally holds its own.
pub async fn serve<Io>(io: Io, state: Rc<WorkerState>, peer: SocketAddr, slot: SlotGuard)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let io = SlowlorisGuard::new(io, state.clone());

    let mut builder = ::h2::server::Builder::new();
    builder
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
        .initial_window_size(INITIAL_WINDOW_SIZE)
        .initial_connection_window_size(CONNECTION_WINDOW_SIZE)
        .max_header_list_size(
            state.config.max_buffer_size.min((u32::MAX - HEADER_LIST_SLACK) as usize) as u32 + HEADER_LIST_SLACK,
        )
        .max_concurrent_reset_streams(RESET_STREAM_LIMIT)
        .reset_stream_duration(RESET_STREAM_WINDOW)
        .max_pending_accept_reset_streams(RESET_STREAM_LIMIT);

    let mut conn = match builder.handshake::<_, Bytes>(io).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!("h2 handshake failed for {}: {e}", state.client_label(peer.ip()));
            return;
        }
    };

    let mut draining = state.is_draining();
    if draining {
        conn.graceful_shutdown();
        inc(&state.metrics.h2_goaway_sent);
    }

    loop {
        let accepted = if draining {
            conn.accept().await
        } else {
            tokio::select! {
                accepted = conn.accept() => accepted,
                _ = state.drain_event() => {
                    conn.graceful_shutdown();
                    inc(&state.metrics.h2_goaway_sent);
                    draining = true;
                    continue;
                }
            }
        };

        match accepted {
            Some(Ok((request, respond))) => accept_stream(&state, peer, request, respond),
            Some(Err(e)) => {
                debug!("h2 session error for {}: {e}", state.client_label(peer.ip()));
                break;
            }
            None => break,
        }
    }

    drop(slot);
}

/// Decrements the active-stream gauge however the stream ends.
struct StreamCounter {
    state: Rc<WorkerState>,
}

impl StreamCounter {
    fn new(state: &Rc<WorkerState>) -> Self {
        inc(&state.metrics.h2_streams_total);
        inc(&state.metrics.h2_streams_active);
        Self { state: state.clone() }
    }
}

impl Drop for StreamCounter {
    fn drop(&mut self) {
        dec(&self.state.metrics.h2_streams_active);
    }
}

/// Same rule as the h1 early validation: a path body past txid length
/// must be pure hex, `tx/` prefix allowed.
fn path_shape_ok(path: &str) -> bool {
    let content = path.strip_prefix('/').unwrap_or(path);
    let body = content.strip_prefix("tx/").unwrap_or(content);
    body.len() < 64 || is_all_hex(body.as_bytes())
}

fn reset(state: &WorkerState, respond: &mut SendResponse<Bytes>, reason: Reason) {
    respond.send_reset(reason);
    inc(&state.metrics.h2_rst_stream_total);
}

fn accept_stream(
    state: &Rc<WorkerState>,
    peer: SocketAddr,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
) {
    let counter = StreamCounter::new(state);

    let Some(slot) = SlotGuard::acquire(&state.slots, Tier::Normal) else {
        warn!("h2: no slot for new stream from {}", state.client_label(peer.ip()));
        reset(state, &mut respond, Reason::REFUSED_STREAM);
        return;
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| String::from("/"));

    if !path_shape_ok(&path) {
        inc(&state.metrics.errors_parse);
        warn!("h2: invalid characters in path from {}", state.client_label(peer.ip()));
        reset(state, &mut respond, Reason::REFUSED_STREAM);
        return;
    }

    // the path length already implies the tier; promote before a single
    // body byte arrives.
    let required = Tier::for_size(
        path.len(),
        state.config.tier_large_threshold,
        state.config.tier_huge_threshold,
    );
    if !slot.promote_for(required) {
        inc(&state.metrics.slot_promotion_failures);
        warn!(
            "h2: cannot promote stream from {} to {} tier",
            state.client_label(peer.ip()),
            required.name()
        );
        reset(state, &mut respond, Reason::REFUSED_STREAM);
        return;
    }

    let state = state.clone();
    tokio::task::spawn_local(async move {
        handle_stream(state, peer, path, request, respond, slot, counter).await;
    });
}

async fn handle_stream(
    state: Rc<WorkerState>,
    peer: SocketAddr,
    path: String,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    slot: SlotGuard,
    counter: StreamCounter,
) {
    let start = Instant::now();
    let method = request.method().as_str().to_owned();
    let request_id = state.next_request_id();

    // count the body, never keep it.
    let mut body = request.into_body();
    let mut body_received: u64 = 0;
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                body_received += data.len() as u64;
                let _ = body.flow_control().release_capacity(data.len());
            }
            Err(e) => {
                debug!("h2 stream body error from {}: {e}", state.client_label(peer.ip()));
                return;
            }
        }
    }
    let _ = body_received;

    let reply = handler::dispatch(&state, &path).await;

    // the expensive slot was only needed while the request was coming
    // in; free it before the response bytes go out.
    slot.demote_to_normal();

    let status = reply.status.as_u16();
    let bytes = reply.body.len() as u64;

    let cache_value = match reply.cache {
        Cache::Static if state.config.cache_max_age > 0 => {
            match HeaderValue::from_str(&format!("public, max-age={}", state.config.cache_max_age)) {
                Ok(value) => value,
                Err(_) => HeaderValue::from_static("no-store"),
            }
        }
        _ => HeaderValue::from_static("no-store"),
    };

    let response = Response::builder()
        .status(reply.status)
        .header(CONTENT_TYPE, reply.content_type)
        .header(CONTENT_LENGTH, reply.body.len())
        .header(CACHE_CONTROL, cache_value)
        .header("x-request-id", &request_id)
        .body(());
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            debug!("h2 response build failed: {e}");
            reset(&state, &mut respond, Reason::INTERNAL_ERROR);
            return;
        }
    };

    // send_data takes ownership of the bytes; the page keeps living in
    // the worker while the library writes the copy out after this task
    // is long gone.
    let end_of_stream = reply.body.is_empty();
    match respond.send_response(response, end_of_stream) {
        Ok(mut stream) => {
            if !end_of_stream {
                if let Err(e) = stream.send_data(reply.body.clone(), true) {
                    debug!("h2 send_data failed: {e}");
                    return;
                }
            }
        }
        Err(e) => {
            debug!("h2 send_response failed: {e}");
            return;
        }
    }

    let duration = start.elapsed().as_secs_f64();
    state.metrics.record_request(status, &method, duration, bytes, false);
    state.log_access(
        peer.ip(),
        &method,
        &path,
        status,
        bytes,
        duration * 1000.0,
        &request_id,
    );

    drop(slot);
    drop(counter);
}
