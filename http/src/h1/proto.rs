//! request head scanning, parsing and response encoding.

use bytes::BytesMut;
use http::StatusCode;

use crate::handler::{Cache, Reply};
use crate::hex::is_hex;

pub(crate) const MAX_HEADERS: usize = 64;

/// Paths at least this long must be transaction hex; anything shorter
/// can still be a named route.
const EARLY_VALIDATION_MIN_PATH: usize = 64;

#[derive(Debug)]
pub(crate) struct Head {
    pub method: String,
    pub path: String,
    pub content_length: u64,
    pub keep_alive: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeadError {
    Malformed,
    BadContentLength,
}

/// Incremental `\r\n\r\n` search. `from` is the high-water mark of the
/// previous scan so bytes are never rescanned. Returns the index one
/// past the terminator.
pub(crate) fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + 4 {
        return None;
    }
    buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos + 4)
}

/// Next scan position after a failed search; keeps the last three
/// bytes so a terminator split across reads is still found.
pub(crate) fn scan_watermark(len: usize) -> usize {
    len.saturating_sub(3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathCheck {
    Ok,
    Invalid,
}

/// Validate the request path while it is still arriving. Once the path
/// body exceeds the txid length it must be pure hex (allowing a `tx/`
/// prefix); rejecting here stops a client from streaming megabytes of
/// junk before the head is even complete.
pub(crate) fn early_path_check(buf: &[u8]) -> PathCheck {
    let Some(sp) = buf.iter().position(|&b| b == b' ') else {
        // method not finished yet.
        return PathCheck::Ok;
    };

    let mut rest = &buf[sp + 1..];
    if rest.first() == Some(&b'/') {
        rest = &rest[1..];
    }

    let end = rest
        .iter()
        .position(|&b| b == b' ' || b == b'\r' || b == b'\n')
        .unwrap_or(rest.len());
    let path = &rest[..end];

    if path.len() < EARLY_VALIDATION_MIN_PATH {
        return PathCheck::Ok;
    }

    let body = match path.strip_prefix(b"tx/") {
        Some(tail) if path.len() > 3 => tail,
        _ => path,
    };

    if body.iter().all(|&b| is_hex(b)) {
        PathCheck::Ok
    } else {
        PathCheck::Invalid
    }
}

/// Strict Content-Length: digits only. A sign prefix is rejected
/// outright, never silently reinterpreted.
pub(crate) fn parse_content_length(value: &[u8]) -> Result<u64, HeadError> {
    let value = value.trim_ascii();
    if value.is_empty() || value[0] == b'+' || value[0] == b'-' {
        return Err(HeadError::BadContentLength);
    }
    let mut n: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(HeadError::BadContentLength);
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(b - b'0')))
            .ok_or(HeadError::BadContentLength)?;
    }
    Ok(n)
}

/// Parse a complete request head.
pub(crate) fn parse_head(raw: &[u8]) -> Result<Head, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let parsed = req.parse(raw).map_err(|_| HeadError::Malformed)?;
    if !matches!(parsed, httparse::Status::Complete(_)) {
        return Err(HeadError::Malformed);
    }

    let method = req.method.ok_or(HeadError::Malformed)?.to_owned();
    let path = req.path.ok_or(HeadError::Malformed)?.to_owned();

    // http/1.1 defaults to keep-alive, http/1.0 to close.
    let mut keep_alive = req.version == Some(1);
    let mut content_length = 0;

    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = parse_content_length(header.value)?;
        } else if header.name.eq_ignore_ascii_case("connection") {
            let value = header.value.trim_ascii();
            if value.len() >= 5 && value[..5].eq_ignore_ascii_case(b"close") {
                keep_alive = false;
            } else if value.len() >= 10 && value[..10].eq_ignore_ascii_case(b"keep-alive") {
                keep_alive = true;
            }
        }
    }

    Ok(Head {
        method,
        path,
        content_length,
        keep_alive,
    })
}

fn reason(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

fn encode_status_line(buf: &mut BytesMut, status: StatusCode) {
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(reason(status).as_bytes());
}

fn encode_length(buf: &mut BytesMut, len: usize) {
    let mut itoa = itoa::Buffer::new();
    buf.extend_from_slice(b"\r\nContent-Length: ");
    buf.extend_from_slice(itoa.format(len).as_bytes());
}

/// Head and body go into one buffer so they leave in one segment.
pub(crate) fn encode_reply(
    buf: &mut BytesMut,
    reply: &Reply,
    keep_alive: bool,
    request_id: &str,
    cache_max_age: u32,
) {
    encode_status_line(buf, reply.status);

    buf.extend_from_slice(b"\r\nContent-Type: ");
    buf.extend_from_slice(reply.content_type.as_bytes());

    encode_length(buf, reply.body.len());

    match reply.cache {
        Cache::Static if cache_max_age > 0 => {
            let mut itoa = itoa::Buffer::new();
            buf.extend_from_slice(b"\r\nCache-Control: public, max-age=");
            buf.extend_from_slice(itoa.format(cache_max_age).as_bytes());
        }
        _ => buf.extend_from_slice(b"\r\nCache-Control: no-store"),
    }

    encode_retry_after(buf, reply.status);

    buf.extend_from_slice(if keep_alive {
        b"\r\nConnection: keep-alive"
    } else {
        b"\r\nConnection: close"
    });

    buf.extend_from_slice(b"\r\nX-Request-ID: ");
    buf.extend_from_slice(request_id.as_bytes());

    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(&reply.body);
}

/// Plain-text error response. Always closes. Returns the body length
/// for the response-bytes accounting.
pub(crate) fn encode_error(buf: &mut BytesMut, status: StatusCode, request_id: &str) -> u64 {
    let body = format!("Error {}: {}\n", status.as_u16(), reason(status));

    encode_status_line(buf, status);
    buf.extend_from_slice(b"\r\nContent-Type: text/plain");
    encode_length(buf, body.len());
    encode_retry_after(buf, status);
    buf.extend_from_slice(b"\r\nConnection: close");
    buf.extend_from_slice(b"\r\nX-Request-ID: ");
    buf.extend_from_slice(request_id.as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(body.as_bytes());

    body.len() as u64
}

fn encode_retry_after(buf: &mut BytesMut, status: StatusCode) {
    match status {
        StatusCode::SERVICE_UNAVAILABLE => buf.extend_from_slice(b"\r\nRetry-After: 5"),
        StatusCode::TOO_MANY_REQUESTS => buf.extend_from_slice(b"\r\nRetry-After: 1"),
        _ => {}
    }
}
