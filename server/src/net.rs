//! listener sockets and canned reject responses.

use std::io;
use std::net::{Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const BACKLOG: i32 = 1024;

/// Dual-stack `SO_REUSEPORT` listener. Every worker binds its own copy
/// of the same port and the kernel spreads accepts across them.
pub fn bind_reuseport(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(false)?;

    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 10\r\n\
    Connection: close\r\n\
    \r\n\
    Forbidden\n";

pub const RESPONSE_429: &[u8] = b"HTTP/1.1 429 Too Many Requests\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 18\r\n\
    Connection: close\r\n\
    Retry-After: 1\r\n\
    \r\n\
    Too Many Requests\n";

pub const RESPONSE_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 20\r\n\
    Connection: close\r\n\
    Retry-After: 5\r\n\
    \r\n\
    Service Unavailable\n";

/// Best-effort canned reject; the socket closes either way.
pub async fn send_canned(mut stream: TcpStream, response: &'static [u8]) {
    let _ = stream.write_all(response).await;
    let _ = stream.shutdown().await;
}

/// Errors from `accept()` that only concern the connection that was
/// being accepted; the next accept may well succeed immediately.
pub fn connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn two_listeners_share_a_port() {
        let first = bind_reuseport(0).unwrap();
        let port = first.local_addr().unwrap().port();
        // the whole point of SO_REUSEPORT: a second bind must succeed.
        let _second = bind_reuseport(port).unwrap();
    }

    #[tokio::test]
    async fn dual_stack_accepts_ipv4() {
        let listener = bind_reuseport(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let connect = TcpStream::connect(("127.0.0.1", port));
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        accepted.unwrap();
        connected.unwrap();
    }

    #[test]
    fn canned_responses_have_accurate_lengths() {
        for response in [RESPONSE_403, RESPONSE_429, RESPONSE_503] {
            let text = core::str::from_utf8(response).unwrap();
            let (head, body) = text.split_once("\r\n\r\n").unwrap();
            let declared: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(declared, body.len(), "in {text:?}");
        }
    }
}
