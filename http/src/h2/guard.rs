//! connection-level read policing for http/2 sessions.
//!
//! The h1 dispatcher runs its clocks inline; an h2 session reads
//! through this wrapper instead, so the same three checks (total age,
//! read inactivity, throughput floor) apply to the whole session
//! regardless of how many streams are open. Checks fire when bytes
//! arrive, mirroring the h1 ingest loop; inactivity is bounded by the
//! idle timer.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use std::io;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};
use tracing::warn;

use crate::h1::{MAX_REQUEST_TIME, MIN_BYTES_PER_CHECK, THROUGHPUT_CHECK_INTERVAL};
use crate::metrics::inc;
use crate::state::WorkerState;

pub(crate) struct SlowlorisGuard<Io> {
    io: Io,
    idle: Pin<Box<Sleep>>,
    state: Rc<WorkerState>,
    read_timeout: Duration,
    started: Instant,
    window_start: Instant,
    bytes_total: u64,
    bytes_at_window: u64,
}

impl<Io> SlowlorisGuard<Io> {
    pub(crate) fn new(io: Io, state: Rc<WorkerState>) -> Self {
        let read_timeout = state.config.read_timeout;
        let now = Instant::now();
        Self {
            io,
            idle: Box::pin(sleep(read_timeout)),
            state,
            read_timeout,
            started: now,
            window_start: now,
            bytes_total: 0,
            bytes_at_window: 0,
        }
    }
}

impl<Io: AsyncRead + Unpin> AsyncRead for SlowlorisGuard<Io> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.bytes_total += n as u64;

                    if this.started.elapsed() > MAX_REQUEST_TIME {
                        inc(&this.state.metrics.slowloris_kills);
                        warn!("slowloris kill: h2 session exceeded max age");
                        return Poll::Ready(Err(io::Error::other("session exceeded max request time")));
                    }

                    if this.window_start.elapsed() >= THROUGHPUT_CHECK_INTERVAL {
                        if this.bytes_total - this.bytes_at_window < MIN_BYTES_PER_CHECK {
                            inc(&this.state.metrics.slowloris_kills);
                            warn!("slowloris kill: h2 session below throughput floor");
                            return Poll::Ready(Err(io::Error::other("session below throughput floor")));
                        }
                        this.window_start = Instant::now();
                        this.bytes_at_window = this.bytes_total;
                    }

                    let deadline = Instant::now() + this.read_timeout;
                    this.idle.as_mut().reset(deadline);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match this.idle.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    inc(&this.state.metrics.errors_timeout);
                    Poll::Ready(Err(io::Error::from(io::ErrorKind::TimedOut)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<Io: AsyncWrite + Unpin> AsyncWrite for SlowlorisGuard<Io> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}
