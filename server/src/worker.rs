//! worker process: event loop, accept path, drain.

use core::fmt;
use core::net::SocketAddr;
use core::time::Duration;

use std::io;
use std::rc::Rc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use txrelay_http::acl::AclDecision;
use txrelay_http::config::Config;
use txrelay_http::metrics::inc;
use txrelay_http::rate::CLEANUP_INTERVAL;
use txrelay_http::slot::{SlotGuard, Tier};
use txrelay_http::state::{InitError, WorkerState};
use txrelay_http::tls;
use txrelay_http::{h1, h2};

use crate::net;

#[derive(Debug)]
pub enum WorkerError {
    Init(InitError),
    Bind(io::Error),
    Runtime(io::Error),
    Signals(io::Error),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Init(e) => write!(f, "initialisation failed: {e}"),
            WorkerError::Bind(e) => write!(f, "cannot bind listener: {e}"),
            WorkerError::Runtime(e) => write!(f, "cannot build runtime: {e}"),
            WorkerError::Signals(e) => write!(f, "cannot install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Worker entry point; returns once the worker has drained.
pub fn run(worker_id: usize, config: Config) -> Result<(), WorkerError> {
    pin_to_cpu(worker_id);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::Runtime)?;
    let local = LocalSet::new();

    runtime.block_on(local.run_until(worker_main(worker_id, config)))
}

async fn worker_main(worker_id: usize, config: Config) -> Result<(), WorkerError> {
    let state = WorkerState::new(worker_id, config).map_err(WorkerError::Init)?;

    let listener = net::bind_reuseport(state.config.listen_port).map_err(WorkerError::Bind)?;
    info!("listening on port {} (SO_REUSEPORT)", state.config.listen_port);

    let tls_listener = if state.tls.is_some() {
        let listener = net::bind_reuseport(state.config.tls.port).map_err(WorkerError::Bind)?;
        info!("tls listener started on port {}", state.config.tls.port);
        Some(listener)
    } else {
        None
    };

    install_signal_handlers(&state).map_err(WorkerError::Signals)?;

    // backend status before the listeners go live.
    state.rpc.probe_and_log().await;

    {
        let state = state.clone();
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.limiter.borrow_mut().tick();
            }
        });
    }

    tokio::task::spawn_local(accept_loop(state.clone(), listener, false));
    if let Some(listener) = tls_listener {
        tokio::task::spawn_local(accept_loop(state.clone(), listener, true));
    }

    info!("worker {} started", state.worker_id);

    state.drained().await;
    info!(
        "no active connections, exiting ({} requests processed)",
        state.metrics.requests_processed.get()
    );
    Ok(())
}

fn install_signal_handlers(state: &Rc<WorkerState>) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut drain = signal(SignalKind::user_defined1())?;
    let mut reload = signal(SignalKind::user_defined2())?;

    {
        let state = state.clone();
        tokio::task::spawn_local(async move {
            if drain.recv().await.is_some() {
                info!("received drain signal, stopping accepts");
                state.begin_drain();
            }
        });
    }

    {
        let state = state.clone();
        tokio::task::spawn_local(async move {
            while reload.recv().await.is_some() {
                match &state.tls {
                    Some(tls) => {
                        if let Err(e) = tls.reload() {
                            error!("tls certificate reload failed: {e}");
                        }
                    }
                    None => warn!("tls not enabled, ignoring certificate reload signal"),
                }
            }
        });
    }

    Ok(())
}

async fn accept_loop(state: Rc<WorkerState>, listener: TcpListener, is_tls: bool) {
    loop {
        if state.is_draining() {
            info!("stopped accepting new connections");
            return;
        }

        let (stream, peer) = tokio::select! {
            _ = state.drain_event() => continue,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(ref e) if net::connection_error(e) => continue,
                Err(e) => {
                    error!("accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };

        admit(&state, stream, peer, is_tls);
    }
}

/// The admission ladder of the accept path: acl, rate limit, slot.
/// Every rejection answers with a fixed canned response and closes.
fn admit(state: &Rc<WorkerState>, stream: TcpStream, peer: SocketAddr, is_tls: bool) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("cannot set TCP_NODELAY: {e}");
    }

    match state.acl.check(peer.ip()) {
        AclDecision::Block => {
            inc(&state.metrics.connections_rejected_blocked);
            tokio::task::spawn_local(net::send_canned(stream, net::RESPONSE_403));
            return;
        }
        AclDecision::Allow => inc(&state.metrics.connections_allowlisted),
        AclDecision::Neutral => {
            if !state.limiter.borrow_mut().allow(peer.ip()) {
                inc(&state.metrics.connections_rejected_rate);
                tokio::task::spawn_local(net::send_canned(stream, net::RESPONSE_429));
                return;
            }
        }
    }

    let Some(slot) = SlotGuard::acquire(&state.slots, Tier::Normal) else {
        inc(&state.metrics.connections_rejected_slot);
        tokio::task::spawn_local(net::send_canned(stream, net::RESPONSE_503));
        return;
    };

    inc(&state.metrics.connections_accepted);
    state.connection_opened();

    let state = state.clone();
    tokio::task::spawn_local(async move {
        if is_tls {
            serve_tls(&state, stream, peer, slot).await;
        } else {
            h1::serve(stream, state.clone(), peer, slot).await;
        }
        state.connection_closed();
    });
}

async fn serve_tls(state: &Rc<WorkerState>, stream: TcpStream, peer: SocketAddr, slot: SlotGuard) {
    let Some(terminator) = state.tls.clone() else {
        return;
    };

    let stream = match timeout(state.config.read_timeout, terminator.accept(stream)).await {
        Err(_) => {
            inc(&state.metrics.errors_timeout);
            debug!("tls handshake timed out for {}", state.client_label(peer.ip()));
            return;
        }
        Ok(Err(e)) => {
            inc(&state.metrics.tls_handshake_errors);
            inc(&state.metrics.errors_tls);
            debug!("tls handshake failed for {}: {e}", state.client_label(peer.ip()));
            return;
        }
        Ok(Ok(stream)) => stream,
    };

    match tls::protocol_label(&stream) {
        Some("TLSv1.3") => inc(&state.metrics.tls_handshakes_tls13),
        Some("TLSv1.2") => inc(&state.metrics.tls_handshakes_tls12),
        _ => {}
    }

    if tls::negotiated_h2(&stream) {
        debug!("alpn selected h2 for {}", state.client_label(peer.ip()));
        h2::serve(stream, state.clone(), peer, slot).await;
    } else {
        h1::serve(stream, state.clone(), peer, slot).await;
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(worker_id: usize) {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let cpu = worker_id % cpus;

    // SAFETY: cpu_set_t is plain data; sched_setaffinity reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0 {
            info!("pinned to cpu {cpu}");
        } else {
            warn!("failed to pin to cpu {cpu}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_worker_id: usize) {
    debug!("cpu affinity not supported on this platform");
}
