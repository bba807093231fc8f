//! supervisor process: spawn, monitor, reload, drain.
//!
//! Workers are separate OS processes started by re-executing this
//! binary with `--worker-id`; each re-reads the configuration file, so
//! a reload generation picks up the new file without any state being
//! shipped between processes.

use core::time::Duration;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use txrelay_http::config::Config;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

struct WorkerExit {
    pid: u32,
    worker_id: usize,
    status: Option<std::process::ExitStatus>,
}

pub fn run(config_path: &Path, config: &Config, num_workers: usize) -> ExitCode {
    let slots_total = u64::from(config.slots_normal_max)
        + u64::from(config.slots_large_max)
        + u64::from(config.slots_huge_max);
    if !check_fd_limits(num_workers as u64, slots_total) {
        error!("insufficient file descriptor limits, cannot start");
        return ExitCode::FAILURE;
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("cannot determine executable path: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot build runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_async(exe, config_path.to_owned(), num_workers)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("supervisor failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_async(exe: PathBuf, config_path: PathBuf, num_workers: usize) -> io::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerExit>();

    let mut workers: Vec<Option<u32>> = (0..num_workers)
        .map(|worker_id| spawn_worker(&exe, &config_path, worker_id, &tx))
        .collect();
    let mut draining: HashSet<u32> = HashSet::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    info!("supervisor running, {num_workers} workers active");
    info!("send SIGTERM for graceful shutdown, SIGHUP for reload");

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sighup.recv() => {
                reload(&exe, &config_path, &mut workers, &mut draining, &tx);
            }
            Some(exit) = rx.recv() => {
                handle_worker_exit(&exe, &config_path, &mut workers, &mut draining, &tx, exit);
            }
        }
    }

    shutdown(&mut workers, &mut rx).await;
    Ok(())
}

fn spawn_worker(
    exe: &Path,
    config_path: &Path,
    worker_id: usize,
    tx: &mpsc::UnboundedSender<WorkerExit>,
) -> Option<u32> {
    let spawned = Command::new(exe)
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .arg(config_path)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            error!("failed to start worker {worker_id}: {e}");
            return None;
        }
    };

    let pid = child.id().unwrap_or(0);
    info!("started worker {worker_id} (pid {pid})");

    let tx = tx.clone();
    tokio::spawn(async move {
        let status = child.wait().await.ok();
        let _ = tx.send(WorkerExit { pid, worker_id, status });
    });

    Some(pid)
}

fn handle_worker_exit(
    exe: &Path,
    config_path: &Path,
    workers: &mut [Option<u32>],
    draining: &mut HashSet<u32>,
    tx: &mpsc::UnboundedSender<WorkerExit>,
    exit: WorkerExit,
) {
    // an old-generation worker finishing its drain is the expected end
    // of a reload.
    if draining.remove(&exit.pid) {
        info!("draining worker (pid {}) exited", exit.pid);
        return;
    }

    if workers.get(exit.worker_id).copied().flatten() != Some(exit.pid) {
        warn!("unknown child process {} exited", exit.pid);
        return;
    }

    match exit.status {
        Some(status) => warn!(
            "worker {} (pid {}) exited unexpectedly ({status})",
            exit.worker_id, exit.pid
        ),
        None => warn!("worker {} (pid {}) exited unexpectedly", exit.worker_id, exit.pid),
    }

    info!("restarting worker {}", exit.worker_id);
    workers[exit.worker_id] = spawn_worker(exe, config_path, exit.worker_id, tx);
}

/// Zero-downtime reload: validate the new config, put the whole current
/// generation into drain, and start a fresh generation immediately.
/// `SO_REUSEPORT` keeps both generations serving while the old one
/// finishes its in-flight requests.
fn reload(
    exe: &Path,
    config_path: &Path,
    workers: &mut [Option<u32>],
    draining: &mut HashSet<u32>,
    tx: &mpsc::UnboundedSender<WorkerExit>,
) {
    info!("reload requested");
    if let Err(e) = Config::load(config_path) {
        error!("reload aborted, new configuration is unusable: {e}");
        return;
    }

    for slot in workers.iter_mut() {
        if let Some(pid) = slot.take() {
            draining.insert(pid);
            signal_pid(pid, libc::SIGUSR1);
        }
    }

    for worker_id in 0..workers.len() {
        workers[worker_id] = spawn_worker(exe, config_path, worker_id, tx);
    }

    info!("reload complete, old generation draining");
}

async fn shutdown(workers: &mut [Option<u32>], rx: &mut mpsc::UnboundedReceiver<WorkerExit>) {
    info!("shutdown requested, draining workers");

    let mut remaining: HashSet<u32> = workers.iter().flatten().copied().collect();
    for &pid in &remaining {
        signal_pid(pid, libc::SIGUSR1);
    }

    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    while !remaining.is_empty() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(exit)) => {
                remaining.remove(&exit.pid);
                info!("worker exited, {} remaining", remaining.len());
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    for pid in remaining {
        warn!("force killing worker (pid {pid})");
        signal_pid(pid, libc::SIGKILL);
    }

    info!("all workers stopped");
}

pub fn signal_pid(pid: u32, sig: i32) {
    // SAFETY: plain kill(2) on a pid this process spawned.
    let rc = unsafe { libc::kill(pid as i32, sig) };
    if rc != 0 {
        warn!("kill({pid}, {sig}) failed: {}", io::Error::last_os_error());
    }
}

/// Raise the soft fd limit toward what the worker fleet needs; refuse
/// to start below the hard floor.
fn check_fd_limits(num_workers: u64, slots_total: u64) -> bool {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we hand it.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        warn!("getrlimit failed: {}", io::Error::last_os_error());
        return true;
    }

    let per_worker = slots_total + 15;
    let required = num_workers * per_worker + 50;
    let minimum = num_workers * 20 + 20;

    info!(
        "fd limits: soft={}, hard={}, required~={required}",
        limit.rlim_cur, limit.rlim_max
    );

    if (limit.rlim_cur as u64) < required {
        let wanted = required.min(limit.rlim_max as u64);
        let new_limit = libc::rlimit {
            rlim_cur: wanted as libc::rlim_t,
            rlim_max: limit.rlim_max,
        };
        // SAFETY: setrlimit with a value not above the hard limit.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &new_limit) } == 0 {
            info!("raised fd soft limit to {wanted}");
            limit.rlim_cur = wanted as libc::rlim_t;
        } else {
            warn!("could not raise fd limit to {wanted}");
        }
    }

    if (limit.rlim_cur as u64) < minimum {
        error!(
            "fd limit {} is below minimum {minimum} for {num_workers} workers",
            limit.rlim_cur
        );
        return false;
    }

    if (limit.rlim_cur as u64) < required {
        warn!(
            "fd limit {} below recommended {required}, may reject connections under load",
            limit.rlim_cur
        );
    }

    true
}
