//! worker-scoped singletons.
//!
//! Everything a dispatcher touches hangs off one `Rc<WorkerState>`.
//! All interior mutability is `Cell`/`RefCell`; the state never leaves
//! the worker's event loop thread.

use core::cell::{Cell, RefCell};
use core::fmt::Write as _;
use core::net::IpAddr;

use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tracing::warn;

use crate::acl::AclContext;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::pages::{PageError, StaticPages};
use crate::rate::RateLimiter;
use crate::rpc::RpcManager;
use crate::slot::TierTable;
use crate::tls::{TlsError, TlsTerminator};

#[derive(Debug)]
pub enum InitError {
    Pages(PageError),
    Tls(TlsError),
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InitError::Pages(e) => write!(f, "static pages: {e}"),
            InitError::Tls(e) => write!(f, "tls: {e}"),
        }
    }
}

impl std::error::Error for InitError {}

pub struct WorkerState {
    pub config: Config,
    pub worker_id: usize,
    pub slots: Rc<TierTable>,
    pub limiter: RefCell<RateLimiter>,
    pub acl: AclContext,
    pub metrics: MetricsRegistry,
    pub pages: StaticPages,
    pub rpc: RpcManager,
    pub tls: Option<Rc<TlsTerminator>>,

    pub started: Instant,
    pub started_wallclock: u64,

    draining: Cell<bool>,
    active_connections: Cell<u32>,
    request_counter: Cell<u32>,

    // woken on drain start and whenever the active count changes while
    // draining; accept loops and the exit waiter both listen on it.
    drain_events: Notify,
}

impl WorkerState {
    pub fn new(worker_id: usize, config: Config) -> Result<Rc<Self>, InitError> {
        let mut acl = AclContext::default();
        if let Some(path) = &config.blocklist_file {
            if acl.blocklist.load_file(path).is_err() {
                warn!("failed to load blocklist from {}", path.display());
            }
        }
        if let Some(path) = &config.allowlist_file {
            if acl.allowlist.load_file(path).is_err() {
                warn!("failed to load allowlist from {}", path.display());
            }
        }

        let pages = StaticPages::load(&config.static_dir, config.chain).map_err(InitError::Pages)?;

        let tls = if config.tls.enabled {
            Some(Rc::new(TlsTerminator::new(&config.tls).map_err(InitError::Tls)?))
        } else {
            None
        };

        let rpc = RpcManager::new(&config);

        let slots = Rc::new(TierTable::new(
            config.slots_normal_max,
            config.slots_large_max,
            config.slots_huge_max,
        ));
        let limiter = RefCell::new(RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst));

        let started_wallclock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Rc::new(Self {
            config,
            worker_id,
            slots,
            limiter,
            acl,
            metrics: MetricsRegistry::new(),
            pages,
            rpc,
            tls,
            started: Instant::now(),
            started_wallclock,
            draining: Cell::new(false),
            active_connections: Cell::new(0),
            request_counter: Cell::new(0),
            drain_events: Notify::new(),
        }))
    }

    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.get()
    }

    pub fn begin_drain(&self) {
        self.draining.set(true);
        self.drain_events.notify_waiters();
    }

    pub fn connection_opened(&self) {
        self.active_connections.set(self.active_connections.get() + 1);
    }

    pub fn connection_closed(&self) {
        let active = self.active_connections.get().saturating_sub(1);
        self.active_connections.set(active);
        if self.draining.get() {
            self.drain_events.notify_waiters();
        }
    }

    /// Resolves on the next drain-relevant event (drain start or a
    /// connection closing while draining).
    pub async fn drain_event(&self) {
        self.drain_events.notified().await;
    }

    /// Resolves once draining has begun and the last connection is
    /// gone.
    pub async fn drained(&self) {
        loop {
            if self.draining.get() && self.active_connections.get() == 0 {
                return;
            }
            self.drain_events.notified().await;
        }
    }

    /// Request ids are `worker-microseconds(hex)-counter(hex)`, unique
    /// within a worker and cheap to produce.
    pub fn next_request_id(&self) -> String {
        let counter = self.request_counter.get();
        self.request_counter.set(counter.wrapping_add(1));

        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut id = String::with_capacity(24);
        let _ = write!(id, "{}-{micros:x}-{counter:x}", self.worker_id);
        id
    }

    /// IPs only appear in logs when verbose logging is on.
    pub fn client_label(&self, ip: IpAddr) -> String {
        if self.config.verbose {
            ip.to_string()
        } else {
            String::from("client")
        }
    }

    /// Access log entry for a completed request. Only emitted in
    /// verbose mode, where full client IPs are wanted.
    #[allow(clippy::too_many_arguments)]
    pub fn log_access(
        &self,
        ip: IpAddr,
        method: &str,
        path: &str,
        status: u16,
        bytes: u64,
        duration_ms: f64,
        request_id: &str,
    ) {
        if !self.config.verbose {
            return;
        }
        tracing::info!(
            target: "access",
            client = %ip,
            method,
            path,
            status,
            bytes,
            duration_ms,
            request_id,
        );
    }
}
