//! per-ip token bucket rate limiter.
//!
//! One limiter per worker; the effective system rate is the per-worker
//! rate multiplied by the worker count. Buckets replenish continuously
//! with sub-second precision so a bursty client cannot pick up the
//! integer-floor slack of a coarser clock.

use core::net::IpAddr;
use core::time::Duration;

use std::time::Instant;

use fnv::FnvHashMap;

use crate::acl::canonical_addr;

/// Maximum tracked IPs per worker.
pub const MAX_ENTRIES: usize = 10_000;

/// Entries idle longer than this are dropped by eviction.
pub const ENTRY_TTL: Duration = Duration::from_secs(60);

/// Interval at which the worker runs unconditional eviction.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Monotonic time source. A fixed-epoch duration rather than [Instant]
/// so tests can drive the limiter through an artificial clock.
pub trait Clock {
    fn now(&self) -> Duration;
}

pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

struct Entry {
    tokens: f64,
    last_update: f64,
    last_request: u64,
}

pub struct RateLimiter<C = MonotonicClock> {
    buckets: FnvHashMap<[u8; 16], Entry>,
    rate: f64,
    burst: f64,
    enabled: bool,
    clock: C,
}

impl RateLimiter<MonotonicClock> {
    /// `rate` is tokens per second; 0 disables the limiter entirely.
    /// `burst` defaults to `rate` when not positive.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self::with_clock(rate, burst, MonotonicClock::new())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(rate: f64, burst: f64, clock: C) -> Self {
        Self {
            buckets: FnvHashMap::default(),
            rate,
            burst: if burst > 0.0 { burst } else { rate },
            enabled: rate > 0.0,
            clock,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.buckets.len()
    }

    /// Take one token for `ip`. New entries start with a full bucket.
    /// A full table evicts stale entries once; if that frees nothing
    /// the request is denied rather than evicting a live bucket.
    pub fn allow(&mut self, ip: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }

        let now = self.clock.now();
        let now_secs = now.as_secs_f64();
        let key = canonical_addr(ip);

        if !self.buckets.contains_key(&key) {
            if self.buckets.len() >= MAX_ENTRIES {
                self.evict_stale(now);
                if self.buckets.len() >= MAX_ENTRIES {
                    return false;
                }
            }
            self.buckets.insert(
                key,
                Entry {
                    tokens: self.burst,
                    last_update: now_secs,
                    last_request: now.as_secs(),
                },
            );
        }

        let rate = self.rate;
        let burst = self.burst;
        let entry = match self.buckets.get_mut(&key) {
            Some(entry) => entry,
            None => return false,
        };

        entry.last_request = now.as_secs();

        if now_secs > entry.last_update {
            let elapsed = now_secs - entry.last_update;
            entry.tokens = (entry.tokens + elapsed * rate).min(burst);
            entry.last_update = now_secs;
        }

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop entries whose last request is older than [ENTRY_TTL].
    pub fn evict_stale(&mut self, now: Duration) {
        let expiry = now.as_secs().saturating_sub(ENTRY_TTL.as_secs());
        self.buckets.retain(|_, entry| entry.last_request >= expiry);
    }

    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.evict_stale(now);
    }
}

/// Hand-advanced clock for tests.
#[cfg(test)]
pub(crate) struct FakeClock(pub std::rc::Rc<core::cell::Cell<Duration>>);

#[cfg(test)]
impl FakeClock {
    pub fn new() -> (Self, std::rc::Rc<core::cell::Cell<Duration>>) {
        let cell = std::rc::Rc::new(core::cell::Cell::new(Duration::from_secs(1)));
        (Self(cell.clone()), cell)
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}
