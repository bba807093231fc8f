//! three tier admission slots.
//!
//! Each worker owns one [TierTable]. A live connection or http/2 stream
//! holds exactly one slot through a [SlotGuard]; dropping the guard
//! releases the slot. Promotion moves a held slot to a more expensive
//! tier without ever releasing both sides at once.

use core::cell::Cell;

use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Normal,
    Large,
    Huge,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Normal, Tier::Large, Tier::Huge];

    /// Tier implied by the amount of data buffered so far.
    pub fn for_size(size: usize, large_threshold: usize, huge_threshold: usize) -> Tier {
        if size >= huge_threshold {
            Tier::Huge
        } else if size >= large_threshold {
            Tier::Large
        } else {
            Tier::Normal
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Tier::Normal => "normal",
            Tier::Large => "large",
            Tier::Huge => "huge",
        }
    }

    const fn idx(self) -> usize {
        self as usize
    }
}

pub struct TierTable {
    used: [Cell<u32>; 3],
    cap: [u32; 3],
}

impl TierTable {
    pub fn new(normal_max: u32, large_max: u32, huge_max: u32) -> Self {
        Self {
            used: [Cell::new(0), Cell::new(0), Cell::new(0)],
            cap: [normal_max, large_max, huge_max],
        }
    }

    /// Increment `used[tier]` iff it is below capacity.
    pub fn acquire(&self, tier: Tier) -> bool {
        let used = &self.used[tier.idx()];
        if used.get() >= self.cap[tier.idx()] {
            return false;
        }
        used.set(used.get() + 1);
        true
    }

    pub fn release(&self, tier: Tier) {
        let used = &self.used[tier.idx()];
        if used.get() > 0 {
            used.set(used.get() - 1);
        }
    }

    /// Acquire the target tier first, release the source only on
    /// success. Returns false with the table unchanged when the target
    /// is full. Demotion is not expressed through promote.
    pub fn promote(&self, from: Tier, to: Tier) -> bool {
        if from == to {
            return true;
        }
        if to < from {
            return false;
        }
        if !self.acquire(to) {
            return false;
        }
        self.release(from);
        true
    }

    pub fn used(&self, tier: Tier) -> u32 {
        self.used[tier.idx()].get()
    }

    pub fn capacity(&self, tier: Tier) -> u32 {
        self.cap[tier.idx()]
    }

    pub fn total(&self) -> u32 {
        self.used.iter().map(Cell::get).sum()
    }
}

/// A held admission slot. The guard tracks which tier is currently
/// charged and gives it back on drop.
pub struct SlotGuard {
    table: Rc<TierTable>,
    tier: Cell<Tier>,
    held: Cell<bool>,
}

impl SlotGuard {
    pub fn acquire(table: &Rc<TierTable>, tier: Tier) -> Option<SlotGuard> {
        table.acquire(tier).then(|| SlotGuard {
            table: Rc::clone(table),
            tier: Cell::new(tier),
            held: Cell::new(true),
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier.get()
    }

    pub fn is_held(&self) -> bool {
        self.held.get()
    }

    /// Upgrade to `required` if the current tier is below it. Holding a
    /// higher tier already counts as success.
    pub fn promote_for(&self, required: Tier) -> bool {
        if !self.held.get() {
            return false;
        }
        if self.tier.get() >= required {
            return true;
        }
        if self.table.promote(self.tier.get(), required) {
            self.tier.set(required);
            return true;
        }
        false
    }

    /// Give back a large/huge slot once ingest is done so the next big
    /// request can be admitted while this response is still in flight.
    /// Keeps the expensive slot when normal is full; clears the guard
    /// entirely only when re-acquiring the old tier also fails, in
    /// which case the caller must close.
    pub fn demote_to_normal(&self) {
        if !self.held.get() || self.tier.get() == Tier::Normal {
            return;
        }
        let old = self.tier.get();
        self.table.release(old);
        if self.table.acquire(Tier::Normal) {
            self.tier.set(Tier::Normal);
        } else if !self.table.acquire(old) {
            self.held.set(false);
        }
    }

    /// Keep-alive reset: the next request starts in the normal tier.
    /// Returns false when no normal slot could be obtained; the
    /// connection has to close then.
    pub fn reacquire_normal(&self) -> bool {
        if !self.held.get() {
            return false;
        }
        if self.tier.get() == Tier::Normal {
            return true;
        }
        self.table.release(self.tier.get());
        self.tier.set(Tier::Normal);
        if self.table.acquire(Tier::Normal) {
            true
        } else {
            self.held.set(false);
            false
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.held.get() {
            self.table.release(self.tier.get());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(n: u32, l: u32, h: u32) -> Rc<TierTable> {
        Rc::new(TierTable::new(n, l, h))
    }

    #[test]
    fn acquire_respects_capacity() {
        let t = table(2, 1, 0);
        assert!(t.acquire(Tier::Normal));
        assert!(t.acquire(Tier::Normal));
        assert!(!t.acquire(Tier::Normal));
        assert!(t.acquire(Tier::Large));
        assert!(!t.acquire(Tier::Large));
        assert!(!t.acquire(Tier::Huge));
        assert_eq!(t.total(), 3);
        for tier in Tier::ALL {
            assert!(t.used(tier) <= t.capacity(tier));
        }
    }

    #[test]
    fn release_never_underflows() {
        let t = table(1, 1, 1);
        t.release(Tier::Normal);
        assert_eq!(t.used(Tier::Normal), 0);
    }

    #[test]
    fn promote_is_atomic_on_failure() {
        let t = table(1, 0, 0);
        assert!(t.acquire(Tier::Normal));
        assert!(!t.promote(Tier::Normal, Tier::Large));
        assert_eq!(t.used(Tier::Normal), 1);
        assert_eq!(t.used(Tier::Large), 0);
    }

    #[test]
    fn promote_moves_the_slot() {
        let t = table(1, 1, 1);
        assert!(t.acquire(Tier::Normal));
        assert!(t.promote(Tier::Normal, Tier::Huge));
        assert_eq!(t.used(Tier::Normal), 0);
        assert_eq!(t.used(Tier::Huge), 1);
        assert!(!t.promote(Tier::Huge, Tier::Normal), "demotion is not promote");
    }

    #[test]
    fn size_to_tier_thresholds() {
        let (large, huge) = (64 * 1024, 1024 * 1024);
        assert_eq!(Tier::for_size(0, large, huge), Tier::Normal);
        assert_eq!(Tier::for_size(large - 1, large, huge), Tier::Normal);
        assert_eq!(Tier::for_size(large, large, huge), Tier::Large);
        assert_eq!(Tier::for_size(huge - 1, large, huge), Tier::Large);
        assert_eq!(Tier::for_size(huge, large, huge), Tier::Huge);
    }

    #[test]
    fn guard_releases_on_drop() {
        let t = table(1, 1, 1);
        {
            let guard = SlotGuard::acquire(&t, Tier::Normal).unwrap();
            assert_eq!(guard.tier(), Tier::Normal);
            assert_eq!(t.used(Tier::Normal), 1);
        }
        assert_eq!(t.used(Tier::Normal), 0);
    }

    #[test]
    fn guard_promotion_failure_keeps_state() {
        let t = table(1, 1, 0);
        let guard = SlotGuard::acquire(&t, Tier::Normal).unwrap();
        assert!(guard.promote_for(Tier::Large));
        assert_eq!(guard.tier(), Tier::Large);
        assert!(!guard.promote_for(Tier::Huge));
        assert_eq!(guard.tier(), Tier::Large);
        assert_eq!(t.used(Tier::Large), 1);
        assert_eq!(t.used(Tier::Huge), 0);
    }

    #[test]
    fn demote_frees_expensive_slot() {
        let t = table(1, 1, 0);
        let guard = SlotGuard::acquire(&t, Tier::Normal).unwrap();
        assert!(guard.promote_for(Tier::Large));
        guard.demote_to_normal();
        assert_eq!(guard.tier(), Tier::Normal);
        assert_eq!(t.used(Tier::Normal), 1);
        assert_eq!(t.used(Tier::Large), 0);
    }

    #[test]
    fn demote_keeps_old_tier_when_normal_full() {
        let t = table(1, 1, 0);
        let blocker = SlotGuard::acquire(&t, Tier::Normal).unwrap();
        let guard = SlotGuard::acquire(&t, Tier::Large).unwrap();
        guard.demote_to_normal();
        assert_eq!(guard.tier(), Tier::Large);
        assert!(guard.is_held());
        drop(blocker);
    }

    #[test]
    fn keepalive_reacquire() {
        let t = table(1, 1, 0);
        let guard = SlotGuard::acquire(&t, Tier::Normal).unwrap();
        assert!(guard.promote_for(Tier::Large));
        assert!(guard.reacquire_normal());
        assert_eq!(guard.tier(), Tier::Normal);

        // normal capacity stolen by another holder: reset must fail and
        // leave the guard empty.
        assert!(guard.promote_for(Tier::Large));
        let blocker = SlotGuard::acquire(&t, Tier::Normal).unwrap();
        assert!(!guard.reacquire_normal());
        assert!(!guard.is_held());
        drop(blocker);
        drop(guard);
        assert_eq!(t.total(), 0);
    }

    #[test]
    fn guard_count_matches_table_sum() {
        let t = table(4, 2, 1);
        let guards: Vec<_> = (0..4)
            .map(|_| SlotGuard::acquire(&t, Tier::Normal).unwrap())
            .collect();
        assert!(guards[0].promote_for(Tier::Large));
        assert!(guards[1].promote_for(Tier::Huge));
        assert_eq!(t.total(), guards.len() as u32);
        drop(guards);
        assert_eq!(t.total(), 0);
    }
}
