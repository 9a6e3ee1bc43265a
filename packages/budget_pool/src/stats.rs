/// Counters describing the activity of a single pool instance.
///
/// Obtained via [`Pool::stats()`][crate::Pool::stats] as a point-in-time snapshot. Every pool
/// keeps its own counters; nothing is shared between pools.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub(crate) admissions: u64,
    pub(crate) reallocations: u64,
    pub(crate) evictions: u64,
    pub(crate) failed_evictions: u64,
    pub(crate) frees: u64,
    pub(crate) removals: u64,
    pub(crate) reclaimed: u64,
}

impl PoolStats {
    /// Number of items admitted, including re-admissions after a pinned discard.
    #[must_use]
    pub fn admissions(&self) -> u64 {
        self.admissions
    }

    /// Number of successful buffer replacements of admitted items.
    #[must_use]
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// Number of items that discarded themselves because the pool needed room.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Number of eviction attempts where the victim failed or refused to discard.
    #[must_use]
    pub fn failed_evictions(&self) -> u64 {
        self.failed_evictions
    }

    /// Number of admitted items freed together with their memory.
    #[must_use]
    pub fn frees(&self) -> u64 {
        self.frees
    }

    /// Number of admitted items removed from the pool while keeping their memory.
    #[must_use]
    pub fn removals(&self) -> u64 {
        self.removals
    }

    /// Number of entries reclaimed directly by the pool because their item was being dropped.
    #[must_use]
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed
    }
}
