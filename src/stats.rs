//! Built-in probe statistics.
//!
//! Counters are plain atomics so the interceptors can update them without
//! taking a lock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters for one probe.
#[derive(Debug)]
pub struct ProbeStats {
    /// Invocations observed while the probe was armed.
    hits: AtomicU64,
    pre: AtomicU64,
    post: AtomicU64,
    /// Invocations skipped because the descriptor or region was absent.
    skipped: AtomicU64,
    anonymous: AtomicU64,
    file_backed: AtomicU64,
    frames_allocated: AtomicU64,
    unresolved: AtomicU64,
    untranslatable: AtomicU64,
    /// Routine duration, PRE to POST.
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    total_ns: AtomicU64,
}

impl ProbeStats {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            pre: AtomicU64::new(0),
            post: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            anonymous: AtomicU64::new(0),
            file_backed: AtomicU64::new(0),
            frames_allocated: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
            untranslatable: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pre(&self, anonymous: bool) {
        self.pre.fetch_add(1, Ordering::Relaxed);
        if anonymous {
            self.anonymous.fetch_add(1, Ordering::Relaxed);
        } else {
            self.file_backed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_allocated(&self) {
        self.frames_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unresolved(&self) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_untranslatable(&self) {
        self.untranslatable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_post(&self, duration_ns: u64) {
        self.post.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(duration_ns, Ordering::Relaxed);
        self.min_ns.fetch_min(duration_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(duration_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProbeStatsSnapshot {
        let post = self.post.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let min_ns = self.min_ns.load(Ordering::Relaxed);

        ProbeStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            pre: self.pre.load(Ordering::Relaxed),
            post,
            skipped: self.skipped.load(Ordering::Relaxed),
            anonymous: self.anonymous.load(Ordering::Relaxed),
            file_backed: self.file_backed.load(Ordering::Relaxed),
            frames_allocated: self.frames_allocated.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            untranslatable: self.untranslatable.load(Ordering::Relaxed),
            min_ns: if min_ns == u64::MAX { 0 } else { min_ns },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            avg_ns: if post > 0 { total_ns / post } else { 0 },
        }
    }
}

impl Default for ProbeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStatsSnapshot {
    pub hits: u64,
    pub pre: u64,
    pub post: u64,
    pub skipped: u64,
    pub anonymous: u64,
    pub file_backed: u64,
    pub frames_allocated: u64,
    pub unresolved: u64,
    pub untranslatable: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}
