//! Platform abstraction layer for kernel operations.
//!
//! Event records are stamped with a monotonic timestamp and the CPU the
//! probe fired on. This module abstracts over where those come from so the
//! probe path can be exercised in user space.

use core::sync::atomic::{AtomicU64, Ordering};

/// Platform operations trait.
///
/// Abstracts over kernel-specific operations to enable mock testing.
pub trait PlatformOps {
    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Get current CPU ID.
    fn cpu_id() -> u32;
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Platform operations backed by the kernel HAL.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    fn cpu_id() -> u32 {
        axhal::percpu::this_cpu_id() as u32
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

/// Mock time value for testing.
static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000); // 1 second

/// Mock CPU ID for testing.
static MOCK_CPU_ID: AtomicU64 = AtomicU64::new(0);

/// Mock platform operations backed by atomic counters.
///
/// Time only moves when a test moves it.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn cpu_id() -> u32 {
        MOCK_CPU_ID.load(Ordering::Relaxed) as u32
    }
}

/// Set mock time for testing.
pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

/// Advance mock time by given nanoseconds.
pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

/// Set mock CPU ID for testing.
pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id as u64, Ordering::Relaxed);
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The active platform implementation.
///
/// In a kernel build with axhal: RealPlatform.
/// In tests or without axhal: MockPlatform.
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

/// Get current CPU ID.
#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}
