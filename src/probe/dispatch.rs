//! Dispatch state shared by the registry and whatever delivers calls to it.
//!
//! The registry arms and disarms a [`ProbeCore`]; intercept backends hold a
//! clone of it and enter through [`ProbeCore::try_enter`]. Only atomics are
//! touched on that path.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::event::TaskInfo;
use crate::regs::PtRegs;

use super::interceptor::{FaultObserver, Invocation};

/// Armed address, in-flight count and the interceptors they guard.
pub struct ProbeCore {
    observer: FaultObserver,
    /// Address the probe fires on, 0 while disarmed.
    armed_addr: AtomicUsize,
    /// Entry/exit pairs currently running.
    in_flight: AtomicUsize,
}

impl ProbeCore {
    pub(crate) fn new(observer: FaultObserver) -> Self {
        Self {
            observer,
            armed_addr: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn observer(&self) -> &FaultObserver {
        &self.observer
    }

    /// Whether calls to `addr` are currently observed.
    #[inline]
    pub fn is_armed(&self, addr: usize) -> bool {
        addr != 0 && self.armed_addr.load(Ordering::Acquire) == addr
    }

    /// Number of entry/exit pairs currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn arm(&self, addr: usize) {
        self.armed_addr.store(addr, Ordering::SeqCst);
    }

    pub(crate) fn disarm(&self) {
        self.armed_addr.store(0, Ordering::SeqCst);
    }

    /// Spin until every invocation that got in before `disarm` has left.
    pub(crate) fn wait_quiescent(&self) {
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Join the in-flight set if the probe is armed on `addr`.
    ///
    /// The count is raised before the armed address is re-checked, so a
    /// concurrent detach either sees this invocation and waits for it, or
    /// this invocation sees the probe disarmed and backs out. Every `true`
    /// must be matched by exactly one [`leave`](Self::leave).
    pub(crate) fn try_enter(&self, addr: usize) -> bool {
        if !self.is_armed(addr) {
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.armed_addr.load(Ordering::SeqCst) != addr {
            self.leave();
            return false;
        }
        true
    }

    pub(crate) fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Scoped form of [`try_enter`](Self::try_enter) for call paths where
    /// entry and exit run in the same frame.
    pub(crate) fn enter(&self, addr: usize) -> Option<InFlight<'_>> {
        self.try_enter(addr).then_some(InFlight { core: self })
    }
}

/// Membership in the in-flight set; leaving it is tied to drop.
pub(crate) struct InFlight<'a> {
    core: &'a ProbeCore,
}

impl InFlight<'_> {
    pub(crate) fn entry(&self, task: &TaskInfo, regs: &PtRegs) -> Option<Invocation> {
        self.core.observer.on_entry(task, regs)
    }

    pub(crate) fn exit(&self, invocation: &Invocation, regs: &PtRegs) {
        self.core.observer.on_exit(invocation, regs)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.core.leave();
    }
}
