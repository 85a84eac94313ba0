//! Entry/return dispatch for breakpoint-based return probes.
//!
//! A return probe fires twice per call, from two separate traps: once at the
//! routine's first instruction and once when it returns through the
//! trampoline. Nothing on the stack survives between the two, so the
//! [`Invocation`] built at entry is parked here, per task, until the
//! matching return pops it. Returns of one task unwind in LIFO order, which
//! keeps nested calls paired even when the task migrates between CPUs.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::event::TaskInfo;
use crate::regs::PtRegs;

use super::dispatch::ProbeCore;
use super::interceptor::Invocation;

/// What the entry trap left for the return trap.
#[derive(Debug, Clone, Copy)]
enum Pending {
    /// Joined the in-flight set; carries the invocation if one was emitted.
    Observed(Option<Invocation>),
    /// Probe was not armed at entry; the return only unwinds.
    Passed,
}

/// Return-probe state for one probed address.
pub struct ReturnProbe {
    core: Arc<ProbeCore>,
    addr: usize,
    pending: Mutex<BTreeMap<i32, Vec<Pending>>>,
}

impl ReturnProbe {
    pub fn new(core: Arc<ProbeCore>, addr: usize) -> Self {
        Self {
            core,
            addr,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Entry trap: `regs` as captured at the routine's first instruction.
    pub fn on_entry(&self, task: &TaskInfo, regs: &PtRegs) {
        let frame = if self.core.try_enter(self.addr) {
            Pending::Observed(self.core.observer().on_entry(task, regs))
        } else {
            Pending::Passed
        };
        self.pending.lock().entry(task.pid).or_default().push(frame);
    }

    /// Return trap: `regs` as left by the routine on return.
    pub fn on_return(&self, task: &TaskInfo, regs: &PtRegs) {
        let frame = {
            let mut pending = self.pending.lock();
            let frame = pending.get_mut(&task.pid).and_then(Vec::pop);
            if pending.get(&task.pid).is_some_and(Vec::is_empty) {
                pending.remove(&task.pid);
            }
            frame
        };

        match frame {
            Some(Pending::Observed(invocation)) => {
                if let Some(invocation) = invocation.as_ref() {
                    self.core.observer().on_exit(invocation, regs);
                }
                self.core.leave();
            }
            Some(Pending::Passed) => {}
            None => warn!(
                "faultprobe: return at {:#x} for pid {} without a matching entry",
                self.addr, task.pid
            ),
        }
    }

    /// Entries still waiting for their return, over all tasks.
    pub fn pending(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }
}
