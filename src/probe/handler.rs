//! Trap path for calls into the probed routine.
//!
//! This is the delivery used by the [`TrapPath`](super::TrapPath) backend,
//! where nothing patches the routine's text: an instrumented call site
//! enters through [`handle_call`], the registry is consulted for the call
//! target, the interceptors run around the routine body, and the body
//! itself always runs exactly once with the registers it was given.

use crate::event::TaskInfo;
use crate::fault::VmFaultStatus;
use crate::regs::PtRegs;

use super::registry::ProbeRegistry;

/// Run `routine` as the body of a call to `addr`, with interception if armed.
///
/// `routine` receives the register frame, performs the call's work and
/// leaves its return value in the frame. Returns that value decoded as a
/// fault status.
pub fn handle_call<F>(
    registry: &ProbeRegistry,
    addr: usize,
    task: &TaskInfo,
    regs: &mut PtRegs,
    routine: F,
) -> VmFaultStatus
where
    F: FnOnce(&mut PtRegs),
{
    let convention = registry.config().convention;

    let Some(in_flight) = registry.core().enter(addr) else {
        routine(regs);
        return convention.map_or(VmFaultStatus::default(), |cc| {
            VmFaultStatus::from_raw(cc.retval(regs))
        });
    };

    log::trace!("faultprobe: hit at {:#x} pid={}", addr, task.pid);

    let invocation = in_flight.entry(task, regs);
    routine(regs);
    if let Some(invocation) = invocation.as_ref() {
        in_flight.exit(invocation, regs);
    }
    drop(in_flight);

    convention.map_or(VmFaultStatus::default(), |cc| {
        VmFaultStatus::from_raw(cc.retval(regs))
    })
}
