//! Return-probe backend built on the `kprobe` library.
//!
//! Attach plants a kretprobe on the resolved address: the library patches a
//! breakpoint into the routine's first instruction and hijacks its return
//! address, so every call, from any caller, traps twice without the caller
//! being rebuilt. Both traps land in [`ReturnProbe`], which runs the
//! interceptors and pairs them.
//!
//! The embedding kernel supplies the text-patching primitives through its
//! `KprobeAuxiliaryOps` implementation, and routes its breakpoint exceptions
//! to the library through [`KretprobeBackend::with_manager`].

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use crate::event::TaskInfo;
use crate::regs::PtRegs;

use super::backend::InterceptBackend;
use super::dispatch::ProbeCore;
use super::retprobe::ReturnProbe;

/// Lock type alias for the kprobe library
type LockType = spin::Mutex<()>;

/// Concurrent activations tracked per probe by the library.
const DEFAULT_MAXACTIVE: usize = 16;

/// Identity of the task running on the current CPU.
pub type CurrentTask = fn() -> TaskInfo;

/// User data attached to the kretprobe.
/// Passed to callbacks via `ProbeData`, avoiding lock-table lookups.
#[derive(Clone)]
struct FaultProbeData {
    probe: Arc<ReturnProbe>,
    current_task: CurrentTask,
}

impl fmt::Debug for FaultProbeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultProbeData")
            .field("addr", &self.probe.addr())
            .field("pending", &self.probe.pending())
            .finish()
    }
}

struct Installed<O: kprobe::KprobeAuxiliaryOps> {
    addr: usize,
    handle: Arc<kprobe::Kretprobe<LockType, O>>,
}

struct Inner<O: kprobe::KprobeAuxiliaryOps> {
    /// The kprobe library's probe manager
    manager: kprobe::ProbeManager<LockType, O>,
    /// Probe point list
    probe_points: kprobe::ProbePointList<O>,
    installed: Option<Installed<O>>,
}

/// Kretprobe-backed [`InterceptBackend`].
pub struct KretprobeBackend<O: kprobe::KprobeAuxiliaryOps> {
    current_task: CurrentTask,
    maxactive: usize,
    inner: Mutex<Inner<O>>,
}

impl<O: kprobe::KprobeAuxiliaryOps> KretprobeBackend<O> {
    pub fn new(current_task: CurrentTask) -> Self {
        Self {
            current_task,
            maxactive: DEFAULT_MAXACTIVE,
            inner: Mutex::new(Inner {
                manager: kprobe::ProbeManager::new(),
                probe_points: kprobe::ProbePointList::new(),
                installed: None,
            }),
        }
    }

    pub fn with_maxactive(mut self, maxactive: usize) -> Self {
        self.maxactive = maxactive.max(1);
        self
    }

    /// Run `f` on the library's probe manager.
    ///
    /// The kernel's breakpoint and single-step exception paths go through
    /// here to hand their trap frames to the library.
    pub fn with_manager<R>(
        &self,
        f: impl FnOnce(&mut kprobe::ProbeManager<LockType, O>) -> R,
    ) -> R {
        f(&mut self.inner.lock().manager)
    }

    /// Whether a kretprobe is currently planted.
    pub fn is_installed(&self) -> bool {
        self.inner.lock().installed.is_some()
    }
}

impl<O> InterceptBackend for KretprobeBackend<O>
where
    O: kprobe::KprobeAuxiliaryOps + Send + Sync + 'static,
{
    fn install(&self, core: &Arc<ProbeCore>, symbol: &str, addr: usize) {
        let data = FaultProbeData {
            probe: Arc::new(ReturnProbe::new(core.clone(), addr)),
            current_task: self.current_task,
        };
        let builder = kprobe::KretprobeBuilder::<LockType>::new(self.maxactive)
            .with_symbol_addr(addr)
            .with_symbol(String::from(symbol))
            .with_enable(true)
            .with_entry_handler(fault_entry_handler)
            .with_ret_handler(fault_ret_handler)
            .with_data(data);

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let handle =
            kprobe::register_kretprobe(&mut inner.manager, &mut inner.probe_points, builder);
        inner.installed = Some(Installed { addr, handle });
        info!("kretprobe: planted on {} at {:#x}", symbol, addr);
    }

    fn remove(&self, addr: usize) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match inner.installed.take() {
            Some(installed) if installed.addr == addr => {
                kprobe::unregister_kretprobe(
                    &mut inner.manager,
                    &mut inner.probe_points,
                    installed.handle,
                );
                info!("kretprobe: removed from {:#x}", addr);
            }
            other => {
                inner.installed = other;
                warn!("kretprobe: nothing planted at {:#x}", addr);
            }
        }
    }

    fn label(&self) -> &'static str {
        "kretprobe"
    }
}

/// Entry handler for kretprobe: the routine's first instruction.
fn fault_entry_handler(data: &dyn kprobe::ProbeData, pt_regs: &mut kprobe::PtRegs) {
    let Some(d) = data.as_any().downcast_ref::<FaultProbeData>() else {
        return;
    };
    d.probe.on_entry(&(d.current_task)(), &PtRegs::from(&*pt_regs));
}

/// Return handler for kretprobe: called from the library's trampoline.
fn fault_ret_handler(data: &dyn kprobe::ProbeData, pt_regs: &mut kprobe::PtRegs) {
    let Some(d) = data.as_any().downcast_ref::<FaultProbeData>() else {
        return;
    };
    d.probe.on_return(&(d.current_task)(), &PtRegs::from(&*pt_regs));
}
