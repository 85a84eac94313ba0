//! How calls to the probed routine reach the interceptors.
//!
//! The registry decides *whether* a call is observed; a backend decides
//! *how* calls get there. In a kernel that is a return probe planted on the
//! routine's text (see the `kretprobe` feature). Without one, call sites
//! enter through [`handle_call`](super::handle_call) and nothing needs
//! installing.

use alloc::sync::Arc;

use super::dispatch::ProbeCore;

/// Mechanism that routes calls to a probed address into a [`ProbeCore`].
pub trait InterceptBackend: Send + Sync {
    /// Start delivering calls to `addr` into `core`.
    ///
    /// Called with the registry's lifecycle lock held, before the probe is
    /// armed. Calls that arrive before arming are passed through.
    fn install(&self, core: &Arc<ProbeCore>, symbol: &str, addr: usize);

    /// Stop delivering calls to `addr`.
    ///
    /// Called only once the probe is disarmed and quiescent.
    fn remove(&self, addr: usize);

    /// Short label for logs and [`ProbeInfo`](super::ProbeInfo).
    fn label(&self) -> &'static str;
}

/// Instrumented call sites that enter through `handle_call`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapPath;

impl InterceptBackend for TrapPath {
    fn install(&self, _core: &Arc<ProbeCore>, _symbol: &str, _addr: usize) {}

    fn remove(&self, _addr: usize) {}

    fn label(&self) -> &'static str {
        "trap-path"
    }
}
