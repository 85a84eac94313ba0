//! Fault handler probe.
//!
//! - `registry`: attach/detach lifecycle and quiescence
//! - `dispatch`: armed address and in-flight set shared with backends
//! - `backend`: how calls to the probed routine are delivered
//! - `interceptor`: entry/exit logic around the hooked routine
//! - `retprobe`: entry/return pairing for trap-based return probes
//! - `kretprobe`: return probes planted with the `kprobe` library
//! - `handler`: the trap path an instrumented call goes through

pub mod backend;
pub mod dispatch;
pub mod handler;
pub mod interceptor;
#[cfg(feature = "kretprobe")]
pub mod kretprobe;
pub mod registry;
pub mod retprobe;

pub use backend::{InterceptBackend, TrapPath};
pub use dispatch::ProbeCore;
pub use handler::handle_call;
pub use interceptor::{FaultObserver, Invocation};
#[cfg(feature = "kretprobe")]
pub use kretprobe::{CurrentTask, KretprobeBackend};
pub use registry::{AttachError, DetachError, ProbeHandle, ProbeInfo, ProbeRegistry, ProbeState};
pub use retprobe::ReturnProbe;
