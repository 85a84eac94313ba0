//! Page fault observer.
//!
//! Attaches an entry/exit probe to the kernel's fault handler
//! (`handle_mm_fault` by default) and reports, for every fault it resolves,
//! whether the faulting region is anonymous or file-backed and, for
//! anonymous faults, the physical address of the frame that was allocated.
//! The probe only observes: arguments, return values and control flow of
//! the hooked routine are never changed.
//!
//! # Features
//!
//! - `kallsyms` - Build symbol tables from `/proc/kallsyms` text (default)
//! - `symbols` - Resolve names through the kernel's kallsyms blob (`ksym`)
//! - `kretprobe` - Plant return probes with the `kprobe` library
//! - `axhal` - Take timestamps and CPU ids from the kernel HAL
//!
//! # Quick Start
//!
//! ```ignore
//! use alloc::sync::Arc;
//! use faultprobe::{
//!     KallsymsResolver, KretprobeBackend, LogSink, ProbeConfig, ProbeRegistry, VmemmapFrames,
//! };
//!
//! let symbols = KallsymsResolver::from_blob(KALLSYMS_BLOB, stext, etext)?;
//! let frames = VmemmapFrames::new(VMEMMAP_START, 0, max_pfn);
//! let backend = Arc::new(KretprobeBackend::<KernelKprobeOps>::new(current_task));
//! let registry = ProbeRegistry::new(
//!     ProbeConfig::default(),
//!     Arc::new(symbols),
//!     Arc::new(frames),
//!     Arc::new(LogSink),
//! )
//! .with_backend(backend.clone());
//!
//! let handle = registry.attach_default()?;
//! // ... faults are reported through the sink ...
//! registry.detach(&handle)?;
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Fault Model
// =============================================================================

pub mod classify;
pub mod fault;
pub mod regs;

// =============================================================================
// Probe
// =============================================================================

pub mod config;
pub mod event;
pub mod probe;
pub mod stats;
pub mod symbols;

pub use classify::{FaultKind, classify};
pub use config::{ConfigError, DEFAULT_SYMBOL, ProbeConfig};
pub use event::{
    EventPhase, EventSink, ExitRecord, ExitTag, FanoutSink, FaultEvent, LogSink, RingSink,
    TaskInfo,
};
pub use fault::{
    FaultFlags, FaultOutcome, FaultSnapshot, FrameOps, PAGE_SIZE, Page, VmArea, VmFault,
    VmFaultStatus, VmFlags, VmemmapFrames,
};
#[cfg(feature = "kretprobe")]
pub use probe::{CurrentTask, KretprobeBackend};
pub use probe::{
    AttachError, DetachError, InterceptBackend, ProbeCore, ProbeHandle, ProbeInfo, ProbeRegistry,
    ProbeState, ReturnProbe, TrapPath, handle_call,
};
pub use regs::{CallingConvention, PtRegs};
pub use stats::ProbeStatsSnapshot;
#[cfg(feature = "symbols")]
pub use symbols::KallsymsResolver;
pub use symbols::{SymbolResolver, SymbolTable};

/// Log which capabilities this build carries.
///
/// Optional; nothing in the crate depends on it having been called.
pub fn init() {
    info!("Initializing faultprobe...");
    match CallingConvention::host() {
        Some(cc) => info!("  - host calling convention: {}", cc.label()),
        None => warn!("  - no calling convention for this target, attach will fail"),
    }

    #[cfg(feature = "kallsyms")]
    info!("  - kallsyms text parser enabled");

    #[cfg(feature = "symbols")]
    info!("  - kallsyms blob resolver enabled");

    #[cfg(feature = "kretprobe")]
    info!("  - kretprobe backend enabled");

    #[cfg(feature = "axhal")]
    info!("  - axhal platform enabled");

    info!("faultprobe initialization complete");
}
