//! Entry and exit interceptors for the fault handler.
//!
//! The entry side copies the fault descriptor, classifies it and emits a
//! `PRE` record. It returns an [`Invocation`], which the trap path keeps on
//! the faulting context's stack and hands back to the exit side. The exit
//! side re-reads the descriptor through the reference saved in that
//! invocation rather than through the argument register, which the routine
//! is free to clobber.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::classify::FaultKind;
use crate::event::{EventPhase, EventSink, ExitRecord, ExitTag, FaultEvent, TaskInfo};
use crate::fault::{FaultOutcome, FaultSnapshot, FrameOps, VmFaultStatus};
use crate::platform;
use crate::regs::{CallingConvention, PtRegs};
use crate::stats::ProbeStats;

/// Argument slot carrying the fault descriptor.
const DESCRIPTOR_ARG: usize = 0;

/// Per-invocation state carried from entry to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    /// Correlation token, unique per registry.
    pub token: u64,
    /// Descriptor reference read from the entry argument slot.
    pub descriptor: usize,
    pub task: TaskInfo,
    pub kind: FaultKind,
    pub entered_ns: u64,
}

/// Interceptor pair bound to a probe.
pub struct FaultObserver {
    convention: CallingConvention,
    frame_size: u64,
    frames: Arc<dyn FrameOps>,
    sink: Arc<dyn EventSink>,
    next_token: AtomicU64,
    stats: ProbeStats,
    verbose: bool,
}

impl FaultObserver {
    pub fn new(
        convention: CallingConvention,
        frame_size: u64,
        frames: Arc<dyn FrameOps>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            convention,
            frame_size,
            frames,
            sink,
            next_token: AtomicU64::new(1),
            stats: ProbeStats::new(),
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Runs before the routine body. Never modifies `regs`.
    ///
    /// Returns `None` when the descriptor or its region is absent; nothing is
    /// emitted in that case and the exit side must be skipped as well.
    pub fn on_entry(&self, task: &TaskInfo, regs: &PtRegs) -> Option<Invocation> {
        self.stats.record_hit();

        let descriptor = self
            .convention
            .arg(regs, DESCRIPTOR_ARG)
            .map_or(0, |v| v as usize);
        // SAFETY: the routine's contract makes a non-null first argument a
        // live fault descriptor for the duration of the call.
        let Some(snapshot) = (unsafe { FaultSnapshot::read(descriptor) }) else {
            self.stats.record_skip();
            if self.verbose {
                debug!(
                    "faultprobe: [PRE][pid:{}] no descriptor/region at {:#x}, skipping",
                    task.pid, descriptor
                );
            }
            return None;
        };

        let kind = FaultKind::of(&snapshot);
        let invocation = Invocation {
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            descriptor,
            task: *task,
            kind,
            entered_ns: platform::time_ns(),
        };

        self.stats.record_pre(kind.is_anonymous());
        self.sink
            .emit(&self.record(EventPhase::Pre, &invocation, &snapshot, None));
        Some(invocation)
    }

    /// Runs after the routine returned. Never modifies `regs`.
    pub fn on_exit(&self, invocation: &Invocation, regs: &PtRegs) {
        // SAFETY: the routine neither frees nor relocates the descriptor it
        // was handed, so the reference saved at entry is still live.
        let Some(snapshot) = (unsafe { FaultSnapshot::read(invocation.descriptor) }) else {
            self.stats.record_skip();
            return;
        };

        let outcome = FaultOutcome {
            status: VmFaultStatus::from_raw(self.convention.retval(regs)),
            frame: snapshot.frame,
        };
        let duration_ns = platform::time_ns().saturating_sub(invocation.entered_ns);
        let exit = self.resolve(invocation, &snapshot, &outcome, duration_ns);

        self.stats.record_post(duration_ns);
        self.sink
            .emit(&self.record(EventPhase::Post, invocation, &snapshot, Some(exit)));
    }

    fn resolve(
        &self,
        invocation: &Invocation,
        snapshot: &FaultSnapshot,
        outcome: &FaultOutcome,
        duration_ns: u64,
    ) -> ExitRecord {
        let kind = FaultKind::of(snapshot);
        let (tag, physical_address) = match (kind, outcome.frame) {
            (FaultKind::FileBacked, _) => (ExitTag::FileBacked, None),
            (FaultKind::Anonymous, None) => {
                self.stats.record_unresolved();
                (ExitTag::FaultUnresolved, None)
            }
            (FaultKind::Anonymous, Some(frame)) => match self.frames.frame_index(frame) {
                Ok(pfn) => match pfn.checked_mul(self.frame_size) {
                    Some(phys) => {
                        self.stats.record_frame_allocated();
                        (ExitTag::FrameAllocated, Some(phys))
                    }
                    None => {
                        self.stats.record_untranslatable();
                        warn!(
                            "faultprobe: token={} va={:#x} pfn {:#x} overflows physical space",
                            invocation.token, snapshot.virtual_address, pfn
                        );
                        (ExitTag::FrameUntranslatable, None)
                    }
                },
                Err(e) => {
                    self.stats.record_untranslatable();
                    warn!(
                        "faultprobe: token={} va={:#x} frame {:#x} not translatable: {:?}",
                        invocation.token, snapshot.virtual_address, frame, e
                    );
                    (ExitTag::FrameUntranslatable, None)
                }
            },
        };

        ExitRecord {
            outcome_code: outcome.status.code(),
            frame_present: outcome.frame.is_some(),
            physical_address,
            tag,
            duration_ns,
        }
    }

    fn record(
        &self,
        phase: EventPhase,
        invocation: &Invocation,
        snapshot: &FaultSnapshot,
        exit: Option<ExitRecord>,
    ) -> FaultEvent {
        FaultEvent {
            phase,
            token: invocation.token,
            timestamp_ns: platform::time_ns(),
            cpu_id: platform::cpu_id(),
            task: invocation.task,
            virtual_address: snapshot.virtual_address,
            region_start: snapshot.region.start,
            region_end: snapshot.region.end,
            region_flags: snapshot.region.flags,
            backing_file_present: snapshot.region.backing_file_present,
            kind: FaultKind::of(snapshot),
            access: snapshot.flags.access(),
            exit,
        }
    }
}
