//! Fault event records and the sinks they are emitted to.
//!
//! Both interceptors describe what they saw as a [`FaultEvent`] and hand it
//! to an [`EventSink`]. Sinks run inline on the faulting context, so they
//! must return promptly and must never block.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::classify::FaultKind;
use crate::fault::{Access, VmFlags};

/// Length of a task command name, including the terminating NUL.
pub const TASK_COMM_LEN: usize = 16;

const DEFAULT_RING_CAPACITY: usize = 4096;

/// Attempts a [`RingSink`] makes at its lock before dropping a record.
const EMIT_SPIN_BUDGET: usize = 1024;

/// Identity of the task that raised the fault.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: i32,
    comm: [u8; TASK_COMM_LEN],
}

impl TaskInfo {
    /// Task `pid` named `name`; the name is truncated like the kernel's `comm`.
    pub fn new(pid: i32, name: &str) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        let len = name.len().min(TASK_COMM_LEN - 1);
        comm[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { pid, comm }
    }

    /// Command name up to the first NUL.
    pub fn comm_str(&self) -> &str {
        let end = self.comm.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
        // Truncation may have split a multi-byte character.
        match core::str::from_utf8(&self.comm[..end]) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&self.comm[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl fmt::Debug for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInfo")
            .field("pid", &self.pid)
            .field("comm", &self.comm_str())
            .finish()
    }
}

/// Which side of the hooked routine produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Pre,
    Post,
}

impl EventPhase {
    pub fn label(&self) -> &'static str {
        match self {
            EventPhase::Pre => "PRE",
            EventPhase::Post => "POST",
        }
    }
}

/// How the exit side resolved the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTag {
    /// Anonymous fault satisfied by a frame; the physical address is known.
    FrameAllocated,
    /// Anonymous fault that returned without a frame reference.
    FaultUnresolved,
    /// Region maps a file.
    FileBacked,
    /// Anonymous fault whose frame reference could not be translated.
    FrameUntranslatable,
}

impl ExitTag {
    pub fn label(&self) -> &'static str {
        match self {
            ExitTag::FrameAllocated => "frame allocated",
            ExitTag::FaultUnresolved => "fault unresolved",
            ExitTag::FileBacked => "file-backed",
            ExitTag::FrameUntranslatable => "frame untranslatable",
        }
    }
}

/// Fields only present on `POST` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// Raw `VM_FAULT_*` status returned by the routine.
    pub outcome_code: u32,
    pub frame_present: bool,
    /// Set only for anonymous faults with a translatable frame.
    pub physical_address: Option<u64>,
    pub tag: ExitTag,
    /// Time spent inside the hooked routine.
    pub duration_ns: u64,
}

/// One `PRE` or `POST` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub phase: EventPhase,
    /// Correlation token shared by the `PRE` and `POST` of one invocation.
    pub token: u64,
    pub timestamp_ns: u64,
    pub cpu_id: u32,
    pub task: TaskInfo,
    pub virtual_address: u64,
    pub region_start: u64,
    pub region_end: u64,
    pub region_flags: VmFlags,
    pub backing_file_present: bool,
    pub kind: FaultKind,
    pub access: Access,
    /// `None` on `PRE` records.
    pub exit: Option<ExitRecord>,
}

impl FaultEvent {
    pub fn is_pre(&self) -> bool {
        self.phase == EventPhase::Pre
    }

    pub fn is_post(&self) -> bool {
        self.phase == EventPhase::Post
    }

    /// Physical address of a `POST` record for an allocated frame.
    pub fn physical_address(&self) -> Option<u64> {
        self.exit.and_then(|e| e.physical_address)
    }

    pub fn frame_present(&self) -> Option<bool> {
        self.exit.map(|e| e.frame_present)
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][pid:{} comm:{}] token={} va={:#x} vma={:#x}-{:#x} flags={:#x}({}) file={}",
            self.phase.label(),
            self.task.pid,
            self.task.comm_str(),
            self.token,
            self.virtual_address,
            self.region_start,
            self.region_end,
            self.region_flags.bits(),
            self.region_flags,
            if self.backing_file_present { "NON-NULL" } else { "NULL" },
        )?;

        match self.exit {
            None => {
                write!(f, " access={}", self.access.label())?;
                if self.kind.is_anonymous() {
                    write!(f, " anonymous access, fault expected")?;
                }
                Ok(())
            }
            Some(exit) => {
                write!(
                    f,
                    " ret={} ({:#x}) page={}",
                    exit.outcome_code,
                    exit.outcome_code,
                    if exit.frame_present { "NOT NULL" } else { "NULL" },
                )?;
                if let Some(phys) = exit.physical_address {
                    write!(f, " phys={:#x}", phys)?;
                }
                write!(f, " {} in {}ns", exit.tag.label(), exit.duration_ns)
            }
        }
    }
}

/// Structured logger capability the interceptors emit through.
///
/// Implementations run on the faulting context and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &FaultEvent);
}

/// Renders every record as one `log` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &FaultEvent) {
        info!("faultprobe: {}", event);
    }
}

/// Bounded in-memory record queue.
///
/// When full, the oldest record is overwritten. When the queue lock cannot be
/// taken within a fixed number of attempts the record is dropped and counted.
pub struct RingSink {
    queue: Mutex<VecDeque<FaultEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    overwritten: AtomicU64,
}

impl RingSink {
    /// Queue holding up to `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read and consume records, oldest first. `max_events == 0` means no limit.
    pub fn consume(&self, max_events: usize) -> Vec<FaultEvent> {
        let mut q = self.queue.lock();
        let limit = if max_events == 0 { q.len() } else { max_events.min(q.len()) };
        q.drain(..limit).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records lost to lock contention.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records pushed out by newer ones.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl Default for RingSink {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl EventSink for RingSink {
    fn emit(&self, event: &FaultEvent) {
        for _ in 0..EMIT_SPIN_BUDGET {
            if let Some(mut q) = self.queue.try_lock() {
                if q.len() >= self.capacity {
                    let _ = q.pop_front();
                    self.overwritten.fetch_add(1, Ordering::Relaxed);
                }
                q.push_back(*event);
                return;
            }
            core::hint::spin_loop();
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards every record to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &FaultEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
