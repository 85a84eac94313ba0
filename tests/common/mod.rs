//! Simulated memory manager used to drive the probe from user space.
//!
//! `AddressSpace::touch` plays the role of a workload's first access to a
//! page: if the page is not mapped yet it raises a fault, which runs a
//! stand-in fault handler. The stand-in allocates the next free frame from
//! `PhysMem`, records the mapping, stores the frame in the descriptor and,
//! like a real callee, clobbers its argument register before returning.
//!
//! The fault is delivered one of two ways. By default the call goes through
//! the trap path. A harness built with `breakpoint_harness` instead calls
//! the stand-in plainly through `Breakpoints`, which plays the CPU executing
//! text a return probe has been planted in.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use faultprobe::{
    CallingConvention, EventSink, FaultEvent, FaultFlags, InterceptBackend, Page, ProbeConfig,
    ProbeCore, ProbeRegistry, PtRegs, ReturnProbe, SymbolTable, TaskInfo, VmArea, VmFault,
    VmFaultStatus, VmFlags, VmemmapFrames, handle_call,
};

pub const FAULT_ADDR: u64 = 0xffff_ffff_812a_4b10;
pub const FIRST_PFN: u64 = 0x1_0000;
pub const PAGE: u64 = 4096;

/// Event sink that keeps every record, in emission order.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FaultEvent>>,
}

impl CaptureSink {
    pub fn snapshot(&self) -> Vec<FaultEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: &FaultEvent) {
        self.events.lock().unwrap().push(*event);
    }
}

/// Physical frames backed by a vmemmap array of frame descriptors.
pub struct PhysMem {
    pages: Box<[Page]>,
    next_free: AtomicUsize,
}

impl PhysMem {
    pub fn new(nr_frames: usize) -> Self {
        Self {
            pages: (0..nr_frames).map(|_| Page::new()).collect(),
            next_free: AtomicUsize::new(0),
        }
    }

    pub fn frames(&self) -> VmemmapFrames {
        VmemmapFrames::new(self.pages.as_ptr() as usize, FIRST_PFN, self.pages.len() as u64)
    }

    /// Allocate a frame, returning its descriptor and frame index.
    pub fn alloc(&self) -> Option<(*const Page, u64)> {
        let idx = self.next_free.fetch_add(1, Ordering::Relaxed);
        let page = self.pages.get(idx)?;
        Some((page as *const Page, FIRST_PFN + idx as u64))
    }
}

/// Breakpoints planted in the simulated kernel text.
///
/// A call to an address with a planted return probe traps on entry and
/// again on return, whoever the caller is.
#[derive(Default)]
pub struct Breakpoints {
    planted: Mutex<BTreeMap<usize, Arc<ReturnProbe>>>,
}

impl Breakpoints {
    pub fn is_planted(&self, addr: usize) -> bool {
        self.planted.lock().unwrap().contains_key(&addr)
    }

    /// Execute a plain call to `addr`.
    pub fn call<F>(&self, addr: usize, task: &TaskInfo, regs: &mut PtRegs, body: F)
    where
        F: FnOnce(&mut PtRegs),
    {
        let probe = self.planted.lock().unwrap().get(&addr).cloned();
        if let Some(probe) = &probe {
            probe.on_entry(task, regs);
        }
        body(regs);
        if let Some(probe) = &probe {
            probe.on_return(task, regs);
        }
    }
}

impl InterceptBackend for Breakpoints {
    fn install(&self, core: &Arc<ProbeCore>, _symbol: &str, addr: usize) {
        let probe = Arc::new(ReturnProbe::new(core.clone(), addr));
        self.planted.lock().unwrap().insert(addr, probe);
    }

    fn remove(&self, addr: usize) {
        self.planted.lock().unwrap().remove(&addr);
    }

    fn label(&self) -> &'static str {
        "breakpoint"
    }
}

pub struct Harness {
    pub registry: ProbeRegistry,
    pub sink: Arc<CaptureSink>,
    pub mem: Arc<PhysMem>,
    pub convention: CallingConvention,
    pub cpu: Option<Arc<Breakpoints>>,
}

fn build(
    convention: CallingConvention,
    nr_frames: usize,
    cpu: Option<Arc<Breakpoints>>,
) -> Harness {
    let mut symbols = SymbolTable::new();
    symbols.insert("handle_mm_fault", FAULT_ADDR, 'T');
    symbols.insert("do_anonymous_page", FAULT_ADDR + 0x2000, 't');

    let mem = Arc::new(PhysMem::new(nr_frames));
    let sink = Arc::new(CaptureSink::default());
    let config = ProbeConfig::new().with_convention(Some(convention));
    let mut registry = ProbeRegistry::new(
        config,
        Arc::new(symbols),
        Arc::new(mem.frames()),
        sink.clone(),
    );
    if let Some(cpu) = &cpu {
        registry = registry.with_backend(cpu.clone());
    }

    Harness {
        registry,
        sink,
        mem,
        convention,
        cpu,
    }
}

pub fn harness_with(convention: CallingConvention, nr_frames: usize) -> Harness {
    build(convention, nr_frames, None)
}

pub fn harness() -> Harness {
    harness_with(CallingConvention::SysV64, 64)
}

/// Harness whose probe is planted as a return probe rather than entered
/// through the trap path.
pub fn breakpoint_harness(convention: CallingConvention, nr_frames: usize) -> Harness {
    build(convention, nr_frames, Some(Arc::new(Breakpoints::default())))
}

/// How the stand-in fault handler treats a fault.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// Allocate a fresh frame and map it.
    Allocate,
    /// Return success without a frame reference.
    NoFrame,
}

/// One process's view of a single mapped region.
pub struct AddressSpace {
    pub task: TaskInfo,
    vma: Box<VmArea>,
    page_table: Mutex<BTreeMap<u64, u64>>,
    mode: HandlerMode,
}

impl AddressSpace {
    pub fn anonymous(task: TaskInfo, start: u64, len: u64) -> Self {
        let flags = VmFlags::READ | VmFlags::WRITE | VmFlags::MAYREAD | VmFlags::MAYWRITE;
        Self {
            task,
            vma: Box::new(VmArea::anonymous(start, start + len, flags)),
            page_table: Mutex::new(BTreeMap::new()),
            mode: HandlerMode::Allocate,
        }
    }

    pub fn file_backed(task: TaskInfo, start: u64, len: u64) -> Self {
        let file = 0x5a5a_0000usize as *const std::ffi::c_void;
        Self {
            task,
            vma: Box::new(VmArea::file_backed(start, start + len, VmFlags::READ, file)),
            page_table: Mutex::new(BTreeMap::new()),
            mode: HandlerMode::Allocate,
        }
    }

    pub fn with_mode(mut self, mode: HandlerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn start(&self) -> u64 {
        self.vma.vm_start
    }

    /// Frame index currently backing `addr`.
    pub fn frame_of(&self, addr: u64) -> Option<u64> {
        self.page_table.lock().unwrap().get(&(addr / PAGE)).copied()
    }

    /// Write access to `addr`. Returns the fault status if the access faulted.
    pub fn touch(&self, h: &Harness, addr: u64) -> Option<VmFaultStatus> {
        if self.frame_of(addr).is_some() {
            return None;
        }

        let flags = FaultFlags::WRITE | FaultFlags::USER;
        let mut vmf = VmFault::new(addr & !(PAGE - 1), flags, &*self.vma);
        let vmf_ptr: *mut VmFault = &mut vmf;
        Some(self.raise(h, vmf_ptr as u64, vmf_ptr))
    }

    /// Enter the fault handler with an arbitrary first argument.
    pub fn raise(&self, h: &Harness, arg0: u64, vmf_ptr: *mut VmFault) -> VmFaultStatus {
        let cc = h.convention;
        let mut regs = PtRegs::at(FAULT_ADDR);
        cc.set_arg(&mut regs, 0, arg0);

        let body = |regs: &mut PtRegs| self.fault_handler(h, cc, regs, vmf_ptr);
        match &h.cpu {
            Some(cpu) => {
                cpu.call(FAULT_ADDR as usize, &self.task, &mut regs, body);
                VmFaultStatus::from_raw(cc.retval(&regs))
            }
            None => handle_call(&h.registry, FAULT_ADDR as usize, &self.task, &mut regs, body),
        }
    }

    fn fault_handler(
        &self,
        h: &Harness,
        cc: CallingConvention,
        regs: &mut PtRegs,
        vmf_ptr: *mut VmFault,
    ) {
        let status = match unsafe { vmf_ptr.as_mut() } {
            None => VmFaultStatus::SIGSEGV,
            Some(vmf) => match self.mode {
                HandlerMode::NoFrame => 0,
                HandlerMode::Allocate => match h.mem.alloc() {
                    Some((page, pfn)) => {
                        vmf.page = page;
                        self.page_table.lock().unwrap().insert(vmf.address / PAGE, pfn);
                        0
                    }
                    None => VmFaultStatus::OOM,
                },
            },
        };

        cc.set_arg(regs, 0, 0xdead_beef);
        cc.set_retval(regs, status as u64);
    }
}

/// Records grouped by correlation token, in first-seen order.
pub fn pairs(events: &[FaultEvent]) -> Vec<(FaultEvent, FaultEvent)> {
    let mut open: BTreeMap<u64, FaultEvent> = BTreeMap::new();
    let mut out = Vec::new();
    for ev in events {
        if ev.is_pre() {
            assert!(open.insert(ev.token, *ev).is_none(), "duplicate PRE for token {}", ev.token);
        } else {
            let pre = open.remove(&ev.token).expect("POST without PRE");
            out.push((pre, *ev));
        }
    }
    assert!(open.is_empty(), "PRE without POST: {:?}", open.keys().collect::<Vec<_>>());
    out
}
