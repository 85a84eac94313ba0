//! Fault descriptor model and frame translation.
//!
//! The hooked routine receives a pointer to a fault descriptor laid out as
//! [`VmFault`]. The interceptors never hold on to that pointer: they copy
//! what they need into a [`FaultSnapshot`] at entry and again at exit.

use core::ffi::c_void;
use core::fmt;

use axerrno::AxResult;

/// Size of one physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Round an address down to its page boundary.
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// In-progress fault, as passed to the fault handler in its first argument.
#[repr(C)]
#[derive(Debug)]
pub struct VmFault {
    /// Faulting virtual address.
    pub address: u64,
    /// `FAULT_FLAG_*` bits.
    pub flags: u32,
    /// Logical page offset within the region.
    pub pgoff: u64,
    /// Region the address falls in.
    pub vma: *const VmArea,
    /// Frame that satisfied the fault, set by the handler.
    pub page: *const Page,
}

impl VmFault {
    /// Descriptor for `address` inside `vma`, with no frame yet.
    pub fn new(address: u64, flags: FaultFlags, vma: *const VmArea) -> Self {
        Self {
            address,
            flags: flags.bits(),
            pgoff: 0,
            vma,
            page: core::ptr::null(),
        }
    }
}

/// Virtual memory region the fault falls in.
#[repr(C)]
#[derive(Debug)]
pub struct VmArea {
    pub vm_start: u64,
    pub vm_end: u64,
    pub vm_flags: u64,
    /// Backing file, null for anonymous memory.
    pub vm_file: *const c_void,
}

impl VmArea {
    /// Anonymous region `[start, end)`.
    pub fn anonymous(start: u64, end: u64, flags: VmFlags) -> Self {
        Self {
            vm_start: start,
            vm_end: end,
            vm_flags: flags.bits(),
            vm_file: core::ptr::null(),
        }
    }

    /// File-backed region `[start, end)`.
    pub fn file_backed(start: u64, end: u64, flags: VmFlags, file: *const c_void) -> Self {
        Self {
            vm_start: start,
            vm_end: end,
            vm_flags: flags.bits(),
            vm_file: file,
        }
    }
}

/// Frame descriptor, one per physical frame in the vmemmap array.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct Page {
    pub flags: u64,
    _private: [u64; 7],
}

impl Page {
    pub const fn new() -> Self {
        Self {
            flags: 0,
            _private: [0; 7],
        }
    }
}

/// Region permission and behaviour bits (`VM_*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmFlags(u64);

impl VmFlags {
    pub const READ: Self = Self(0x0000_0001);
    pub const WRITE: Self = Self(0x0000_0002);
    pub const EXEC: Self = Self(0x0000_0004);
    pub const SHARED: Self = Self(0x0000_0008);
    pub const MAYREAD: Self = Self(0x0000_0010);
    pub const MAYWRITE: Self = Self(0x0000_0020);
    pub const MAYEXEC: Self = Self(0x0000_0040);
    pub const MAYSHARE: Self = Self(0x0000_0080);
    pub const GROWSDOWN: Self = Self(0x0000_0100);
    pub const PFNMAP: Self = Self(0x0000_0400);
    pub const LOCKED: Self = Self(0x0000_2000);
    pub const IO: Self = Self(0x0000_4000);
    pub const DONTCOPY: Self = Self(0x0002_0000);
    pub const ACCOUNT: Self = Self(0x0010_0000);
    pub const HUGETLB: Self = Self(0x0040_0000);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for VmFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Renders as the permission column of `/proc/<pid>/maps`, e.g. `rw-p`.
impl fmt::Display for VmFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag: Self, c: char| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(Self::READ, 'r'),
            bit(Self::WRITE, 'w'),
            bit(Self::EXEC, 'x'),
            if self.contains(Self::MAYSHARE) { 's' } else { 'p' }
        )
    }
}

/// Fault flags (`FAULT_FLAG_*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultFlags(u32);

impl FaultFlags {
    pub const WRITE: Self = Self(1 << 0);
    pub const MKWRITE: Self = Self(1 << 1);
    pub const ALLOW_RETRY: Self = Self(1 << 2);
    pub const RETRY_NOWAIT: Self = Self(1 << 3);
    pub const KILLABLE: Self = Self(1 << 4);
    pub const TRIED: Self = Self(1 << 5);
    pub const USER: Self = Self(1 << 6);
    pub const REMOTE: Self = Self(1 << 7);
    pub const INSTRUCTION: Self = Self(1 << 8);
    pub const INTERRUPTIBLE: Self = Self(1 << 9);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Kind of access that raised the fault.
    pub fn access(&self) -> Access {
        if self.contains(Self::INSTRUCTION) {
            Access::Exec
        } else if self.contains(Self::WRITE) {
            Access::Write
        } else {
            Access::Read
        }
    }
}

impl core::ops::BitOr for FaultFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Access kind derived from [`FaultFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

impl Access {
    pub fn label(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Exec => "exec",
        }
    }
}

/// Fault handler return status (`VM_FAULT_*` bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmFaultStatus(u32);

impl VmFaultStatus {
    pub const OOM: u32 = 0x0001;
    pub const SIGBUS: u32 = 0x0002;
    pub const MAJOR: u32 = 0x0004;
    pub const HWPOISON: u32 = 0x0010;
    pub const HWPOISON_LARGE: u32 = 0x0020;
    pub const SIGSEGV: u32 = 0x0040;
    pub const NOPAGE: u32 = 0x0100;
    pub const LOCKED: u32 = 0x0200;
    pub const RETRY: u32 = 0x0400;
    pub const FALLBACK: u32 = 0x0800;
    pub const DONE_COW: u32 = 0x1000;
    pub const NEEDDSYNC: u32 = 0x2000;
    pub const COMPLETED: u32 = 0x4000;

    const ERROR: u32 = Self::OOM
        | Self::SIGBUS
        | Self::SIGSEGV
        | Self::HWPOISON
        | Self::HWPOISON_LARGE
        | Self::FALLBACK;

    /// Decode from the raw return register. Only the low 32 bits are meaningful.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw as u32)
    }

    pub const fn code(&self) -> u32 {
        self.0
    }

    pub const fn is_error(&self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub const fn is_major(&self) -> bool {
        self.0 & Self::MAJOR != 0
    }

    pub const fn is_retry(&self) -> bool {
        self.0 & Self::RETRY != 0
    }
}

/// Copy of the region fields of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub start: u64,
    pub end: u64,
    pub flags: VmFlags,
    pub backing_file_present: bool,
}

/// Copy of a fault descriptor taken at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSnapshot {
    pub virtual_address: u64,
    pub flags: FaultFlags,
    /// Address of the region object the descriptor referred to.
    pub region_ref: usize,
    pub region: RegionSnapshot,
    /// Frame reference, meaningful only after the handler returned.
    pub frame: Option<usize>,
}

impl FaultSnapshot {
    /// Read a descriptor through a raw reference.
    ///
    /// Returns `None` when the reference or its region reference is null.
    ///
    /// # Safety
    /// A non-null `descriptor` must point to a live [`VmFault`] whose non-null
    /// `vma` points to a live [`VmArea`], both valid for the duration of the call.
    pub unsafe fn read(descriptor: usize) -> Option<Self> {
        let vmf = unsafe { (descriptor as *const VmFault).as_ref() }?;
        let vma = unsafe { vmf.vma.as_ref() }?;

        Some(Self {
            virtual_address: vmf.address,
            flags: FaultFlags::from_bits(vmf.flags),
            region_ref: vmf.vma as usize,
            region: RegionSnapshot {
                start: vma.vm_start,
                end: vma.vm_end,
                flags: VmFlags::from_bits(vma.vm_flags),
                backing_file_present: !vma.vm_file.is_null(),
            },
            frame: (!vmf.page.is_null()).then_some(vmf.page as usize),
        })
    }
}

/// Result of the hooked routine, read at exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultOutcome {
    pub status: VmFaultStatus,
    pub frame: Option<usize>,
}

/// Translation from a frame reference to its frame index (`page_to_pfn`).
pub trait FrameOps: Send + Sync {
    fn frame_index(&self, frame: usize) -> AxResult<u64>;
}

/// Flat vmemmap: frame descriptors laid out contiguously, one per frame.
#[derive(Debug, Clone, Copy)]
pub struct VmemmapFrames {
    /// Address of the descriptor of `first_pfn`.
    pub base: usize,
    /// Size of one frame descriptor.
    pub stride: usize,
    /// Frame index of the first descriptor.
    pub first_pfn: u64,
    /// Number of descriptors in the array.
    pub nr_frames: u64,
}

impl VmemmapFrames {
    /// Vmemmap over an array of [`Page`] descriptors.
    pub fn new(base: usize, first_pfn: u64, nr_frames: u64) -> Self {
        Self {
            base,
            stride: core::mem::size_of::<Page>(),
            first_pfn,
            nr_frames,
        }
    }
}

impl FrameOps for VmemmapFrames {
    fn frame_index(&self, frame: usize) -> AxResult<u64> {
        let Some(offset) = frame.checked_sub(self.base) else {
            return axerrno::ax_err!(NotFound, "frame reference below vmemmap");
        };
        if self.stride == 0 || offset % self.stride != 0 {
            return axerrno::ax_err!(NotFound, "frame reference not descriptor aligned");
        }
        let idx = (offset / self.stride) as u64;
        if idx >= self.nr_frames {
            return axerrno::ax_err!(NotFound, "frame reference past vmemmap");
        }
        match self.first_pfn.checked_add(idx) {
            Some(pfn) => Ok(pfn),
            None => axerrno::ax_err!(NotFound, "frame index overflows"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    #[test]
    fn page_descriptor_is_64_bytes() {
        assert_eq!(core::mem::size_of::<Page>(), 64);
    }

    #[test]
    fn vm_flags_render_like_proc_maps() {
        let flags = VmFlags::READ | VmFlags::WRITE | VmFlags::MAYREAD | VmFlags::MAYWRITE;
        assert_eq!(flags.to_string(), "rw-p");
        let shared = VmFlags::READ | VmFlags::EXEC | VmFlags::MAYSHARE;
        assert_eq!(shared.to_string(), "r-xs");
    }

    #[test]
    fn fault_flags_access_kind() {
        assert_eq!(FaultFlags::default().access(), Access::Read);
        assert_eq!((FaultFlags::WRITE | FaultFlags::USER).access(), Access::Write);
        assert_eq!(FaultFlags::INSTRUCTION.access(), Access::Exec);
    }

    #[test]
    fn status_decoding() {
        assert!(!VmFaultStatus::from_raw(0).is_error());
        assert!(VmFaultStatus::from_raw(VmFaultStatus::OOM as u64).is_error());
        assert!(VmFaultStatus::from_raw(VmFaultStatus::MAJOR as u64).is_major());
        assert!(VmFaultStatus::from_raw(VmFaultStatus::RETRY as u64).is_retry());
        assert_eq!(VmFaultStatus::from_raw(0xffff_ffff_0000_0100).code(), 0x100);
    }

    #[test]
    fn snapshot_of_null_descriptor_is_none() {
        assert!(unsafe { FaultSnapshot::read(0) }.is_none());
    }

    #[test]
    fn snapshot_of_descriptor_without_region_is_none() {
        let vmf = VmFault::new(0x1000, FaultFlags::WRITE, core::ptr::null());
        assert!(unsafe { FaultSnapshot::read(&vmf as *const VmFault as usize) }.is_none());
    }

    #[test]
    fn snapshot_copies_region_and_frame() {
        let vma = VmArea::anonymous(0x7000_0000, 0x7000_4000, VmFlags::READ | VmFlags::WRITE);
        let page = Page::new();
        let mut vmf = VmFault::new(0x7000_1000, FaultFlags::WRITE, &vma);

        let before = unsafe { FaultSnapshot::read(&vmf as *const VmFault as usize) }.unwrap();
        assert_eq!(before.frame, None);
        assert!(!before.region.backing_file_present);
        assert_eq!(before.region.start, 0x7000_0000);

        vmf.page = &page;
        let after = unsafe { FaultSnapshot::read(&vmf as *const VmFault as usize) }.unwrap();
        assert_eq!(after.frame, Some(&page as *const Page as usize));
        assert_eq!(after.region_ref, &vma as *const VmArea as usize);
    }

    #[test]
    fn vmemmap_translation() {
        let pages: Vec<Page> = (0..4).map(|_| Page::new()).collect();
        let frames = VmemmapFrames::new(pages.as_ptr() as usize, 0x100, 4);

        let third = &pages[2] as *const Page as usize;
        assert_eq!(frames.frame_index(third).unwrap(), 0x102);
        assert!(frames.frame_index(third + 8).is_err());
        assert!(frames.frame_index(pages.as_ptr() as usize - 64).is_err());
        assert!(frames.frame_index(pages.as_ptr() as usize + 4 * 64).is_err());
    }

    #[test]
    fn vmemmap_index_past_pfn_space_is_rejected() {
        let pages: Vec<Page> = (0..4).map(|_| Page::new()).collect();
        let frames = VmemmapFrames::new(pages.as_ptr() as usize, u64::MAX - 1, 4);

        assert_eq!(frames.frame_index(&pages[1] as *const Page as usize).unwrap(), u64::MAX);
        assert!(frames.frame_index(&pages[2] as *const Page as usize).is_err());
    }
}
