//! Saved register state and calling-convention argument extraction.
//!
//! The interceptors never touch registers directly: they ask a
//! [`CallingConvention`] for "argument N" or "the return value", so the
//! classification logic stays platform independent.

/// Portable saved register file captured at the probe point.
///
/// General purpose registers are indexed by their DWARF register number for
/// the architecture the frame was captured on.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtRegs {
    /// General purpose registers, DWARF numbering.
    pub gpr: [u64; 32],
    /// Stack pointer.
    pub sp: u64,
    /// Program counter at the time of the trap.
    pub pc: u64,
}

impl PtRegs {
    /// An all-zero frame with the given program counter.
    pub fn at(pc: u64) -> Self {
        Self {
            pc,
            ..Default::default()
        }
    }
}

/// Calling conventions the interceptors know how to introspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// x86_64 System V: rdi, rsi, rdx, rcx, r8, r9; return in rax.
    SysV64,
    /// AArch64 AAPCS64: x0-x7; return in x0.
    Aapcs64,
    /// RISC-V LP64: a0-a7 (x10-x17); return in a0.
    RiscvLp64,
}

// DWARF register numbers.
const SYSV64_ARGS: [usize; 6] = [5, 4, 1, 2, 8, 9];
const SYSV64_RET: usize = 0;
const AAPCS64_ARGS: [usize; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
const AAPCS64_RET: usize = 0;
const RISCV_ARGS: [usize; 8] = [10, 11, 12, 13, 14, 15, 16, 17];
const RISCV_RET: usize = 10;

#[cfg(target_arch = "x86_64")]
const HOST_CONVENTION: Option<CallingConvention> = Some(CallingConvention::SysV64);
#[cfg(target_arch = "aarch64")]
const HOST_CONVENTION: Option<CallingConvention> = Some(CallingConvention::Aapcs64);
#[cfg(target_arch = "riscv64")]
const HOST_CONVENTION: Option<CallingConvention> = Some(CallingConvention::RiscvLp64);
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
const HOST_CONVENTION: Option<CallingConvention> = None;

impl CallingConvention {
    /// Convention of the architecture this crate was built for, if supported.
    pub const fn host() -> Option<Self> {
        HOST_CONVENTION
    }

    fn arg_regs(&self) -> &'static [usize] {
        match self {
            Self::SysV64 => &SYSV64_ARGS,
            Self::Aapcs64 => &AAPCS64_ARGS,
            Self::RiscvLp64 => &RISCV_ARGS,
        }
    }

    fn ret_reg(&self) -> usize {
        match self {
            Self::SysV64 => SYSV64_RET,
            Self::Aapcs64 => AAPCS64_RET,
            Self::RiscvLp64 => RISCV_RET,
        }
    }

    /// Number of arguments passed in registers.
    pub fn max_reg_args(&self) -> usize {
        self.arg_regs().len()
    }

    /// Integer argument `idx` at function entry.
    ///
    /// Returns `None` for arguments passed on the stack.
    #[inline]
    pub fn arg(&self, regs: &PtRegs, idx: usize) -> Option<u64> {
        self.arg_regs().get(idx).map(|&r| regs.gpr[r])
    }

    /// Integer return value at function exit.
    #[inline]
    pub fn retval(&self, regs: &PtRegs) -> u64 {
        regs.gpr[self.ret_reg()]
    }

    /// Place argument `idx` into a frame. Returns `false` if it does not fit in registers.
    pub fn set_arg(&self, regs: &mut PtRegs, idx: usize, value: u64) -> bool {
        match self.arg_regs().get(idx) {
            Some(&r) => {
                regs.gpr[r] = value;
                true
            }
            None => false,
        }
    }

    /// Place the return value into a frame.
    pub fn set_retval(&self, regs: &mut PtRegs, value: u64) {
        regs.gpr[self.ret_reg()] = value;
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SysV64 => "sysv64",
            Self::Aapcs64 => "aapcs64",
            Self::RiscvLp64 => "riscv-lp64",
        }
    }
}

/// Capture the trap frame handed over by the `kprobe` library.
///
/// Only the argument and return registers are copied; the rest of the
/// portable frame stays zero.
#[cfg(feature = "kretprobe")]
impl From<&kprobe::PtRegs> for PtRegs {
    #[cfg(target_arch = "x86_64")]
    fn from(regs: &kprobe::PtRegs) -> Self {
        let mut out = Self::default();
        out.gpr[0] = regs.rax as u64;
        out.gpr[1] = regs.rdx as u64;
        out.gpr[2] = regs.rcx as u64;
        out.gpr[4] = regs.rsi as u64;
        out.gpr[5] = regs.rdi as u64;
        out.gpr[8] = regs.r8 as u64;
        out.gpr[9] = regs.r9 as u64;
        out
    }

    #[cfg(target_arch = "aarch64")]
    fn from(regs: &kprobe::PtRegs) -> Self {
        let mut out = Self::default();
        for (dst, src) in out.gpr.iter_mut().zip(regs.regs.iter()) {
            *dst = *src as u64;
        }
        out
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn from(regs: &kprobe::PtRegs) -> Self {
        let _ = regs;
        Self::default()
    }
}
