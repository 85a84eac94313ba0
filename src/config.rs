//! Probe configuration.

use alloc::string::{String, ToString};

use crate::fault::PAGE_SIZE;
use crate::regs::CallingConvention;

/// Routine observed when no other symbol is configured.
pub const DEFAULT_SYMBOL: &str = "handle_mm_fault";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No calling convention is available for this target.
    NoConvention,
    /// Frame size is zero or not a power of two.
    InvalidFrameSize(u64),
    /// Symbol name is empty.
    EmptySymbol,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoConvention => write!(f, "No calling convention for this target"),
            Self::InvalidFrameSize(size) => {
                write!(f, "Frame size must be a power of two, got {}", size)
            }
            Self::EmptySymbol => write!(f, "Symbol name is empty"),
        }
    }
}

impl core::error::Error for ConfigError {}

/// Runtime configuration of a probe registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Routine attached by [`ProbeRegistry::attach_default`](crate::ProbeRegistry::attach_default).
    pub symbol: String,
    /// Convention used to read arguments and the return value.
    pub convention: Option<CallingConvention>,
    /// Physical frame size used to derive physical addresses.
    pub frame_size: u64,
    /// Log skipped invocations as well.
    pub verbose: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            symbol: DEFAULT_SYMBOL.to_string(),
            convention: CallingConvention::host(),
            frame_size: PAGE_SIZE,
            verbose: false,
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = symbol.to_string();
        self
    }

    pub fn with_convention(mut self, convention: Option<CallingConvention>) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_frame_size(mut self, frame_size: u64) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Check that the registers and frames can be interpreted with this config.
    pub fn validate(&self) -> Result<CallingConvention, ConfigError> {
        if self.symbol.is_empty() {
            return Err(ConfigError::EmptySymbol);
        }
        if !self.frame_size.is_power_of_two() {
            return Err(ConfigError::InvalidFrameSize(self.frame_size));
        }
        self.convention.ok_or(ConfigError::NoConvention)
    }
}
