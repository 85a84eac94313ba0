//! Probe registry: attach/detach lifecycle of the fault handler probe.
//!
//! The registry owns exactly one probe descriptor. Lifecycle changes go
//! through a lock; the trap path only touches the atomics in
//! [`ProbeCore`], so firing the probe never takes that lock. The
//! [`InterceptBackend`] chosen at construction is what makes calls to the
//! resolved address reach that core.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::ProbeConfig;
use crate::event::EventSink;
use crate::fault::FrameOps;
use crate::regs::CallingConvention;
use crate::stats::ProbeStatsSnapshot;
use crate::symbols::SymbolResolver;

use super::backend::{InterceptBackend, TrapPath};
use super::dispatch::ProbeCore;
use super::interceptor::FaultObserver;

/// Errors returned by [`ProbeRegistry::attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// The symbol does not resolve to a probeable address.
    SymbolNotFound(String),
    /// A probe is already registered; detach it first.
    AlreadyRegistered(String),
    /// Arguments and return values cannot be read safely on this platform.
    UnsupportedConvention,
}

impl core::fmt::Display for AttachError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SymbolNotFound(name) => write!(f, "Symbol not found: {}", name),
            Self::AlreadyRegistered(name) => write!(f, "Probe already registered on {}", name),
            Self::UnsupportedConvention => {
                write!(f, "Calling convention cannot be introspected")
            }
        }
    }
}

impl core::error::Error for AttachError {}

/// Errors returned by [`ProbeRegistry::detach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachError {
    /// The handle does not name the currently registered probe.
    NotRegistered,
}

impl core::fmt::Display for DetachError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotRegistered => write!(f, "Probe is not registered"),
        }
    }
}

impl core::error::Error for DetachError {}

/// Registration state of the probe descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Unregistered,
    Registered,
    /// Disarmed; waiting for in-flight invocations before removal.
    Detaching,
}

/// Token returned by a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHandle {
    id: u64,
    symbol: String,
    addr: usize,
}

impl ProbeHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn addr(&self) -> usize {
        self.addr
    }
}

/// The attached interception point.
struct ProbeDescriptor {
    symbol_name: String,
    addr: usize,
    id: u64,
    state: ProbeState,
    convention: CallingConvention,
}

/// Read-only view of the registered probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub symbol: String,
    pub addr: usize,
    pub state: ProbeState,
    pub convention: CallingConvention,
    pub backend: &'static str,
}

/// Owner of the fault handler probe.
pub struct ProbeRegistry {
    config: ProbeConfig,
    symbols: Arc<dyn SymbolResolver>,
    backend: Arc<dyn InterceptBackend>,
    core: Arc<ProbeCore>,
    /// Lifecycle lock; never taken on the trap path.
    descriptor: Mutex<Option<ProbeDescriptor>>,
    next_id: AtomicU64,
}

impl ProbeRegistry {
    /// Create an unregistered probe delivered through [`TrapPath`].
    ///
    /// The convention recorded in `config` is only checked at attach time.
    pub fn new(
        config: ProbeConfig,
        symbols: Arc<dyn SymbolResolver>,
        frames: Arc<dyn FrameOps>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let convention = config.convention.unwrap_or(CallingConvention::SysV64);
        let observer = FaultObserver::new(convention, config.frame_size, frames, sink)
            .with_verbose(config.verbose);

        Self {
            config,
            symbols,
            backend: Arc::new(TrapPath),
            core: Arc::new(ProbeCore::new(observer)),
            descriptor: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deliver calls through `backend` instead of the trap path.
    ///
    /// Only takes effect while nothing is attached.
    pub fn with_backend(mut self, backend: Arc<dyn InterceptBackend>) -> Self {
        if self.descriptor.get_mut().is_some() {
            warn!("faultprobe: backend change ignored while a probe is attached");
            return self;
        }
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Attach to the configured symbol.
    pub fn attach_default(&self) -> Result<ProbeHandle, AttachError> {
        let symbol = self.config.symbol.clone();
        self.attach(&symbol)
    }

    /// Resolve `symbol_name`, install the backend on it and arm the probe.
    ///
    /// Nothing is observable until every check has passed.
    pub fn attach(&self, symbol_name: &str) -> Result<ProbeHandle, AttachError> {
        let mut descriptor = self.descriptor.lock();

        if let Some(existing) = descriptor.as_ref() {
            return Err(AttachError::AlreadyRegistered(existing.symbol_name.clone()));
        }

        let addr = self
            .symbols
            .lookup_addr(symbol_name)
            .filter(|&a| a != 0)
            .ok_or_else(|| AttachError::SymbolNotFound(symbol_name.to_string()))?
            as usize;

        let convention = match self.config.validate() {
            Ok(cc) => cc,
            Err(e) => {
                warn!("faultprobe: cannot attach {}: {}", symbol_name, e);
                return Err(AttachError::UnsupportedConvention);
            }
        };

        self.backend.install(&self.core, symbol_name, addr);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *descriptor = Some(ProbeDescriptor {
            symbol_name: symbol_name.to_string(),
            addr,
            id,
            state: ProbeState::Registered,
            convention,
        });
        self.core.arm(addr);

        info!(
            "faultprobe: registered on {} at {:#x} ({}, {})",
            symbol_name,
            addr,
            convention.label(),
            self.backend.label()
        );

        Ok(ProbeHandle {
            id,
            symbol: symbol_name.to_string(),
            addr,
        })
    }

    /// Disarm the probe, wait for in-flight invocations, then remove it.
    ///
    /// The lifecycle lock is not held during the wait; meanwhile the probe
    /// reports [`ProbeState::Detaching`] and refuses a new attach. Must not
    /// be called from inside an interceptor or event sink: the wait would
    /// never end.
    pub fn detach(&self, handle: &ProbeHandle) -> Result<(), DetachError> {
        let addr = {
            let mut descriptor = self.descriptor.lock();
            let d = match descriptor.as_mut() {
                Some(d) if d.id == handle.id && d.state == ProbeState::Registered => d,
                _ => return Err(DetachError::NotRegistered),
            };
            d.state = ProbeState::Detaching;
            self.core.disarm();
            d.addr
        };

        self.core.wait_quiescent();

        let mut descriptor = self.descriptor.lock();
        self.backend.remove(addr);
        if let Some(d) = descriptor.take() {
            info!("faultprobe: unregistered {} at {:#x}", d.symbol_name, d.addr);
        }
        Ok(())
    }

    pub fn state(&self) -> ProbeState {
        self.descriptor
            .lock()
            .as_ref()
            .map_or(ProbeState::Unregistered, |d| d.state)
    }

    pub fn info(&self) -> Option<ProbeInfo> {
        self.descriptor.lock().as_ref().map(|d| ProbeInfo {
            symbol: d.symbol_name.clone(),
            addr: d.addr,
            state: d.state,
            convention: d.convention,
            backend: self.backend.label(),
        })
    }

    /// Whether the probe currently fires on `addr`.
    #[inline]
    pub fn is_armed(&self, addr: usize) -> bool {
        self.core.is_armed(addr)
    }

    pub fn stats(&self) -> ProbeStatsSnapshot {
        self.core.observer().stats().snapshot()
    }

    /// Number of entry/exit pairs currently running.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight()
    }

    pub(crate) fn core(&self) -> &ProbeCore {
        &self.core
    }
}

impl Drop for ProbeRegistry {
    fn drop(&mut self) {
        if let Some(d) = self.descriptor.get_mut().take() {
            self.core.disarm();
            self.core.wait_quiescent();
            self.backend.remove(d.addr);
            info!("faultprobe: unregistered {} at {:#x} on drop", d.symbol_name, d.addr);
        }
    }
}
