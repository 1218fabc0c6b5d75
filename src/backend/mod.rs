// src/backend/mod.rs - The native runtime seam
//! Every call that touches the accelerator runtime goes through [`Backend`].
//!
//! - `unavailable`: the backend used when no accelerator support is built in
//! - `sim`: an in-process runtime with virtual devices, used by tests and
//!   selectable through configuration
//! - `cuda`: the CUDA driver API (feature `cuda`)

pub mod sim;
pub mod unavailable;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use sim::{NativeCall, SimBackend, SimConfig};
pub use unavailable::UnavailableBackend;

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

use crate::device::{DeviceIndex, DeviceType, NO_DEVICE};
use crate::error::Result;
use crate::properties::DeviceProperties;
use crate::stream::Stream;
use std::sync::atomic::{AtomicU32, Ordering};

/// Backend-owned event handle.
pub type EventId = u64;

/// Device, stream and event primitives of an accelerator runtime.
///
/// Implementations own all "current selection" state. Index arguments are
/// either validated against [`Backend::device_count`] by the caller or are
/// [`NO_DEVICE`], which means the calling thread's current device.
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn device_type(&self) -> DeviceType;

    /// Whether accelerator support is compiled into this build.
    fn is_compiled(&self) -> bool;

    /// True in a child process forked after the runtime was initialized.
    fn is_in_bad_fork(&self) -> bool;

    fn init(&self) -> Result<()>;

    fn device_count(&self) -> Result<usize>;

    fn current_device(&self) -> Result<DeviceIndex>;

    fn set_device(&self, index: DeviceIndex) -> Result<()>;

    /// Makes `index` current and returns the previously current device.
    /// Negative indices are a no-op returning [`NO_DEVICE`].
    fn exchange_device(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        if index < 0 {
            return Ok(NO_DEVICE);
        }
        let previous = self.current_device()?;
        if previous != index {
            self.set_device(index)?;
        }
        Ok(previous)
    }

    /// Like [`Backend::exchange_device`], but must not create a device
    /// context that does not exist yet. Used when restoring a guard.
    fn maybe_exchange_device(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        self.exchange_device(index)
    }

    fn device_properties(&self, index: DeviceIndex) -> Result<DeviceProperties>;

    fn current_stream(&self, index: DeviceIndex) -> Result<Stream>;

    /// Makes the stream's device current and selects the stream on it.
    fn set_stream(&self, stream: &Stream) -> Result<()>;

    /// Hands out one of the runtime's pooled streams for `index`.
    fn stream_from_pool(&self, index: DeviceIndex, high_priority: bool) -> Result<Stream>;

    /// Blocks until all work on every stream of the device has drained.
    fn synchronize(&self, index: DeviceIndex) -> Result<()>;

    fn stream_query(&self, stream: &Stream) -> Result<bool>;

    fn stream_synchronize(&self, stream: &Stream) -> Result<()>;

    fn create_event(&self, enable_timing: bool) -> Result<EventId>;

    fn record_event(&self, event: EventId, stream: &Stream) -> Result<()>;

    fn event_query(&self, event: EventId) -> Result<bool>;

    fn event_synchronize(&self, event: EventId) -> Result<()>;

    fn stream_wait_event(&self, stream: &Stream, event: EventId) -> Result<()>;

    fn event_elapsed_ms(&self, start: EventId, end: EventId) -> Result<f32>;

    fn destroy_event(&self, event: EventId);
}

/// Detects use of an initialized runtime from a forked child.
///
/// The process id is recorded when the runtime initializes; a different id
/// afterwards means this process inherited the parent's runtime state.
#[derive(Debug, Default)]
pub struct ForkProbe {
    init_pid: AtomicU32,
}

impl ForkProbe {
    pub const fn new() -> Self {
        ForkProbe {
            init_pid: AtomicU32::new(0),
        }
    }

    pub fn mark_initialized(&self) {
        self.init_pid.store(std::process::id(), Ordering::Release);
    }

    pub fn is_in_bad_fork(&self) -> bool {
        let pid = self.init_pid.load(Ordering::Acquire);
        pid != 0 && pid != std::process::id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_probe_same_process() {
        let probe = ForkProbe::new();
        assert!(!probe.is_in_bad_fork());
        probe.mark_initialized();
        assert!(!probe.is_in_bad_fork());
    }

    #[test]
    fn test_fork_probe_foreign_pid() {
        let probe = ForkProbe::new();
        probe
            .init_pid
            .store(std::process::id().wrapping_add(1), Ordering::Release);
        assert!(probe.is_in_bad_fork());
    }
}
