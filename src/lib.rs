//! Lazily initialized device, stream and event selection for an accelerator runtime.
//!
//! The crate is safe to load without any accelerator present: nothing touches
//! the native runtime until the first call that needs it. Device enumeration,
//! stream scheduling and synchronization stay in the backend; this layer
//! resolves loose device references, runs backend initialization exactly once
//! and provides scoped guards that put the device and stream selection back
//! the way they found it.
//!
//! The free functions below operate on a process-wide [`Runtime`] whose
//! backend is chosen from the environment (see [`RuntimeConfig::from_env`]).
//! Embedders and tests that want their own backend construct a [`Runtime`]
//! directly.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod guard;
pub mod init;
pub mod properties;
pub mod runtime;
pub mod stream;

#[cfg(feature = "python")]
pub mod python;

pub use backend::{Backend, EventId, SimBackend, SimConfig, UnavailableBackend};
pub use config::{BackendKind, RuntimeConfig};
pub use device::{Device, DeviceIndex, DeviceRef, DeviceType, OnDevice, NO_DEVICE};
pub use error::{AccelError, Result};
pub use guard::{DeviceGuard, StreamGuard};
pub use init::InitGate;
pub use properties::{DeviceCapability, DeviceProperties};
pub use runtime::{Runtime, HAS_HALF};
pub use stream::{Event, Stream};

lazy_static::lazy_static! {
    static ref GLOBAL_RUNTIME: Runtime = Runtime::from_config(&RuntimeConfig::from_env());
}

/// The process-wide runtime, created on first use.
pub fn runtime() -> &'static Runtime {
    &GLOBAL_RUNTIME
}

/// Initializes the backend. Does nothing if it is already initialized.
pub fn init() -> Result<()> {
    runtime().init()
}

pub fn is_initialized() -> bool {
    runtime().is_initialized()
}

/// Never fails; false when no backend is compiled in or no device is present.
pub fn is_available() -> bool {
    runtime().is_available()
}

pub fn is_bf16_supported() -> bool {
    runtime().is_bf16_supported()
}

pub fn device_count() -> usize {
    runtime().device_count()
}

pub fn current_device() -> Result<DeviceIndex> {
    runtime().current_device()
}

pub fn set_device(device: impl Into<DeviceRef>) -> Result<()> {
    runtime().set_device(device)
}

pub fn get_device_properties(device: impl Into<DeviceRef>) -> Result<DeviceProperties> {
    runtime().get_device_properties(device)
}

pub fn get_device_name(device: impl Into<DeviceRef>) -> Result<String> {
    runtime().get_device_name(device)
}

pub fn get_device_capability(device: impl Into<DeviceRef>) -> Result<DeviceCapability> {
    runtime().get_device_capability(device)
}

pub fn current_stream(device: impl Into<DeviceRef>) -> Result<Stream> {
    runtime().current_stream(device)
}

pub fn set_stream(stream: Option<&Stream>) -> Result<()> {
    runtime().set_stream(stream)
}

pub fn synchronize(device: impl Into<DeviceRef>) -> Result<()> {
    runtime().synchronize(device)
}

/// Scoped device selection on the process-wide runtime.
pub fn device(device: impl Into<DeviceRef>) -> Result<DeviceGuard<'static>> {
    runtime().device(device)
}

pub fn device_of(obj: &impl OnDevice) -> Result<DeviceGuard<'static>> {
    runtime().device_of(obj)
}

/// Scoped stream selection on the process-wide runtime.
pub fn stream(stream: Option<&Stream>) -> Result<StreamGuard<'static>> {
    runtime().stream(stream)
}
