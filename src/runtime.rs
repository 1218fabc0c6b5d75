// src/runtime.rs - Lazily initialized query and selection surface
use crate::backend::Backend;
use crate::config::RuntimeConfig;
use crate::device::{DeviceIndex, DeviceRef, DeviceType, OnDevice, NO_DEVICE};
use crate::error::{AccelError, Result};
use crate::guard::{DeviceGuard, StreamGuard};
use crate::init::InitGate;
use crate::properties::{DeviceCapability, DeviceProperties};
use crate::stream::{Event, Stream};
use std::sync::{Arc, OnceLock};

/// Half precision is available on every supported backend.
pub const HAS_HALF: bool = true;

/// One backend plus its initialization state.
///
/// Every operation that needs the native runtime passes through the
/// [`InitGate`] first. The crate-level functions use a process-wide instance;
/// tests build their own around an injected backend.
#[derive(Debug)]
pub struct Runtime {
    backend: Arc<dyn Backend>,
    gate: InitGate,
    device_count: OnceLock<usize>,
}

impl Runtime {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            gate: InitGate::new(),
            device_count: OnceLock::new(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let runtime = Self::new(config.build_backend());
        log::debug!(
            "created {} runtime from {:?} backend config",
            runtime.device_type(),
            config.backend
        );
        runtime
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn device_type(&self) -> DeviceType {
        self.backend.device_type()
    }

    /// Whether accelerator support is compiled in.
    pub fn is_compiled(&self) -> bool {
        self.backend.is_compiled()
    }

    /// Initializes the backend. Does nothing if already initialized.
    pub fn init(&self) -> Result<()> {
        self.lazy_init()
    }

    pub(crate) fn lazy_init(&self) -> Result<()> {
        self.gate.lazy_init(self.backend.as_ref())
    }

    pub fn is_initialized(&self) -> bool {
        self.gate.is_initialized(self.backend.as_ref())
    }

    /// Number of available devices; 0 when no backend is compiled in.
    ///
    /// Computed at most once per runtime and never refreshed, so devices
    /// plugged in later are not seen. Never fails and never initializes.
    pub fn device_count(&self) -> usize {
        *self.device_count.get_or_init(|| {
            if !self.backend.is_compiled() {
                return 0;
            }
            match self.backend.device_count() {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("{} device count query failed: {}", self.device_type(), e);
                    0
                }
            }
        })
    }

    pub fn is_available(&self) -> bool {
        self.device_count() > 0
    }

    pub fn is_bf16_supported(&self) -> bool {
        true
    }

    pub fn current_device(&self) -> Result<DeviceIndex> {
        self.lazy_init()?;
        self.backend.current_device()
    }

    /// Selects the current device. Negative indices are a no-op.
    pub fn set_device(&self, device: impl Into<DeviceRef>) -> Result<()> {
        self.lazy_init()?;
        let index = self.resolve(device.into(), false)?;
        if index < 0 {
            return Ok(());
        }
        self.check_index(index)?;
        log::debug!("selecting {}:{}", self.device_type(), index);
        self.backend.set_device(index)
    }

    /// Makes `index` current and returns the previous device, or
    /// [`NO_DEVICE`] without touching anything when `index` is negative.
    pub fn exchange_device(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        if index < 0 {
            return Ok(NO_DEVICE);
        }
        self.lazy_init()?;
        self.check_index(index)?;
        self.backend.exchange_device(index)
    }

    /// Restoring counterpart of [`Runtime::exchange_device`]; never initializes.
    pub fn maybe_exchange_device(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        if index < 0 {
            return Ok(NO_DEVICE);
        }
        if self.backend.is_in_bad_fork() {
            return Err(AccelError::BadFork {
                kind: self.device_type(),
            });
        }
        self.backend.maybe_exchange_device(index)
    }

    /// Properties of `device`, or of the current device when it is absent or
    /// names only a device type.
    pub fn get_device_properties(&self, device: impl Into<DeviceRef>) -> Result<DeviceProperties> {
        self.lazy_init()?;
        let device = device.into();
        let implicit = device.is_implicit();
        let mut index = self.resolve(device, true)?;
        if index == NO_DEVICE && implicit {
            index = self.backend.current_device()?;
        }
        self.check_index(index)?;
        self.backend.device_properties(index)
    }

    pub fn get_device_name(&self, device: impl Into<DeviceRef>) -> Result<String> {
        Ok(self.get_device_properties(device)?.name)
    }

    pub fn get_device_capability(&self, device: impl Into<DeviceRef>) -> Result<DeviceCapability> {
        Ok(self.get_device_properties(device)?.capability())
    }

    /// The stream currently selected on `device` (the current device if absent).
    pub fn current_stream(&self, device: impl Into<DeviceRef>) -> Result<Stream> {
        self.lazy_init()?;
        let index = self.resolve_optional_in_range(device.into())?;
        self.backend.current_stream(index)
    }

    /// Selects `stream` on its device. `None` is a no-op.
    ///
    /// Prefer [`Runtime::stream`], which restores the previous selection.
    pub fn set_stream(&self, stream: Option<&Stream>) -> Result<()> {
        let Some(stream) = stream else {
            return Ok(());
        };
        self.lazy_init()?;
        if stream.device_type != self.device_type() {
            return Err(AccelError::invalid_argument(format!(
                "Expected a {} stream, but got: {}",
                self.device_type(),
                stream
            )));
        }
        self.check_index(stream.device_index)?;
        self.backend.set_stream(stream)
    }

    /// One of the runtime's pooled streams on `device`.
    pub fn get_stream_from_pool(
        &self,
        device: impl Into<DeviceRef>,
        high_priority: bool,
    ) -> Result<Stream> {
        self.lazy_init()?;
        let index = self.resolve_optional_in_range(device.into())?;
        self.backend.stream_from_pool(index, high_priority)
    }

    pub fn create_event(&self, enable_timing: bool) -> Result<Event> {
        self.lazy_init()?;
        let id = self.backend.create_event(enable_timing)?;
        Ok(Event::new(id, enable_timing, Arc::clone(&self.backend)))
    }

    /// Blocks until all work on `device` (the current device if absent) completes.
    pub fn synchronize(&self, device: impl Into<DeviceRef>) -> Result<()> {
        self.lazy_init()?;
        let index = self.resolve_optional_in_range(device.into())?;
        log::debug!("synchronizing {} device {}", self.device_type(), index);
        self.backend.synchronize(index)
    }

    /// Scoped device selection, restored when the guard drops.
    pub fn device(&self, device: impl Into<DeviceRef>) -> Result<DeviceGuard<'_>> {
        DeviceGuard::new(self, device)
    }

    /// Scoped selection of the device `obj` lives on; a no-op for objects elsewhere.
    pub fn device_of(&self, obj: &impl OnDevice) -> Result<DeviceGuard<'_>> {
        DeviceGuard::of(self, obj)
    }

    /// Scoped stream selection, restored when the guard drops.
    pub fn stream(&self, stream: Option<&Stream>) -> Result<StreamGuard<'_>> {
        StreamGuard::new(self, stream)
    }

    pub fn with_device<R>(&self, device: impl Into<DeviceRef>, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.device(device)?;
        Ok(f())
    }

    pub fn with_stream<R>(&self, stream: Option<&Stream>, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.stream(stream)?;
        Ok(f())
    }

    pub(crate) fn resolve(&self, device: DeviceRef, optional: bool) -> Result<DeviceIndex> {
        device.resolve(self.device_type(), optional)
    }

    fn resolve_optional_in_range(&self, device: DeviceRef) -> Result<DeviceIndex> {
        let index = self.resolve(device, true)?;
        if index >= 0 {
            self.check_index(index)?;
        }
        Ok(index)
    }

    fn check_index(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        let count = self.device_count();
        if index < 0 || index as usize >= count {
            return Err(AccelError::InvalidDevice { index, count });
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeCall, SimBackend, SimConfig, UnavailableBackend};

    fn sim_runtime(devices: usize) -> (Arc<SimBackend>, Runtime) {
        let backend = Arc::new(SimBackend::with_devices(devices));
        let runtime = Runtime::new(backend.clone());
        (backend, runtime)
    }

    #[test]
    fn test_unavailable_runtime_never_fails_count() {
        let runtime = Runtime::new(Arc::new(UnavailableBackend::new(DeviceType::Xpu)));
        assert_eq!(runtime.device_count(), 0);
        assert!(!runtime.is_available());
        assert!(!runtime.is_initialized());
        assert_eq!(
            runtime.current_device(),
            Err(AccelError::NotCompiled { kind: DeviceType::Xpu })
        );
    }

    #[test]
    fn test_device_count_is_cached_and_lazy() {
        let (backend, runtime) = sim_runtime(3);
        assert_eq!(runtime.device_count(), 3);
        assert_eq!(runtime.device_count(), 3);
        assert!(!runtime.is_initialized());
        assert_eq!(backend.drain_calls(), vec![NativeCall::DeviceCount]);
    }

    #[test]
    fn test_properties_default_to_current_device() {
        let backend = Arc::new(SimBackend::new(SimConfig {
            device_count: 2,
            device_name: "Unit Device".to_string(),
            ..Default::default()
        }));
        let runtime = Runtime::new(backend);
        runtime.set_device(1).unwrap();

        let props = runtime.get_device_properties(()).unwrap();
        assert_eq!(props.device_index, 1);
        assert_eq!(runtime.get_device_name(0).unwrap(), "Unit Device");
        assert_eq!(runtime.get_device_capability("sim:1").unwrap(), props.capability());
    }

    #[test]
    fn test_type_only_reference_means_current_device() {
        let (_backend, runtime) = sim_runtime(2);
        assert_eq!(runtime.get_device_properties("sim").unwrap().device_index, 0);

        runtime.set_device(1).unwrap();
        let handle = crate::device::Device::of_type(DeviceType::Sim);
        assert_eq!(runtime.get_device_properties(handle).unwrap().device_index, 1);
        assert!(runtime.get_device_name("sim").is_ok());
        assert!(runtime.get_device_capability("sim").is_ok());
        assert_eq!(runtime.get_device_properties("1").unwrap().device_index, 1);
    }

    #[test]
    fn test_maybe_exchange_after_fork() {
        let (backend, runtime) = sim_runtime(2);
        runtime.init().unwrap();
        backend.simulate_fork();
        backend.drain_calls();

        assert_eq!(
            runtime.maybe_exchange_device(0),
            Err(AccelError::BadFork { kind: DeviceType::Sim })
        );
        assert_eq!(runtime.maybe_exchange_device(-1), Ok(NO_DEVICE));
        assert!(backend.drain_calls().is_empty());
    }

    #[test]
    fn test_properties_reject_out_of_range() {
        let (_backend, runtime) = sim_runtime(2);
        assert_eq!(
            runtime.get_device_properties(2),
            Err(AccelError::InvalidDevice { index: 2, count: 2 })
        );
        assert_eq!(
            runtime.get_device_properties(-1),
            Err(AccelError::InvalidDevice { index: -1, count: 2 })
        );
    }

    #[test]
    fn test_set_device_semantics() {
        let (_backend, runtime) = sim_runtime(2);
        runtime.set_device(-1).unwrap();
        assert_eq!(runtime.current_device(), Ok(0));

        runtime.set_device("sim:1").unwrap();
        assert_eq!(runtime.current_device(), Ok(1));

        assert!(matches!(runtime.set_device(()), Err(AccelError::InvalidArgument(_))));
        assert!(matches!(
            runtime.set_device(5),
            Err(AccelError::InvalidDevice { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_exchange_device_returns_previous() {
        let (backend, runtime) = sim_runtime(2);
        assert_eq!(runtime.exchange_device(-1), Ok(NO_DEVICE));
        assert_eq!(backend.init_calls(), 0);

        assert_eq!(runtime.exchange_device(1), Ok(0));
        assert_eq!(runtime.maybe_exchange_device(0), Ok(1));
        assert_eq!(runtime.current_device(), Ok(0));
    }

    #[test]
    fn test_set_stream_none_is_noop() {
        let (backend, runtime) = sim_runtime(1);
        runtime.set_stream(None).unwrap();
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_set_stream_rejects_foreign_type() {
        let (_backend, runtime) = sim_runtime(1);
        let foreign = Stream::new(0, 0, DeviceType::Cuda);
        assert!(matches!(
            runtime.set_stream(Some(&foreign)),
            Err(AccelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_synchronize_validates_index() {
        let (backend, runtime) = sim_runtime(2);
        runtime.synchronize(()).unwrap();
        runtime.synchronize(1).unwrap();
        assert!(runtime.synchronize(7).is_err());
        let syncs: Vec<_> = backend
            .drain_calls()
            .into_iter()
            .filter(|c| matches!(c, NativeCall::Synchronize(_)))
            .collect();
        assert_eq!(
            syncs,
            vec![NativeCall::Synchronize(NO_DEVICE), NativeCall::Synchronize(1)]
        );
    }

    #[test]
    fn test_with_device_closure() {
        let (_backend, runtime) = sim_runtime(2);
        let inner = runtime
            .with_device(1, || runtime.current_device().unwrap())
            .unwrap();
        assert_eq!(inner, 1);
        assert_eq!(runtime.current_device(), Ok(0));
    }
}
