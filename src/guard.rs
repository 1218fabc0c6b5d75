// src/guard.rs - Scoped device and stream selection
use crate::device::{DeviceIndex, DeviceRef, OnDevice, NO_DEVICE};
use crate::error::Result;
use crate::runtime::Runtime;
use crate::stream::Stream;
use std::marker::PhantomData;

// Current-selection state is per thread, so guards must drop on the thread that made them.
type NotSend = PhantomData<*const ()>;

/// Switches the current device for the guard's lifetime.
///
/// Each guard remembers the device that was current when it was created and
/// restores it on drop, so nested guards unwind in LIFO order. A negative or
/// absent device makes the guard a no-op.
#[must_use = "the previous device is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct DeviceGuard<'rt> {
    runtime: &'rt Runtime,
    index: DeviceIndex,
    prev_index: DeviceIndex,
    _not_send: NotSend,
}

impl<'rt> DeviceGuard<'rt> {
    pub fn new(runtime: &'rt Runtime, device: impl Into<DeviceRef>) -> Result<Self> {
        let index = runtime.resolve(device.into(), true)?;
        Self::enter(runtime, index)
    }

    /// Selects the device `obj` lives on, or nothing if it is not on this backend.
    pub fn of(runtime: &'rt Runtime, obj: &impl OnDevice) -> Result<Self> {
        Self::enter(runtime, obj.device_index().unwrap_or(NO_DEVICE))
    }

    fn enter(runtime: &'rt Runtime, index: DeviceIndex) -> Result<Self> {
        let prev_index = runtime.exchange_device(index)?;
        Ok(Self {
            runtime,
            index,
            prev_index,
            _not_send: PhantomData,
        })
    }

    /// The device selected by this guard, or [`NO_DEVICE`].
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    pub fn prev_index(&self) -> DeviceIndex {
        self.prev_index
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.maybe_exchange_device(self.prev_index) {
            log::error!("failed to restore device {}: {}", self.prev_index, e);
        }
    }
}

/// Selects a stream for the guard's lifetime.
///
/// Streams belong to a device. When the target stream lives on a device other
/// than the current one, the guard also records the stream that was selected
/// on the target device and restores both on drop: the target device's
/// stream first, then the original device's.
#[must_use = "the previous stream is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct StreamGuard<'rt> {
    runtime: &'rt Runtime,
    stream: Option<Stream>,
    src_prev_stream: Option<Stream>,
    dst_prev_stream: Option<Stream>,
    _not_send: NotSend,
}

impl<'rt> StreamGuard<'rt> {
    pub fn new(runtime: &'rt Runtime, stream: Option<&Stream>) -> Result<Self> {
        let mut guard = Self {
            runtime,
            stream: stream.copied(),
            src_prev_stream: None,
            dst_prev_stream: None,
            _not_send: PhantomData,
        };

        let Some(target) = guard.stream else {
            return Ok(guard);
        };
        let index = if runtime.is_available() {
            runtime.current_device()?
        } else {
            NO_DEVICE
        };
        if index == NO_DEVICE {
            return Ok(guard);
        }

        let src_prev = runtime.current_stream(())?;
        let dst_prev = if src_prev.device() != target.device() {
            let _device = DeviceGuard::new(runtime, target.device())?;
            Some(runtime.current_stream(target.device_index)?)
        } else {
            None
        };
        runtime.set_stream(Some(&target))?;

        guard.src_prev_stream = Some(src_prev);
        guard.dst_prev_stream = dst_prev;
        Ok(guard)
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    /// True if entering the guard changed nothing.
    pub fn is_noop(&self) -> bool {
        self.src_prev_stream.is_none()
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        for prev in [self.dst_prev_stream.take(), self.src_prev_stream.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.runtime.set_stream(Some(&prev)) {
                log::error!("failed to restore {}: {}", prev, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeCall, SimBackend, UnavailableBackend};
    use crate::device::DeviceType;
    use std::sync::Arc;

    fn sim_runtime(devices: usize) -> (Arc<SimBackend>, Runtime) {
        let backend = Arc::new(SimBackend::with_devices(devices));
        let runtime = Runtime::new(backend.clone());
        (backend, runtime)
    }

    struct Tensor(Option<DeviceIndex>);

    impl OnDevice for Tensor {
        fn device_index(&self) -> Option<DeviceIndex> {
            self.0
        }
    }

    #[test]
    fn test_device_guard_restores() {
        let (_backend, runtime) = sim_runtime(3);
        {
            let guard = DeviceGuard::new(&runtime, 2).unwrap();
            assert_eq!(guard.prev_index(), 0);
            assert_eq!(runtime.current_device(), Ok(2));
        }
        assert_eq!(runtime.current_device(), Ok(0));
    }

    #[test]
    fn test_nested_device_guards() {
        let (_backend, runtime) = sim_runtime(3);
        let outer = runtime.device(1).unwrap();
        {
            let _inner = runtime.device(2).unwrap();
            assert_eq!(runtime.current_device(), Ok(2));
        }
        assert_eq!(runtime.current_device(), Ok(1));
        drop(outer);
        assert_eq!(runtime.current_device(), Ok(0));
    }

    #[test]
    fn test_negative_device_guard_is_noop() {
        let (backend, runtime) = sim_runtime(2);
        let guard = DeviceGuard::new(&runtime, -1).unwrap();
        assert_eq!(guard.prev_index(), NO_DEVICE);
        drop(guard);
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_device_guard_restores_on_panic() {
        let (_backend, runtime) = sim_runtime(2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = runtime.device(1).unwrap();
            panic!("work failed");
        }));
        assert!(result.is_err());
        assert_eq!(runtime.current_device(), Ok(0));
    }

    #[test]
    fn test_device_of() {
        let (_backend, runtime) = sim_runtime(2);
        {
            let _guard = runtime.device_of(&Tensor(Some(1))).unwrap();
            assert_eq!(runtime.current_device(), Ok(1));
        }
        let guard = runtime.device_of(&Tensor(None)).unwrap();
        assert_eq!(guard.index(), NO_DEVICE);
        assert_eq!(runtime.current_device(), Ok(0));
    }

    #[test]
    fn test_device_guard_rejects_out_of_range() {
        let (_backend, runtime) = sim_runtime(2);
        assert!(DeviceGuard::new(&runtime, 4).is_err());
        assert_eq!(runtime.current_device(), Ok(0));
    }

    #[test]
    fn test_stream_guard_same_device() {
        let (backend, runtime) = sim_runtime(2);
        let original = runtime.current_stream(()).unwrap();
        let pooled = runtime.get_stream_from_pool(0, false).unwrap();
        {
            let guard = runtime.stream(Some(&pooled)).unwrap();
            assert!(!guard.is_noop());
            assert_eq!(runtime.current_stream(()), Ok(pooled));
        }
        assert_eq!(runtime.current_stream(()), Ok(original));
        let sets = backend
            .drain_calls()
            .into_iter()
            .filter(|c| matches!(c, NativeCall::SetStream(_)))
            .count();
        assert_eq!(sets, 2);
    }

    #[test]
    fn test_stream_guard_cross_device_restore_order() {
        let (backend, runtime) = sim_runtime(2);
        let src_prev = runtime.current_stream(0).unwrap();
        let dst_prev = runtime.get_stream_from_pool(1, false).unwrap();
        runtime.set_stream(Some(&dst_prev)).unwrap();
        runtime.set_device(0).unwrap();
        let target = runtime.get_stream_from_pool(1, true).unwrap();
        backend.drain_calls();

        {
            let _guard = runtime.stream(Some(&target)).unwrap();
            assert_eq!(runtime.current_stream(1), Ok(target));
        }

        let restores: Vec<_> = backend
            .drain_calls()
            .into_iter()
            .filter_map(|c| match c {
                NativeCall::SetStream(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(restores, vec![target, dst_prev, src_prev]);
        assert_eq!(runtime.current_device(), Ok(0));
        assert_eq!(runtime.current_stream(0), Ok(src_prev));
        assert_eq!(runtime.current_stream(1), Ok(dst_prev));
    }

    #[test]
    fn test_stream_guard_none_is_noop() {
        let (backend, runtime) = sim_runtime(1);
        let guard = runtime.stream(None).unwrap();
        assert!(guard.is_noop());
        drop(guard);
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_stream_guard_without_devices_is_noop() {
        let runtime = Runtime::new(Arc::new(UnavailableBackend::new(DeviceType::Xpu)));
        let stream = Stream::new(0, 0, DeviceType::Xpu);
        let guard = runtime.stream(Some(&stream)).unwrap();
        assert!(guard.is_noop());
    }
}
