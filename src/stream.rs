// src/stream.rs - Stream handles and events
use crate::backend::{Backend, EventId};
use crate::device::{Device, DeviceIndex, DeviceType};
use crate::error::{AccelError, Result};
use crate::runtime::Runtime;
use std::fmt;
use std::sync::Arc;

/// Handle to a runtime-owned queue of accelerator work.
///
/// Work enqueued on the same stream executes in submission order. The handle
/// is plain data; the underlying resource belongs to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub stream_id: i64,
    pub device_index: DeviceIndex,
    pub device_type: DeviceType,
}

impl Stream {
    pub fn new(stream_id: i64, device_index: DeviceIndex, device_type: DeviceType) -> Self {
        Stream {
            stream_id,
            device_index,
            device_type,
        }
    }

    pub fn device(&self) -> Device {
        Device::new(self.device_type, self.device_index)
    }

    /// True if all work submitted to this stream has completed.
    pub fn query(&self, runtime: &Runtime) -> Result<bool> {
        runtime.lazy_init()?;
        runtime.backend().stream_query(self)
    }

    pub fn synchronize(&self, runtime: &Runtime) -> Result<()> {
        runtime.lazy_init()?;
        runtime.backend().stream_synchronize(self)
    }

    /// Future work on this stream waits until `event` completes.
    pub fn wait_event(&self, runtime: &Runtime, event: &Event) -> Result<()> {
        event.wait(runtime, self)
    }

    /// Future work on this stream waits for everything queued on `other` so far.
    pub fn wait_stream(&self, runtime: &Runtime, other: &Stream) -> Result<()> {
        let marker = other.record_event(runtime, None)?;
        self.wait_event(runtime, &marker)
    }

    /// Records `event` (or a fresh untimed one) on this stream and returns it.
    pub fn record_event(&self, runtime: &Runtime, event: Option<Event>) -> Result<Event> {
        let event = match event {
            Some(event) => event,
            None => runtime.create_event(false)?,
        };
        event.record(runtime, self)?;
        Ok(event)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stream(device={}, stream_id={})",
            self.device(),
            self.stream_id
        )
    }
}

/// Synchronization marker recorded on a stream. Destroyed with the handle.
pub struct Event {
    id: EventId,
    enable_timing: bool,
    backend: Arc<dyn Backend>,
}

impl Event {
    pub(crate) fn new(id: EventId, enable_timing: bool, backend: Arc<dyn Backend>) -> Self {
        Event {
            id,
            enable_timing,
            backend,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn enable_timing(&self) -> bool {
        self.enable_timing
    }

    pub fn record(&self, runtime: &Runtime, stream: &Stream) -> Result<()> {
        runtime.lazy_init()?;
        runtime.backend().record_event(self.id, stream)
    }

    /// True once all work captured by the last `record` has completed.
    pub fn query(&self, runtime: &Runtime) -> Result<bool> {
        runtime.lazy_init()?;
        runtime.backend().event_query(self.id)
    }

    pub fn synchronize(&self, runtime: &Runtime) -> Result<()> {
        runtime.lazy_init()?;
        runtime.backend().event_synchronize(self.id)
    }

    pub fn wait(&self, runtime: &Runtime, stream: &Stream) -> Result<()> {
        runtime.lazy_init()?;
        runtime.backend().stream_wait_event(stream, self.id)
    }

    /// Milliseconds between this event and `end`, both recorded with timing.
    pub fn elapsed_time(&self, runtime: &Runtime, end: &Event) -> Result<f32> {
        if !self.enable_timing || !end.enable_timing {
            return Err(AccelError::invalid_argument(
                "both events must be created with enable_timing=true",
            ));
        }
        runtime.lazy_init()?;
        runtime.backend().event_elapsed_ms(self.id, end.id)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("enable_timing", &self.enable_timing)
            .field("backend", &self.backend.device_type())
            .finish()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Handles inherited across a fork belong to the parent's runtime.
        if self.backend.is_in_bad_fork() {
            log::debug!("leaking event {} created before fork", self.id);
            return;
        }
        self.backend.destroy_event(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeCall, SimBackend};

    fn sim_runtime(devices: usize) -> (Arc<SimBackend>, Runtime) {
        let backend = Arc::new(SimBackend::with_devices(devices));
        let runtime = Runtime::new(backend.clone());
        (backend, runtime)
    }

    #[test]
    fn test_stream_display() {
        let stream = Stream::new(3, 1, DeviceType::Xpu);
        assert_eq!(stream.to_string(), "Stream(device=xpu:1, stream_id=3)");
    }

    #[test]
    fn test_stream_ops_initialize_lazily() {
        let (backend, runtime) = sim_runtime(1);
        let stream = Stream::new(0, 0, DeviceType::Sim);
        assert!(stream.query(&runtime).unwrap());
        stream.synchronize(&runtime).unwrap();
        assert_eq!(backend.init_calls(), 1);
    }

    #[test]
    fn test_wait_stream_records_on_other() {
        let (backend, runtime) = sim_runtime(2);
        let waiter = runtime.get_stream_from_pool(0, false).unwrap();
        let other = runtime.get_stream_from_pool(1, false).unwrap();
        backend.drain_calls();

        waiter.wait_stream(&runtime, &other).unwrap();
        let calls = backend.drain_calls();
        assert!(matches!(calls[0], NativeCall::CreateEvent));
        assert!(matches!(calls[1], NativeCall::RecordEvent(_)));
        assert!(matches!(calls[2], NativeCall::WaitEvent(_)));
        assert!(matches!(calls[3], NativeCall::DestroyEvent(_)));
    }

    #[test]
    fn test_elapsed_time_requires_timing() {
        let (_backend, runtime) = sim_runtime(1);
        let stream = runtime.current_stream(()).unwrap();
        let start = stream.record_event(&runtime, Some(runtime.create_event(true).unwrap())).unwrap();
        let end = stream.record_event(&runtime, Some(runtime.create_event(true).unwrap())).unwrap();
        assert!(start.elapsed_time(&runtime, &end).unwrap() >= 0.0);
        assert!(end.query(&runtime).unwrap());

        let untimed = stream.record_event(&runtime, None).unwrap();
        assert!(matches!(
            start.elapsed_time(&runtime, &untimed),
            Err(AccelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_event_dropped_after_fork_is_not_destroyed() {
        let (backend, runtime) = sim_runtime(1);
        let event = runtime.create_event(false).unwrap();
        backend.simulate_fork();
        backend.drain_calls();

        drop(event);
        assert!(backend.drain_calls().is_empty());
    }
}
