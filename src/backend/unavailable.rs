// src/backend/unavailable.rs - Backend for builds without accelerator support
use super::{Backend, EventId};
use crate::device::{DeviceIndex, DeviceType};
use crate::error::{AccelError, Result};
use crate::properties::DeviceProperties;
use crate::stream::Stream;

/// Reports zero devices and fails every native call with `NotCompiled`.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableBackend {
    kind: DeviceType,
}

impl UnavailableBackend {
    pub fn new(kind: DeviceType) -> Self {
        UnavailableBackend { kind }
    }

    fn missing<T>(&self) -> Result<T> {
        Err(AccelError::NotCompiled { kind: self.kind })
    }
}

impl Backend for UnavailableBackend {
    fn device_type(&self) -> DeviceType {
        self.kind
    }

    fn is_compiled(&self) -> bool {
        false
    }

    fn is_in_bad_fork(&self) -> bool {
        false
    }

    fn init(&self) -> Result<()> {
        self.missing()
    }

    fn device_count(&self) -> Result<usize> {
        Ok(0)
    }

    fn current_device(&self) -> Result<DeviceIndex> {
        self.missing()
    }

    fn set_device(&self, _index: DeviceIndex) -> Result<()> {
        self.missing()
    }

    fn device_properties(&self, _index: DeviceIndex) -> Result<DeviceProperties> {
        self.missing()
    }

    fn current_stream(&self, _index: DeviceIndex) -> Result<Stream> {
        self.missing()
    }

    fn set_stream(&self, _stream: &Stream) -> Result<()> {
        self.missing()
    }

    fn stream_from_pool(&self, _index: DeviceIndex, _high_priority: bool) -> Result<Stream> {
        self.missing()
    }

    fn synchronize(&self, _index: DeviceIndex) -> Result<()> {
        self.missing()
    }

    fn stream_query(&self, _stream: &Stream) -> Result<bool> {
        self.missing()
    }

    fn stream_synchronize(&self, _stream: &Stream) -> Result<()> {
        self.missing()
    }

    fn create_event(&self, _enable_timing: bool) -> Result<EventId> {
        self.missing()
    }

    fn record_event(&self, _event: EventId, _stream: &Stream) -> Result<()> {
        self.missing()
    }

    fn event_query(&self, _event: EventId) -> Result<bool> {
        self.missing()
    }

    fn event_synchronize(&self, _event: EventId) -> Result<()> {
        self.missing()
    }

    fn stream_wait_event(&self, _stream: &Stream, _event: EventId) -> Result<()> {
        self.missing()
    }

    fn event_elapsed_ms(&self, _start: EventId, _end: EventId) -> Result<f32> {
        self.missing()
    }

    fn destroy_event(&self, _event: EventId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NO_DEVICE;

    #[test]
    fn test_no_devices_and_not_compiled() {
        let backend = UnavailableBackend::new(DeviceType::Xpu);
        assert_eq!(backend.device_count(), Ok(0));
        assert!(!backend.is_compiled());
        assert_eq!(
            backend.init(),
            Err(AccelError::NotCompiled { kind: DeviceType::Xpu })
        );
    }

    #[test]
    fn test_exchange_of_negative_index_is_noop() {
        let backend = UnavailableBackend::new(DeviceType::Xpu);
        assert_eq!(backend.exchange_device(-1), Ok(NO_DEVICE));
        assert!(backend.exchange_device(0).is_err());
    }
}
