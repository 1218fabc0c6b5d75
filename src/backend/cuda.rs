// src/backend/cuda.rs - CUDA driver API backend
use super::{Backend, EventId, ForkProbe};
use crate::device::{DeviceIndex, DeviceType, NO_DEVICE};
use crate::error::{AccelError, Result};
use crate::properties::DeviceProperties;
use crate::stream::Stream;
use cudarc::driver::{result, sys};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

/// Non-blocking streams created per device at init and handed out round robin.
const POOL_SIZE: usize = 4;

thread_local! {
    // `None` until a context has been made current on this thread.
    static CURRENT_DEVICE: Cell<Option<DeviceIndex>> = Cell::new(None);
    static CURRENT_STREAMS: RefCell<HashMap<DeviceIndex, i64>> = RefCell::new(HashMap::new());
}

struct RawHandle<T>(T);

// Driver handles are opaque pointers owned by the process-wide CUDA context.
unsafe impl<T> Send for RawHandle<T> {}

struct DeviceState {
    device: sys::CUdevice,
    context: RawHandle<sys::CUcontext>,
    pool: Vec<RawHandle<sys::CUstream>>,
    cursor: AtomicUsize,
}

/// Maps device and stream selection onto CUDA primary contexts.
///
/// Stream id 0 is the legacy default stream of a device; ids `1..=POOL_SIZE`
/// are the pooled non-blocking streams. Current device and stream selection
/// are tracked per thread.
pub struct CudaBackend {
    fork_probe: ForkProbe,
    devices: OnceLock<Vec<Mutex<DeviceState>>>,
    events: Mutex<HashMap<EventId, RawHandle<sys::CUevent>>>,
    next_event: AtomicU64,
}

/// The thread's selected device, binding `fallback` through `bind` the
/// first time the thread needs a context.
fn bind_once(
    slot: &Cell<Option<DeviceIndex>>,
    fallback: DeviceIndex,
    bind: impl FnOnce(DeviceIndex) -> Result<()>,
) -> Result<DeviceIndex> {
    if let Some(index) = slot.get() {
        return Ok(index);
    }
    bind(fallback)?;
    slot.set(Some(fallback));
    Ok(fallback)
}

fn selected_device() -> DeviceIndex {
    CURRENT_DEVICE.with(Cell::get).unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn driver(operation: &'static str) -> impl FnOnce(result::DriverError) -> AccelError {
    move |e| AccelError::backend(operation, format!("{:?}", e))
}

impl CudaBackend {
    /// Does not touch the driver; that happens in `init`.
    pub fn new() -> Self {
        Self {
            fork_probe: ForkProbe::new(),
            devices: OnceLock::new(),
            events: Mutex::new(HashMap::new()),
            next_event: AtomicU64::new(1),
        }
    }

    fn devices(&self) -> Result<&[Mutex<DeviceState>]> {
        self.devices
            .get()
            .map(Vec::as_slice)
            .ok_or(AccelError::backend("device lookup", "CUDA runtime is not initialized"))
    }

    fn state(&self, index: DeviceIndex) -> Result<MutexGuard<'_, DeviceState>> {
        let index = if index == NO_DEVICE {
            selected_device()
        } else {
            index
        };
        let devices = self.devices()?;
        usize::try_from(index)
            .ok()
            .and_then(|i| devices.get(i))
            .map(lock)
            .ok_or_else(|| AccelError::backend("device lookup", format!("invalid device ordinal {}", index)))
    }

    fn raw_stream(&self, stream: &Stream) -> Result<sys::CUstream> {
        if stream.device_type != DeviceType::Cuda {
            return Err(AccelError::backend("stream lookup", format!("not a CUDA stream: {}", stream)));
        }
        let state = self.state(stream.device_index)?;
        match stream.stream_id {
            0 => Ok(std::ptr::null_mut()),
            id if id > 0 && (id as usize) <= state.pool.len() => Ok(state.pool[id as usize - 1].0),
            id => Err(AccelError::backend("stream lookup", format!("unknown stream id {}", id))),
        }
    }

    fn raw_event(&self, event: EventId) -> Result<sys::CUevent> {
        lock(&self.events)
            .get(&event)
            .map(|e| e.0)
            .ok_or_else(|| AccelError::backend("event lookup", format!("unknown event {}", event)))
    }

    fn make_current(&self, index: DeviceIndex) -> Result<()> {
        let state = self.state(index)?;
        unsafe { result::ctx::set_current(state.context.0).map_err(driver("cuCtxSetCurrent")) }
    }

    /// Binds device 0's context on threads that have not selected a device yet.
    fn thread_device(&self) -> Result<DeviceIndex> {
        CURRENT_DEVICE.with(|slot| bind_once(slot, 0, |index| self.make_current(index)))
    }
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("initialized", &self.devices.get().is_some())
            .field("device_count", &self.devices.get().map(Vec::len))
            .finish()
    }
}

impl Backend for CudaBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn is_compiled(&self) -> bool {
        true
    }

    fn is_in_bad_fork(&self) -> bool {
        self.fork_probe.is_in_bad_fork()
    }

    fn init(&self) -> Result<()> {
        result::init().map_err(driver("cuInit"))?;
        let count = result::device::get_count().map_err(driver("cuDeviceGetCount"))?;

        let mut states = Vec::with_capacity(count.max(0) as usize);
        for ordinal in 0..count {
            let device = result::device::get(ordinal).map_err(driver("cuDeviceGet"))?;
            let context = unsafe { result::primary_ctx::retain(device) }
                .map_err(driver("cuDevicePrimaryCtxRetain"))?;
            unsafe { result::ctx::set_current(context).map_err(driver("cuCtxSetCurrent"))? };
            let pool = (0..POOL_SIZE)
                .map(|_| {
                    result::stream::create(result::stream::StreamKind::NonBlocking)
                        .map(RawHandle)
                        .map_err(driver("cuStreamCreate"))
                })
                .collect::<Result<Vec<_>>>()?;
            states.push(Mutex::new(DeviceState {
                device,
                context: RawHandle(context),
                pool,
                cursor: AtomicUsize::new(0),
            }));
        }

        if self.devices.set(states).is_err() {
            log::warn!("CUDA backend initialized twice; keeping the first device table");
        }
        if count > 0 {
            self.set_device(0)?;
        }
        self.fork_probe.mark_initialized();
        log::info!("CUDA driver initialized with {} device(s)", count);
        Ok(())
    }

    fn device_count(&self) -> Result<usize> {
        if let Some(devices) = self.devices.get() {
            return Ok(devices.len());
        }
        result::init().map_err(driver("cuInit"))?;
        let count = result::device::get_count().map_err(driver("cuDeviceGetCount"))?;
        Ok(count.max(0) as usize)
    }

    fn current_device(&self) -> Result<DeviceIndex> {
        if self.devices.get().is_none() {
            return Ok(selected_device());
        }
        self.thread_device()
    }

    fn set_device(&self, index: DeviceIndex) -> Result<()> {
        self.make_current(index)?;
        CURRENT_DEVICE.with(|d| d.set(Some(index)));
        Ok(())
    }

    fn maybe_exchange_device(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        if index < 0 {
            return Ok(NO_DEVICE);
        }
        // No primary contexts retained yet, so there is nothing to restore.
        if self.devices.get().is_none() {
            return Ok(selected_device());
        }
        self.exchange_device(index)
    }

    fn device_properties(&self, index: DeviceIndex) -> Result<DeviceProperties> {
        let state = self.state(index)?;
        let device = state.device;
        let attr = |a: sys::CUdevice_attribute| {
            unsafe { result::device::get_attribute(device, a).map_err(driver("cuDeviceGetAttribute")) }
        };

        let mut name_buf = [0 as c_char; 256];
        unsafe {
            sys::cuDeviceGetName(name_buf.as_mut_ptr(), name_buf.len() as i32, device)
                .result()
                .map_err(driver("cuDeviceGetName"))?;
        }
        let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let total_memory = unsafe { result::device::total_mem(device) }.map_err(driver("cuDeviceTotalMem"))?;
        let max_threads = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?;
        let warp_size = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE)?.max(1);
        let sm_count = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let major = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = attr(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;

        Ok(DeviceProperties {
            device_index: index,
            name,
            platform_name: "NVIDIA CUDA".to_string(),
            driver_version: format!("sm_{}{}", major, minor),
            total_memory,
            max_compute_units: sm_count.max(0) as u32,
            max_work_group_size: max_threads.max(0) as usize,
            max_num_sub_groups: (max_threads / warp_size).max(0) as u32,
            sub_group_sizes: vec![warp_size as usize],
            has_fp16: major >= 6 || (major == 5 && minor >= 3),
            has_fp64: true,
        })
    }

    fn current_stream(&self, index: DeviceIndex) -> Result<Stream> {
        let index = if index == NO_DEVICE {
            selected_device()
        } else {
            index
        };
        self.state(index)?;
        let stream_id = CURRENT_STREAMS.with(|s| s.borrow().get(&index).copied().unwrap_or(0));
        Ok(Stream::new(stream_id, index, DeviceType::Cuda))
    }

    fn set_stream(&self, stream: &Stream) -> Result<()> {
        self.raw_stream(stream)?;
        if CURRENT_DEVICE.with(Cell::get) != Some(stream.device_index) {
            self.set_device(stream.device_index)?;
        }
        CURRENT_STREAMS.with(|s| {
            s.borrow_mut().insert(stream.device_index, stream.stream_id);
        });
        Ok(())
    }

    fn stream_from_pool(&self, index: DeviceIndex, high_priority: bool) -> Result<Stream> {
        let state = self.state(index)?;
        if high_priority {
            log::debug!("CUDA stream pool has no priority classes; using a regular stream");
        }
        let slot = state.cursor.fetch_add(1, Ordering::Relaxed) % state.pool.len().max(1);
        let device_index = if index == NO_DEVICE {
            selected_device()
        } else {
            index
        };
        Ok(Stream::new(slot as i64 + 1, device_index, DeviceType::Cuda))
    }

    fn synchronize(&self, index: DeviceIndex) -> Result<()> {
        let previous = self.thread_device()?;
        let target = if index == NO_DEVICE { previous } else { index };
        self.make_current(target)?;
        let synced = result::ctx::synchronize().map_err(driver("cuCtxSynchronize"));
        self.make_current(previous)?;
        synced
    }

    fn stream_query(&self, stream: &Stream) -> Result<bool> {
        self.thread_device()?;
        let raw = self.raw_stream(stream)?;
        match unsafe { sys::cuStreamQuery(raw) } {
            sys::CUresult::CUDA_SUCCESS => Ok(true),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(AccelError::backend("cuStreamQuery", format!("{:?}", other))),
        }
    }

    fn stream_synchronize(&self, stream: &Stream) -> Result<()> {
        self.thread_device()?;
        let raw = self.raw_stream(stream)?;
        unsafe { result::stream::synchronize(raw).map_err(driver("cuStreamSynchronize")) }
    }

    fn create_event(&self, enable_timing: bool) -> Result<EventId> {
        self.thread_device()?;
        let flags = if enable_timing {
            sys::CUevent_flags::CU_EVENT_DEFAULT
        } else {
            sys::CUevent_flags::CU_EVENT_DISABLE_TIMING
        };
        let raw = result::event::create(flags).map_err(driver("cuEventCreate"))?;
        let id = self.next_event.fetch_add(1, Ordering::Relaxed);
        lock(&self.events).insert(id, RawHandle(raw));
        Ok(id)
    }

    fn record_event(&self, event: EventId, stream: &Stream) -> Result<()> {
        self.thread_device()?;
        let (raw_event, raw_stream) = (self.raw_event(event)?, self.raw_stream(stream)?);
        unsafe { result::event::record(raw_event, raw_stream).map_err(driver("cuEventRecord")) }
    }

    fn event_query(&self, event: EventId) -> Result<bool> {
        self.thread_device()?;
        let raw = self.raw_event(event)?;
        match unsafe { sys::cuEventQuery(raw) } {
            sys::CUresult::CUDA_SUCCESS => Ok(true),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(AccelError::backend("cuEventQuery", format!("{:?}", other))),
        }
    }

    fn event_synchronize(&self, event: EventId) -> Result<()> {
        self.thread_device()?;
        let raw = self.raw_event(event)?;
        let synced = unsafe { sys::cuEventSynchronize(raw) }.result();
        synced.map_err(driver("cuEventSynchronize"))
    }

    fn stream_wait_event(&self, stream: &Stream, event: EventId) -> Result<()> {
        self.thread_device()?;
        let (raw_stream, raw_event) = (self.raw_stream(stream)?, self.raw_event(event)?);
        unsafe {
            result::stream::wait_event(
                raw_stream,
                raw_event,
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
            .map_err(driver("cuStreamWaitEvent"))
        }
    }

    fn event_elapsed_ms(&self, start: EventId, end: EventId) -> Result<f32> {
        self.thread_device()?;
        let (start, end) = (self.raw_event(start)?, self.raw_event(end)?);
        unsafe { result::event::elapsed(start, end).map_err(driver("cuEventElapsedTime")) }
    }

    fn destroy_event(&self, event: EventId) {
        if let Err(e) = self.thread_device() {
            log::warn!("cannot destroy CUDA event {} without a context: {}", event, e);
            return;
        }
        if let Some(raw) = lock(&self.events).remove(&event) {
            if let Err(e) = unsafe { result::event::destroy(raw.0) } {
                log::warn!("failed to destroy CUDA event {}: {:?}", event, e);
            }
        }
    }
}
