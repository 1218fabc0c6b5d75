// src/backend/sim.rs - In-process runtime with virtual devices
use super::{Backend, EventId, ForkProbe};
use crate::device::{DeviceIndex, DeviceType, NO_DEVICE};
use crate::error::{AccelError, Result};
use crate::properties::DeviceProperties;
use crate::stream::Stream;
use crossbeam::queue::SegQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Pooled streams per device and priority. Stream id 0 is the default stream.
pub const SIM_POOL_SIZE: i64 = 32;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub kind: DeviceType,
    pub device_count: usize,
    pub device_name: String,
    pub total_memory: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            kind: DeviceType::Sim,
            device_count: 2,
            device_name: "Sim Accelerator".to_string(),
            total_memory: 16 * 1024 * 1024 * 1024,
        }
    }
}

/// One entry of the simulated runtime's call log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeCall {
    Init,
    DeviceCount,
    GetDevice,
    SetDevice(DeviceIndex),
    Properties(DeviceIndex),
    GetStream(DeviceIndex),
    SetStream(Stream),
    StreamFromPool(DeviceIndex),
    Synchronize(DeviceIndex),
    StreamQuery(Stream),
    StreamSynchronize(Stream),
    CreateEvent,
    RecordEvent(EventId),
    EventQuery(EventId),
    EventSynchronize(EventId),
    WaitEvent(EventId),
    ElapsedTime(EventId, EventId),
    DestroyEvent(EventId),
}

#[derive(Debug, Default)]
struct ThreadSelection {
    device: DeviceIndex,
    streams: HashMap<DeviceIndex, i64>,
}

#[derive(Debug)]
struct SimEvent {
    enable_timing: bool,
    recorded_at: Option<Instant>,
}

/// Virtual devices that complete all work instantly.
///
/// Selection state follows the native runtimes it stands in for: every thread
/// starts on device 0 with the default stream selected on each device.
#[derive(Debug)]
pub struct SimBackend {
    config: SimConfig,
    init_calls: AtomicUsize,
    init_failure: Mutex<Option<String>>,
    forked: AtomicBool,
    fork_probe: ForkProbe,
    threads: Mutex<HashMap<ThreadId, ThreadSelection>>,
    pool_cursors: Vec<AtomicUsize>,
    events: Mutex<HashMap<EventId, SimEvent>>,
    next_event: AtomicU64,
    calls: SegQueue<NativeCall>,
    call_count: AtomicUsize,
}

fn unknown_event(event: EventId) -> AccelError {
    AccelError::backend("event lookup", format!("unknown event {}", event))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBackend {
    pub fn new(config: SimConfig) -> Self {
        let pool_cursors = (0..config.device_count * 2)
            .map(|_| AtomicUsize::new(0))
            .collect();
        Self {
            config,
            init_calls: AtomicUsize::new(0),
            init_failure: Mutex::new(None),
            forked: AtomicBool::new(false),
            fork_probe: ForkProbe::new(),
            threads: Mutex::new(HashMap::new()),
            pool_cursors,
            events: Mutex::new(HashMap::new()),
            next_event: AtomicU64::new(1),
            calls: SegQueue::new(),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn with_devices(device_count: usize) -> Self {
        Self::new(SimConfig {
            device_count,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Number of times `init` reached the simulated runtime.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Behave like a child process forked after initialization.
    pub fn simulate_fork(&self) {
        self.forked.store(true, Ordering::SeqCst);
    }

    /// The next `init` fails with `message` instead of succeeding.
    pub fn fail_next_init(&self, message: impl Into<String>) {
        *lock(&self.init_failure) = Some(message.into());
    }

    /// Total native calls made so far, excluding probes.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Removes and returns the logged native calls in call order.
    pub fn drain_calls(&self) -> Vec<NativeCall> {
        let mut calls = Vec::with_capacity(self.calls.len());
        while let Some(call) = self.calls.pop() {
            calls.push(call);
        }
        calls
    }

    fn log(&self, call: NativeCall) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.push(call);
    }

    fn with_thread<R>(&self, f: impl FnOnce(&mut ThreadSelection) -> R) -> R {
        let mut threads = lock(&self.threads);
        f(threads.entry(thread::current().id()).or_default())
    }

    fn check_device(&self, index: DeviceIndex) -> Result<DeviceIndex> {
        let index = if index == NO_DEVICE {
            self.with_thread(|sel| sel.device)
        } else {
            index
        };
        if index < 0 || index as usize >= self.config.device_count {
            return Err(AccelError::backend(
                "device lookup",
                format!("invalid device ordinal {}", index),
            ));
        }
        Ok(index)
    }

    fn check_stream(&self, stream: &Stream) -> Result<()> {
        if stream.device_type != self.config.kind {
            return Err(AccelError::backend(
                "stream lookup",
                format!("stream belongs to a {} device", stream.device_type),
            ));
        }
        self.check_device(stream.device_index)?;
        if !(0..=2 * SIM_POOL_SIZE).contains(&stream.stream_id) {
            return Err(AccelError::backend(
                "stream lookup",
                format!("unknown stream id {}", stream.stream_id),
            ));
        }
        Ok(())
    }

    fn with_event<R>(&self, event: EventId, f: impl FnOnce(&mut SimEvent) -> R) -> Result<R> {
        let mut events = lock(&self.events);
        events
            .get_mut(&event)
            .map(f)
            .ok_or_else(|| unknown_event(event))
    }
}

impl Backend for SimBackend {
    fn device_type(&self) -> DeviceType {
        self.config.kind
    }

    fn is_compiled(&self) -> bool {
        true
    }

    fn is_in_bad_fork(&self) -> bool {
        (self.forked.load(Ordering::SeqCst) && self.init_calls() > 0)
            || self.fork_probe.is_in_bad_fork()
    }

    fn init(&self) -> Result<()> {
        self.log(NativeCall::Init);
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.init_failure).take() {
            return Err(AccelError::backend("init", message));
        }
        self.fork_probe.mark_initialized();
        log::debug!(
            "sim runtime initialized with {} {} device(s)",
            self.config.device_count,
            self.config.kind
        );
        Ok(())
    }

    fn device_count(&self) -> Result<usize> {
        self.log(NativeCall::DeviceCount);
        Ok(self.config.device_count)
    }

    fn current_device(&self) -> Result<DeviceIndex> {
        self.log(NativeCall::GetDevice);
        Ok(self.with_thread(|sel| sel.device))
    }

    fn set_device(&self, index: DeviceIndex) -> Result<()> {
        self.log(NativeCall::SetDevice(index));
        let index = self.check_device(index)?;
        self.with_thread(|sel| sel.device = index);
        Ok(())
    }

    fn device_properties(&self, index: DeviceIndex) -> Result<DeviceProperties> {
        self.log(NativeCall::Properties(index));
        let index = self.check_device(index)?;
        Ok(DeviceProperties {
            device_index: index,
            name: self.config.device_name.clone(),
            platform_name: "accel_ctx simulator".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            total_memory: self.config.total_memory,
            max_compute_units: 64,
            max_work_group_size: 1024,
            max_num_sub_groups: 64,
            sub_group_sizes: vec![8, 16, 32],
            has_fp16: true,
            has_fp64: true,
        })
    }

    fn current_stream(&self, index: DeviceIndex) -> Result<Stream> {
        self.log(NativeCall::GetStream(index));
        let index = self.check_device(index)?;
        let stream_id = self.with_thread(|sel| sel.streams.get(&index).copied().unwrap_or(0));
        Ok(Stream::new(stream_id, index, self.config.kind))
    }

    fn set_stream(&self, stream: &Stream) -> Result<()> {
        self.log(NativeCall::SetStream(*stream));
        self.check_stream(stream)?;
        self.with_thread(|sel| {
            sel.device = stream.device_index;
            sel.streams.insert(stream.device_index, stream.stream_id);
        });
        Ok(())
    }

    fn stream_from_pool(&self, index: DeviceIndex, high_priority: bool) -> Result<Stream> {
        self.log(NativeCall::StreamFromPool(index));
        let index = self.check_device(index)?;
        let slot = index as usize * 2 + usize::from(high_priority);
        let cursor = self.pool_cursors[slot].fetch_add(1, Ordering::Relaxed) as i64;
        let offset = if high_priority { SIM_POOL_SIZE } else { 0 };
        let stream_id = offset + cursor % SIM_POOL_SIZE + 1;
        Ok(Stream::new(stream_id, index, self.config.kind))
    }

    fn synchronize(&self, index: DeviceIndex) -> Result<()> {
        self.log(NativeCall::Synchronize(index));
        self.check_device(index)?;
        Ok(())
    }

    fn stream_query(&self, stream: &Stream) -> Result<bool> {
        self.log(NativeCall::StreamQuery(*stream));
        self.check_stream(stream)?;
        Ok(true)
    }

    fn stream_synchronize(&self, stream: &Stream) -> Result<()> {
        self.log(NativeCall::StreamSynchronize(*stream));
        self.check_stream(stream)
    }

    fn create_event(&self, enable_timing: bool) -> Result<EventId> {
        self.log(NativeCall::CreateEvent);
        let id = self.next_event.fetch_add(1, Ordering::Relaxed);
        lock(&self.events).insert(
            id,
            SimEvent {
                enable_timing,
                recorded_at: None,
            },
        );
        Ok(id)
    }

    fn record_event(&self, event: EventId, stream: &Stream) -> Result<()> {
        self.log(NativeCall::RecordEvent(event));
        self.check_stream(stream)?;
        self.with_event(event, |ev| ev.recorded_at = Some(Instant::now()))
    }

    fn event_query(&self, event: EventId) -> Result<bool> {
        self.log(NativeCall::EventQuery(event));
        self.with_event(event, |_| true)
    }

    fn event_synchronize(&self, event: EventId) -> Result<()> {
        self.log(NativeCall::EventSynchronize(event));
        self.with_event(event, |_| ())
    }

    fn stream_wait_event(&self, stream: &Stream, event: EventId) -> Result<()> {
        self.log(NativeCall::WaitEvent(event));
        self.check_stream(stream)?;
        self.with_event(event, |_| ())
    }

    fn event_elapsed_ms(&self, start: EventId, end: EventId) -> Result<f32> {
        self.log(NativeCall::ElapsedTime(start, end));
        let events = lock(&self.events);
        let first = events.get(&start).ok_or_else(|| unknown_event(start))?;
        let second = events.get(&end).ok_or_else(|| unknown_event(end))?;
        if !first.enable_timing || !second.enable_timing {
            return Err(AccelError::backend(
                "elapsed time",
                "both events must be created with timing enabled",
            ));
        }
        match (first.recorded_at, second.recorded_at) {
            (Some(a), Some(b)) => {
                let ms = if b >= a {
                    b.duration_since(a).as_secs_f64() * 1e3
                } else {
                    -(a.duration_since(b).as_secs_f64() * 1e3)
                };
                Ok(ms as f32)
            }
            _ => Err(AccelError::backend(
                "elapsed time",
                "both events must be recorded first",
            )),
        }
    }

    fn destroy_event(&self, event: EventId) {
        self.log(NativeCall::DestroyEvent(event));
        lock(&self.events).remove(&event);
    }
}
