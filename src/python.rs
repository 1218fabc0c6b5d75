// src/python.rs - Python module for the host ML framework
use crate::device::{Device, DeviceRef, DeviceType};
use crate::error::AccelError;
use crate::guard::{DeviceGuard, StreamGuard};
use crate::properties::DeviceProperties;
use crate::stream::{Event, Stream};
use pyo3::exceptions::{
    PyAssertionError, PyNotImplementedError, PyRuntimeError, PyTypeError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict};

impl From<AccelError> for PyErr {
    fn from(err: AccelError) -> PyErr {
        let msg = err.to_string();
        match err {
            AccelError::NotCompiled { .. } => PyNotImplementedError::new_err(msg),
            AccelError::InvalidArgument(_) => PyValueError::new_err(msg),
            AccelError::InvalidDevice { .. } => PyAssertionError::new_err(msg),
            AccelError::BadFork { .. } | AccelError::Backend { .. } => PyRuntimeError::new_err(msg),
        }
    }
}

/// Device argument as Python passes it: `None`, an `int`, a `str` such as
/// `"cuda:1"`, or a device object with `type` and `index` attributes.
pub struct PyDeviceArg(DeviceRef);

impl<'source> FromPyObject<'source> for PyDeviceArg {
    fn extract(ob: &'source PyAny) -> PyResult<Self> {
        if ob.is_none() {
            return Ok(PyDeviceArg(DeviceRef::Absent));
        }
        if ob.is_instance_of::<PyBool>() {
            return Err(PyTypeError::new_err("expected a device index, got bool"));
        }
        if let Ok(index) = ob.extract::<i64>() {
            return Ok(PyDeviceArg(DeviceRef::Index(index)));
        }
        if let Ok(name) = ob.extract::<String>() {
            return Ok(PyDeviceArg(DeviceRef::Named(name)));
        }
        if let (Ok(kind), Ok(index)) = (ob.getattr("type"), ob.getattr("index")) {
            let kind: DeviceType = kind.extract::<String>()?.parse()?;
            let index: Option<i32> = index.extract()?;
            return Ok(PyDeviceArg(DeviceRef::Handle(Device { kind, index })));
        }
        Err(PyTypeError::new_err(format!(
            "expected None, int, str or device, got {}",
            ob.get_type().name()?
        )))
    }
}

fn arg(device: Option<PyDeviceArg>) -> DeviceRef {
    device.map(|d| d.0).unwrap_or_default()
}

#[pyclass(name = "Stream", frozen)]
#[derive(Clone)]
pub struct PyStream {
    inner: Stream,
}

#[pymethods]
impl PyStream {
    /// Takes a stream from the runtime's pool; negative priority means high priority.
    #[new]
    #[pyo3(signature = (device = None, priority = 0))]
    fn new(device: Option<PyDeviceArg>, priority: i32) -> PyResult<Self> {
        let inner = crate::runtime().get_stream_from_pool(arg(device), priority < 0)?;
        Ok(PyStream { inner })
    }

    #[getter]
    fn stream_id(&self) -> i64 {
        self.inner.stream_id
    }

    #[getter]
    fn device_index(&self) -> i32 {
        self.inner.device_index
    }

    #[getter]
    fn device_type(&self) -> i32 {
        self.inner.device_type.code()
    }

    #[getter]
    fn device(&self) -> String {
        self.inner.device().to_string()
    }

    fn query(&self) -> PyResult<bool> {
        Ok(self.inner.query(crate::runtime())?)
    }

    fn synchronize(&self) -> PyResult<()> {
        Ok(self.inner.synchronize(crate::runtime())?)
    }

    fn wait_stream(&self, other: PyRef<'_, PyStream>) -> PyResult<()> {
        Ok(self.inner.wait_stream(crate::runtime(), &other.inner)?)
    }

    fn wait_event(&self, event: PyRef<'_, PyEvent>) -> PyResult<()> {
        Ok(self.inner.wait_event(crate::runtime(), &event.inner)?)
    }

    /// Records `event` (or a new untimed one) on this stream and returns it.
    #[pyo3(signature = (event = None))]
    fn record_event(&self, py: Python<'_>, event: Option<Py<PyEvent>>) -> PyResult<Py<PyEvent>> {
        let event = match event {
            Some(event) => event,
            None => Py::new(py, PyEvent::create(false)?)?,
        };
        event.borrow(py).inner.record(crate::runtime(), &self.inner)?;
        Ok(event)
    }

    fn __eq__(&self, other: PyRef<'_, PyStream>) -> bool {
        self.inner == other.inner
    }

    fn __hash__(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.inner.hash(&mut hasher);
        hasher.finish()
    }

    fn __repr__(&self) -> String {
        self.inner.to_string()
    }
}

#[pyclass(name = "Event")]
pub struct PyEvent {
    inner: Event,
}

impl PyEvent {
    fn create(enable_timing: bool) -> PyResult<Self> {
        Ok(PyEvent {
            inner: crate::runtime().create_event(enable_timing)?,
        })
    }
}

fn stream_or_current(stream: Option<PyRef<'_, PyStream>>) -> PyResult<Stream> {
    match stream {
        Some(stream) => Ok(stream.inner),
        None => Ok(crate::current_stream(())?),
    }
}

#[pymethods]
impl PyEvent {
    #[new]
    #[pyo3(signature = (enable_timing = false))]
    fn new(enable_timing: bool) -> PyResult<Self> {
        Self::create(enable_timing)
    }

    #[getter]
    fn enable_timing(&self) -> bool {
        self.inner.enable_timing()
    }

    /// Records on `stream`, or on the current stream.
    #[pyo3(signature = (stream = None))]
    fn record(&self, stream: Option<PyRef<'_, PyStream>>) -> PyResult<()> {
        let stream = stream_or_current(stream)?;
        Ok(self.inner.record(crate::runtime(), &stream)?)
    }

    #[pyo3(signature = (stream = None))]
    fn wait(&self, stream: Option<PyRef<'_, PyStream>>) -> PyResult<()> {
        let stream = stream_or_current(stream)?;
        Ok(self.inner.wait(crate::runtime(), &stream)?)
    }

    fn query(&self) -> PyResult<bool> {
        Ok(self.inner.query(crate::runtime())?)
    }

    fn synchronize(&self) -> PyResult<()> {
        Ok(self.inner.synchronize(crate::runtime())?)
    }

    fn elapsed_time(&self, end: PyRef<'_, PyEvent>) -> PyResult<f32> {
        Ok(self.inner.elapsed_time(crate::runtime(), &end.inner)?)
    }

    fn __repr__(&self) -> String {
        format!("Event(id={}, enable_timing={})", self.inner.id(), self.inner.enable_timing())
    }
}

#[pyclass(name = "DeviceProperties", frozen)]
pub struct PyDeviceProperties {
    #[pyo3(get)]
    name: String,
    #[pyo3(get)]
    platform_name: String,
    #[pyo3(get)]
    driver_version: String,
    #[pyo3(get)]
    total_memory: usize,
    #[pyo3(get)]
    max_compute_units: u32,
    #[pyo3(get)]
    max_work_group_size: usize,
    #[pyo3(get)]
    max_num_sub_groups: u32,
    #[pyo3(get)]
    sub_group_sizes: Vec<usize>,
    #[pyo3(get)]
    has_fp16: bool,
    #[pyo3(get)]
    has_fp64: bool,
}

impl From<DeviceProperties> for PyDeviceProperties {
    fn from(p: DeviceProperties) -> Self {
        PyDeviceProperties {
            name: p.name,
            platform_name: p.platform_name,
            driver_version: p.driver_version,
            total_memory: p.total_memory,
            max_compute_units: p.max_compute_units,
            max_work_group_size: p.max_work_group_size,
            max_num_sub_groups: p.max_num_sub_groups,
            sub_group_sizes: p.sub_group_sizes,
            has_fp16: p.has_fp16,
            has_fp64: p.has_fp64,
        }
    }
}

#[pymethods]
impl PyDeviceProperties {
    fn __repr__(&self) -> String {
        format!(
            "DeviceProperties(name='{}', total_memory={}MB, max_compute_units={})",
            self.name,
            self.total_memory / 1024 / 1024,
            self.max_compute_units
        )
    }
}

/// Context manager that changes the selected device.
#[pyclass(name = "device", unsendable)]
pub struct PyDeviceContext {
    device: DeviceRef,
    guard: Option<DeviceGuard<'static>>,
}

#[pymethods]
impl PyDeviceContext {
    #[new]
    #[pyo3(signature = (device = None))]
    fn new(device: Option<PyDeviceArg>) -> Self {
        PyDeviceContext {
            device: arg(device),
            guard: None,
        }
    }

    #[getter]
    fn idx(&self) -> PyResult<i32> {
        Ok(self.device.resolve(crate::runtime().device_type(), true)?)
    }

    fn __enter__(&mut self) -> PyResult<()> {
        self.guard = Some(crate::device(self.device.clone())?);
        Ok(())
    }

    fn __exit__(&mut self, _ty: &PyAny, _value: &PyAny, _traceback: &PyAny) -> bool {
        self.guard.take();
        false
    }
}

/// Context manager that selects a given stream. A no-op for `None`.
#[pyclass(name = "StreamContext", unsendable)]
pub struct PyStreamContext {
    stream: Option<Stream>,
    guard: Option<StreamGuard<'static>>,
}

#[pymethods]
impl PyStreamContext {
    #[new]
    fn new(stream: Option<PyStream>) -> Self {
        PyStreamContext {
            stream: stream.map(|s| s.inner),
            guard: None,
        }
    }

    fn __enter__(&mut self) -> PyResult<()> {
        self.guard = Some(crate::stream(self.stream.as_ref())?);
        Ok(())
    }

    fn __exit__(&mut self, _ty: &PyAny, _value: &PyAny, _traceback: &PyAny) -> bool {
        self.guard.take();
        false
    }
}

/// Device context for the device `obj` lives on; a no-op for objects that
/// are not on this backend.
#[pyfunction]
fn device_of(obj: &PyAny) -> PyResult<PyDeviceContext> {
    let flag = format!("is_{}", crate::runtime().device_type().as_str());
    let on_device = match obj.getattr(flag.as_str()) {
        Ok(value) => value.is_true()?,
        Err(_) => false,
    };
    let index: i64 = if on_device {
        obj.call_method0("get_device")?.extract()?
    } else {
        -1
    };
    Ok(PyDeviceContext::new(Some(PyDeviceArg(DeviceRef::Index(index)))))
}

#[pyfunction]
fn init() -> PyResult<()> {
    Ok(crate::init()?)
}

#[pyfunction]
fn is_available() -> bool {
    crate::is_available()
}

#[pyfunction]
fn is_initialized() -> bool {
    crate::is_initialized()
}

#[pyfunction]
fn is_bf16_supported() -> bool {
    crate::is_bf16_supported()
}

#[pyfunction]
fn device_count() -> usize {
    crate::device_count()
}

#[pyfunction]
fn current_device() -> PyResult<i32> {
    Ok(crate::current_device()?)
}

#[pyfunction]
fn set_device(device: PyDeviceArg) -> PyResult<()> {
    Ok(crate::set_device(device.0)?)
}

#[pyfunction]
#[pyo3(signature = (device = None))]
fn get_device_name(device: Option<PyDeviceArg>) -> PyResult<String> {
    Ok(crate::get_device_name(arg(device))?)
}

#[pyfunction]
#[pyo3(signature = (device = None))]
fn get_device_capability(py: Python<'_>, device: Option<PyDeviceArg>) -> PyResult<PyObject> {
    let cap = crate::get_device_capability(arg(device))?;
    let dict = PyDict::new(py);
    dict.set_item("max_work_group_size", cap.max_work_group_size)?;
    dict.set_item("max_num_sub_groups", cap.max_num_sub_groups)?;
    dict.set_item("sub_group_sizes", cap.sub_group_sizes)?;
    Ok(dict.to_object(py))
}

#[pyfunction]
#[pyo3(signature = (device = None))]
fn get_device_properties(device: Option<PyDeviceArg>) -> PyResult<PyDeviceProperties> {
    Ok(crate::get_device_properties(arg(device))?.into())
}

#[pyfunction]
#[pyo3(signature = (device = None))]
fn current_stream(device: Option<PyDeviceArg>) -> PyResult<PyStream> {
    Ok(PyStream {
        inner: crate::current_stream(arg(device))?,
    })
}

#[pyfunction]
fn set_stream(stream: Option<PyStream>) -> PyResult<()> {
    Ok(crate::set_stream(stream.as_ref().map(|s| &s.inner))?)
}

#[pyfunction]
fn stream(stream: Option<PyStream>) -> PyStreamContext {
    PyStreamContext::new(stream)
}

#[pyfunction]
#[pyo3(signature = (device = None))]
fn synchronize(py: Python<'_>, device: Option<PyDeviceArg>) -> PyResult<()> {
    let device = arg(device);
    // Synchronize can block for a long time; let other Python threads run.
    Ok(py.allow_threads(move || crate::synchronize(device))?)
}

#[pyfunction]
fn _exchange_device(index: i32) -> PyResult<i32> {
    Ok(crate::runtime().exchange_device(index)?)
}

#[pyfunction]
fn _maybe_exchange_device(index: i32) -> PyResult<i32> {
    Ok(crate::runtime().maybe_exchange_device(index)?)
}

#[pymodule]
fn accel_ctx(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyStream>()?;
    m.add_class::<PyEvent>()?;
    m.add_class::<PyDeviceProperties>()?;
    m.add_class::<PyDeviceContext>()?;
    m.add_class::<PyStreamContext>()?;
    m.add_function(wrap_pyfunction!(init, m)?)?;
    m.add_function(wrap_pyfunction!(is_available, m)?)?;
    m.add_function(wrap_pyfunction!(is_initialized, m)?)?;
    m.add_function(wrap_pyfunction!(is_bf16_supported, m)?)?;
    m.add_function(wrap_pyfunction!(device_count, m)?)?;
    m.add_function(wrap_pyfunction!(current_device, m)?)?;
    m.add_function(wrap_pyfunction!(set_device, m)?)?;
    m.add_function(wrap_pyfunction!(get_device_name, m)?)?;
    m.add_function(wrap_pyfunction!(get_device_capability, m)?)?;
    m.add_function(wrap_pyfunction!(get_device_properties, m)?)?;
    m.add_function(wrap_pyfunction!(current_stream, m)?)?;
    m.add_function(wrap_pyfunction!(set_stream, m)?)?;
    m.add_function(wrap_pyfunction!(stream, m)?)?;
    m.add_function(wrap_pyfunction!(device_of, m)?)?;
    m.add_function(wrap_pyfunction!(synchronize, m)?)?;
    m.add_function(wrap_pyfunction!(_exchange_device, m)?)?;
    m.add_function(wrap_pyfunction!(_maybe_exchange_device, m)?)?;
    m.add("has_half", crate::HAS_HALF)?;
    m.add("device_type", crate::runtime().device_type().as_str())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(py: Python<'_>, expr: &str) -> PyResult<DeviceRef> {
        Ok(py.eval(expr, None, None)?.extract::<PyDeviceArg>()?.0)
    }

    #[test]
    fn test_device_arg_extraction() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            assert_eq!(extract(py, "None").unwrap(), DeviceRef::Absent);
            assert_eq!(extract(py, "1").unwrap(), DeviceRef::Index(1));
            assert_eq!(extract(py, "'cuda:1'").unwrap(), DeviceRef::Named("cuda:1".to_string()));
            assert!(extract(py, "True").unwrap_err().is_instance_of::<PyTypeError>(py));
            assert!(extract(py, "1.5").is_err());
        });
    }

    #[test]
    fn test_device_of_reads_object_device() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let kind = crate::runtime().device_type().as_str();
            let on = py
                .eval(
                    &format!("type('T', (), {{'is_{}': True, 'get_device': lambda self: 1}})()", kind),
                    None,
                    None,
                )
                .unwrap();
            assert_eq!(device_of(on).unwrap().device, DeviceRef::Index(1));

            let off = py.eval("object()", None, None).unwrap();
            assert_eq!(device_of(off).unwrap().device, DeviceRef::Index(-1));
        });
    }
}
