// src/ffi.rs - C FFI bindings for the host framework
//! Every exported function works on the process-wide runtime and returns one
//! of the `ACCEL_*` status codes; results are written through out-pointers.
//! A negative device index means "the current device".
use crate::device::{DeviceIndex, DeviceRef, DeviceType};
use crate::error::AccelError;
use crate::runtime::Runtime;
use crate::stream::Stream;
use std::ffi::c_char;

pub const ACCEL_SUCCESS: i32 = 0;
pub const ACCEL_ERROR_NOT_COMPILED: i32 = -1;
pub const ACCEL_ERROR_INVALID_ARGUMENT: i32 = -2;
pub const ACCEL_ERROR_INVALID_DEVICE: i32 = -3;
pub const ACCEL_ERROR_BAD_FORK: i32 = -4;
pub const ACCEL_ERROR_BACKEND: i32 = -5;

pub fn error_code(err: &AccelError) -> i32 {
    match err {
        AccelError::NotCompiled { .. } => ACCEL_ERROR_NOT_COMPILED,
        AccelError::InvalidArgument(_) => ACCEL_ERROR_INVALID_ARGUMENT,
        AccelError::InvalidDevice { .. } => ACCEL_ERROR_INVALID_DEVICE,
        AccelError::BadFork { .. } => ACCEL_ERROR_BAD_FORK,
        AccelError::Backend { .. } => ACCEL_ERROR_BACKEND,
    }
}

fn status(result: crate::Result<()>) -> i32 {
    match result {
        Ok(()) => ACCEL_SUCCESS,
        Err(e) => {
            log::debug!("FFI call failed: {}", e);
            error_code(&e)
        }
    }
}

fn device_arg(index: i32) -> DeviceRef {
    if index < 0 {
        DeviceRef::Absent
    } else {
        DeviceRef::from(index)
    }
}

fn write_name(name: &str, buf: *mut c_char, len: usize) -> i32 {
    if buf.is_null() || len == 0 {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    }
    let bytes = name.as_bytes();
    let n = bytes.len().min(len - 1);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n);
        *buf.add(n) = 0;
    }
    ACCEL_SUCCESS
}

pub(crate) fn init_impl(rt: &Runtime) -> i32 {
    status(rt.init())
}

pub(crate) fn current_device_impl(rt: &Runtime, device_out: *mut i32) -> i32 {
    if device_out.is_null() {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    }
    status(rt.current_device().map(|index| unsafe { *device_out = index }))
}

pub(crate) fn set_device_impl(rt: &Runtime, index: i32) -> i32 {
    status(rt.set_device(index))
}

pub(crate) fn exchange_device_impl(rt: &Runtime, index: i32, restore: bool, prev_out: *mut i32) -> i32 {
    if prev_out.is_null() {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    }
    let result = if restore {
        rt.maybe_exchange_device(index)
    } else {
        rt.exchange_device(index)
    };
    status(result.map(|prev: DeviceIndex| unsafe { *prev_out = prev }))
}

pub(crate) fn device_name_impl(rt: &Runtime, index: i32, buf: *mut c_char, len: usize) -> i32 {
    if buf.is_null() || len == 0 {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    }
    match rt.get_device_name(device_arg(index)) {
        Ok(name) => write_name(&name, buf, len),
        Err(e) => error_code(&e),
    }
}

pub(crate) fn device_capability_impl(
    rt: &Runtime,
    index: i32,
    max_work_group_size_out: *mut usize,
    max_num_sub_groups_out: *mut u32,
) -> i32 {
    if max_work_group_size_out.is_null() || max_num_sub_groups_out.is_null() {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    }
    status(rt.get_device_capability(device_arg(index)).map(|cap| unsafe {
        *max_work_group_size_out = cap.max_work_group_size;
        *max_num_sub_groups_out = cap.max_num_sub_groups;
    }))
}

pub(crate) fn current_stream_impl(
    rt: &Runtime,
    index: i32,
    stream_id_out: *mut i64,
    device_index_out: *mut i32,
    device_type_out: *mut i32,
) -> i32 {
    if stream_id_out.is_null() || device_index_out.is_null() || device_type_out.is_null() {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    }
    status(rt.current_stream(device_arg(index)).map(|s| unsafe {
        *stream_id_out = s.stream_id;
        *device_index_out = s.device_index;
        *device_type_out = s.device_type.code();
    }))
}

pub(crate) fn set_stream_impl(rt: &Runtime, stream_id: i64, device_index: i32, device_type: i32) -> i32 {
    let Some(kind) = DeviceType::from_code(device_type) else {
        return ACCEL_ERROR_INVALID_ARGUMENT;
    };
    let stream = Stream::new(stream_id, device_index, kind);
    status(rt.set_stream(Some(&stream)))
}

pub(crate) fn synchronize_impl(rt: &Runtime, index: i32) -> i32 {
    status(rt.synchronize(device_arg(index)))
}

/// Number of devices; 0 when no backend is available. Never fails.
#[no_mangle]
pub extern "C" fn accel_device_count() -> i32 {
    i32::try_from(crate::device_count()).unwrap_or(i32::MAX)
}

#[no_mangle]
pub extern "C" fn accel_is_available() -> i32 {
    crate::is_available() as i32
}

#[no_mangle]
pub extern "C" fn accel_is_initialized() -> i32 {
    crate::is_initialized() as i32
}

#[no_mangle]
pub extern "C" fn accel_init() -> i32 {
    init_impl(crate::runtime())
}

#[no_mangle]
pub extern "C" fn accel_current_device(device_out: *mut i32) -> i32 {
    current_device_impl(crate::runtime(), device_out)
}

#[no_mangle]
pub extern "C" fn accel_set_device(index: i32) -> i32 {
    set_device_impl(crate::runtime(), index)
}

#[no_mangle]
pub extern "C" fn accel_exchange_device(index: i32, prev_out: *mut i32) -> i32 {
    exchange_device_impl(crate::runtime(), index, false, prev_out)
}

#[no_mangle]
pub extern "C" fn accel_maybe_exchange_device(index: i32, prev_out: *mut i32) -> i32 {
    exchange_device_impl(crate::runtime(), index, true, prev_out)
}

/// Writes the NUL-terminated device name into `buf`, truncating to `len - 1` bytes.
#[no_mangle]
pub extern "C" fn accel_get_device_name(index: i32, buf: *mut c_char, len: usize) -> i32 {
    device_name_impl(crate::runtime(), index, buf, len)
}

#[no_mangle]
pub extern "C" fn accel_get_device_capability(
    index: i32,
    max_work_group_size_out: *mut usize,
    max_num_sub_groups_out: *mut u32,
) -> i32 {
    device_capability_impl(
        crate::runtime(),
        index,
        max_work_group_size_out,
        max_num_sub_groups_out,
    )
}

#[no_mangle]
pub extern "C" fn accel_current_stream(
    index: i32,
    stream_id_out: *mut i64,
    device_index_out: *mut i32,
    device_type_out: *mut i32,
) -> i32 {
    current_stream_impl(
        crate::runtime(),
        index,
        stream_id_out,
        device_index_out,
        device_type_out,
    )
}

#[no_mangle]
pub extern "C" fn accel_set_stream(stream_id: i64, device_index: i32, device_type: i32) -> i32 {
    set_stream_impl(crate::runtime(), stream_id, device_index, device_type)
}

#[no_mangle]
pub extern "C" fn accel_synchronize(index: i32) -> i32 {
    synchronize_impl(crate::runtime(), index)
}
