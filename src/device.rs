// src/device.rs - Device identities and the loose device reference resolver
use crate::error::{AccelError, Result};
use std::fmt;
use std::str::FromStr;

/// Index of a physical device. Negative values mean "unset / current device".
pub type DeviceIndex = i32;

/// Sentinel for "no explicit device"; guards treat it as a no-op.
pub const NO_DEVICE: DeviceIndex = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Cuda,
    Xpu,
    Sim,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Xpu => "xpu",
            DeviceType::Sim => "sim",
        }
    }

    /// Numeric code used when a stream crosses the C and Python boundaries.
    pub fn code(&self) -> i32 {
        match self {
            DeviceType::Cpu => 0,
            DeviceType::Cuda => 1,
            DeviceType::Xpu => 12,
            DeviceType::Sim => 31,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DeviceType::Cpu),
            1 => Some(DeviceType::Cuda),
            12 => Some(DeviceType::Xpu),
            31 => Some(DeviceType::Sim),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" => Ok(DeviceType::Cuda),
            "xpu" => Ok(DeviceType::Xpu),
            "sim" => Ok(DeviceType::Sim),
            other => Err(AccelError::invalid_argument(format!(
                "unknown device type '{}'",
                other
            ))),
        }
    }
}

/// Structured device handle: a device type plus an optional index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceType,
    pub index: Option<DeviceIndex>,
}

impl Device {
    pub fn new(kind: DeviceType, index: DeviceIndex) -> Self {
        Device {
            kind,
            index: Some(index),
        }
    }

    pub fn of_type(kind: DeviceType) -> Self {
        Device { kind, index: None }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{}", self.kind, index),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for Device {
    type Err = AccelError;

    /// Parses `"<type>"` or `"<type>:<index>"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once(':') {
            None => Ok(Device::of_type(s.parse()?)),
            Some((kind, index)) => {
                let kind: DeviceType = kind.parse()?;
                let index: u32 = index.parse().map_err(|_| {
                    AccelError::invalid_argument(format!("invalid device string: '{}'", s))
                })?;
                let index = DeviceIndex::try_from(index).map_err(|_| {
                    AccelError::invalid_argument(format!("device index out of range: '{}'", s))
                })?;
                Ok(Device::new(kind, index))
            }
        }
    }
}

/// Anything a caller may pass where a device is expected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceRef {
    #[default]
    Absent,
    Index(i64),
    Named(String),
    Handle(Device),
}

impl DeviceRef {
    /// Maps the reference to a device index for a backend of type `kind`.
    ///
    /// Returns [`NO_DEVICE`] for negative integers and, when `optional` is set,
    /// for an absent reference or a handle without an index. The result is not
    /// range checked against the device count; callers do that at the point of
    /// use.
    pub fn resolve(&self, kind: DeviceType, optional: bool) -> Result<DeviceIndex> {
        match self {
            DeviceRef::Absent => absent_index(self, optional),
            DeviceRef::Index(index) => index_from_i64(*index),
            DeviceRef::Named(name) => {
                if let Ok(index) = name.trim().parse::<i64>() {
                    return index_from_i64(index);
                }
                let device: Device = name.parse()?;
                DeviceRef::Handle(device).resolve(kind, optional)
            }
            DeviceRef::Handle(device) => {
                if device.kind != kind {
                    return Err(AccelError::invalid_argument(format!(
                        "Expected a {} device, but got: {}",
                        kind, device
                    )));
                }
                match device.index {
                    Some(index) => Ok(index.max(NO_DEVICE)),
                    None => absent_index(self, optional),
                }
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, DeviceRef::Absent)
    }

    /// True for references that stand for the current device: an absent one
    /// or a device type without an index. Negative integers are not implicit.
    pub fn is_implicit(&self) -> bool {
        match self {
            DeviceRef::Absent => true,
            DeviceRef::Index(_) => false,
            DeviceRef::Named(name) => {
                name.trim().parse::<i64>().is_err()
                    && name.parse::<Device>().map_or(false, |d| d.index.is_none())
            }
            DeviceRef::Handle(device) => device.index.is_none(),
        }
    }
}

fn absent_index(reference: &DeviceRef, optional: bool) -> Result<DeviceIndex> {
    if optional {
        Ok(NO_DEVICE)
    } else {
        Err(AccelError::invalid_argument(format!(
            "Expected a device with a specified index or an integer, but got: {:?}",
            reference
        )))
    }
}

fn index_from_i64(index: i64) -> Result<DeviceIndex> {
    if index < 0 {
        return Ok(NO_DEVICE);
    }
    DeviceIndex::try_from(index)
        .map_err(|_| AccelError::invalid_argument(format!("device index {} is too large", index)))
}

impl From<()> for DeviceRef {
    fn from(_: ()) -> Self {
        DeviceRef::Absent
    }
}

impl From<i32> for DeviceRef {
    fn from(index: i32) -> Self {
        DeviceRef::Index(index as i64)
    }
}

impl From<i64> for DeviceRef {
    fn from(index: i64) -> Self {
        DeviceRef::Index(index)
    }
}

impl From<usize> for DeviceRef {
    fn from(index: usize) -> Self {
        DeviceRef::Index(i64::try_from(index).unwrap_or(i64::MAX))
    }
}

impl From<&str> for DeviceRef {
    fn from(name: &str) -> Self {
        DeviceRef::Named(name.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(name: String) -> Self {
        DeviceRef::Named(name)
    }
}

impl From<Device> for DeviceRef {
    fn from(device: Device) -> Self {
        DeviceRef::Handle(device)
    }
}

impl<T: Into<DeviceRef>> From<Option<T>> for DeviceRef {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DeviceRef::Absent)
    }
}

/// Objects that live on some device, e.g. tensors or storages of the host framework.
pub trait OnDevice {
    /// The device index, or `None` if the object is not on this backend.
    fn device_index(&self) -> Option<DeviceIndex>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_reference() {
        assert_eq!(DeviceRef::Absent.resolve(DeviceType::Xpu, true), Ok(NO_DEVICE));
        assert!(matches!(
            DeviceRef::Absent.resolve(DeviceType::Xpu, false),
            Err(AccelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_integer_reference() {
        assert_eq!(DeviceRef::from(3).resolve(DeviceType::Xpu, false), Ok(3));
        assert_eq!(DeviceRef::from(-5).resolve(DeviceType::Xpu, false), Ok(NO_DEVICE));
        assert!(DeviceRef::from(i64::MAX).resolve(DeviceType::Xpu, false).is_err());
    }

    #[test]
    fn test_named_reference() {
        assert_eq!(DeviceRef::from("xpu:1").resolve(DeviceType::Xpu, false), Ok(1));
        assert_eq!(DeviceRef::from("xpu").resolve(DeviceType::Xpu, true), Ok(NO_DEVICE));
        assert!(DeviceRef::from("xpu").resolve(DeviceType::Xpu, false).is_err());
        assert!(DeviceRef::from("cuda:0").resolve(DeviceType::Xpu, true).is_err());
        assert!(DeviceRef::from("cpu").resolve(DeviceType::Xpu, true).is_err());
        assert!(DeviceRef::from("tpu:0").resolve(DeviceType::Xpu, true).is_err());
        assert!(DeviceRef::from("xpu:-1").resolve(DeviceType::Xpu, true).is_err());
        assert!(DeviceRef::from("xpu:one").resolve(DeviceType::Xpu, true).is_err());
    }

    #[test]
    fn test_integer_string_reference() {
        assert_eq!(DeviceRef::from("1").resolve(DeviceType::Sim, false), Ok(1));
        assert_eq!(DeviceRef::from(" 0 ").resolve(DeviceType::Xpu, true), Ok(0));
        assert_eq!(DeviceRef::from("-1").resolve(DeviceType::Xpu, false), Ok(NO_DEVICE));
        assert!(DeviceRef::from("99999999999").resolve(DeviceType::Xpu, false).is_err());
    }

    #[test]
    fn test_implicit_references() {
        assert!(DeviceRef::Absent.is_implicit());
        assert!(DeviceRef::from("sim").is_implicit());
        assert!(DeviceRef::from(Device::of_type(DeviceType::Sim)).is_implicit());
        assert!(!DeviceRef::from("sim:0").is_implicit());
        assert!(!DeviceRef::from("-1").is_implicit());
        assert!(!DeviceRef::from(-1).is_implicit());
    }

    #[test]
    fn test_handle_reference() {
        let handle = Device::new(DeviceType::Sim, 2);
        assert_eq!(DeviceRef::from(handle).resolve(DeviceType::Sim, false), Ok(2));

        let err = DeviceRef::from(handle).resolve(DeviceType::Cuda, true).unwrap_err();
        assert_eq!(
            err,
            AccelError::InvalidArgument("Expected a cuda device, but got: sim:2".to_string())
        );
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(DeviceRef::from(None::<i32>), DeviceRef::Absent);
        assert_eq!(DeviceRef::from(Some(1usize)), DeviceRef::Index(1));
        assert!(DeviceRef::from(()).is_absent());
    }

    #[test]
    fn test_device_display_round_trip() {
        let device: Device = "cuda:7".parse().unwrap();
        assert_eq!(device, Device::new(DeviceType::Cuda, 7));
        assert_eq!(device.to_string(), "cuda:7");
        assert_eq!(Device::of_type(DeviceType::Xpu).to_string(), "xpu");
    }

    #[test]
    fn test_type_codes() {
        for kind in [DeviceType::Cpu, DeviceType::Cuda, DeviceType::Xpu, DeviceType::Sim] {
            assert_eq!(DeviceType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(DeviceType::from_code(99), None);
    }
}
