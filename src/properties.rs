// src/properties.rs - Device property snapshots
use crate::device::DeviceIndex;

/// Immutable snapshot of a device's properties, fetched on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    pub device_index: DeviceIndex,
    pub name: String,
    pub platform_name: String,
    pub driver_version: String,
    pub total_memory: usize,
    pub max_compute_units: u32,
    pub max_work_group_size: usize,
    pub max_num_sub_groups: u32,
    pub sub_group_sizes: Vec<usize>,
    pub has_fp16: bool,
    pub has_fp64: bool,
}

impl DeviceProperties {
    pub fn capability(&self) -> DeviceCapability {
        DeviceCapability {
            max_work_group_size: self.max_work_group_size,
            max_num_sub_groups: self.max_num_sub_groups,
            sub_group_sizes: self.sub_group_sizes.clone(),
        }
    }

    pub fn total_memory_mb(&self) -> usize {
        self.total_memory / 1024 / 1024
    }
}

/// Work-group limits of a device, the subset schedulers care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    pub max_work_group_size: usize,
    pub max_num_sub_groups: u32,
    pub sub_group_sizes: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_is_derived_from_properties() {
        let props = DeviceProperties {
            device_index: 0,
            name: "Test Device".to_string(),
            platform_name: "test".to_string(),
            driver_version: "1.0".to_string(),
            total_memory: 16 * 1024 * 1024 * 1024,
            max_compute_units: 64,
            max_work_group_size: 1024,
            max_num_sub_groups: 64,
            sub_group_sizes: vec![16, 32],
            has_fp16: true,
            has_fp64: false,
        };

        let cap = props.capability();
        assert_eq!(cap.max_work_group_size, 1024);
        assert_eq!(cap.max_num_sub_groups, 64);
        assert_eq!(cap.sub_group_sizes, vec![16, 32]);
        assert_eq!(props.total_memory_mb(), 16 * 1024);
    }
}
