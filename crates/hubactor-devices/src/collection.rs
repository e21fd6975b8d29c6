//! Named collection of devices.

use indexmap::IndexMap;

use crate::device::Device;
use crate::error::DeviceError;

/// Devices by unique name.
///
/// Names starting with `_` are reserved.
#[derive(Debug, Clone, Default)]
pub struct DeviceCollection {
    devices: IndexMap<String, Device>,
}

impl DeviceCollection {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Result<Self, DeviceError> {
        let mut collection = Self::default();
        for device in devices {
            collection.add(device)?;
        }
        Ok(collection)
    }

    pub fn add(&mut self, device: Device) -> Result<(), DeviceError> {
        let name = device.name().to_string();
        if name.is_empty() || name.starts_with('_') {
            return Err(DeviceError::InvalidDeviceName(name));
        }
        if self.devices.contains_key(&name) {
            return Err(DeviceError::DuplicateDevice(name));
        }
        self.devices.insert(name, device);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Device names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Devices in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
