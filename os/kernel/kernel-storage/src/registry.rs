use crate::arena::{Arena, Handle};
use crate::{InfoKey, InfoValue, StorageDevice};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinLock;
use log::info;

/// Stable reference to a registered block device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(Handle);

struct Registered {
    name: String,
    device: Arc<dyn StorageDevice>,
}

/// The kernel's table of block devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: SpinLock<Arena<Registered>>,
}

impl DeviceRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            devices: SpinLock::new(Arena::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, device: Arc<dyn StorageDevice>) -> DeviceHandle {
        let name = name.into();
        let blocks = device.info(InfoKey::BlockCount).and_then(|v| v.as_number());
        let block_size = device.info(InfoKey::BlockSize).and_then(|v| v.as_number());
        info!("Registered block device {name} ({blocks:?} blocks of {block_size:?} bytes)");

        let handle = self.devices.lock().insert(Registered { name, device });
        DeviceHandle(handle)
    }

    pub fn unregister(&self, handle: DeviceHandle) -> Option<Arc<dyn StorageDevice>> {
        let removed = self.devices.lock().remove(handle.0)?;
        info!("Unregistered block device {}", removed.name);
        Some(removed.device)
    }

    #[must_use]
    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<dyn StorageDevice>> {
        self.devices.lock().get(handle.0).map(|r| Arc::clone(&r.device))
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<(DeviceHandle, Arc<dyn StorageDevice>)> {
        self.devices
            .lock()
            .iter()
            .find(|(_, r)| r.name == name)
            .map(|(h, r)| (DeviceHandle(h), Arc::clone(&r.device)))
    }

    /// Snapshot of all registered devices and their names.
    #[must_use]
    pub fn devices(&self) -> Vec<(DeviceHandle, String)> {
        self.devices
            .lock()
            .iter()
            .map(|(h, r)| (DeviceHandle(h), r.name.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Convenience for [`StorageDevice::info`] by handle.
    #[must_use]
    pub fn info(&self, handle: DeviceHandle, key: InfoKey) -> Option<InfoValue> {
        self.get(handle)?.info(key)
    }
}
