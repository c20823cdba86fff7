//! Device registry
//!
//! [`GattRegistry`] keeps one [`KeepAliveGatt`] per device for applications
//! talking to several peripherals. It is an ordinary value owned by the
//! application; nothing is registered implicitly.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gattlink_core::DeviceId;
use tracing::debug;

use crate::keep_alive::KeepAliveGatt;

/// Map from device to its keep-alive connection
#[derive(Default)]
pub struct GattRegistry {
    entries: DashMap<DeviceId, Arc<KeepAliveGatt>>,
}

impl GattRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection registered for `device`, creating it with `create` if absent
    pub fn get_or_insert_with(
        &self,
        device: DeviceId,
        create: impl FnOnce() -> KeepAliveGatt,
    ) -> Arc<KeepAliveGatt> {
        self.entries
            .entry(device)
            .or_insert_with(|| Arc::new(create()))
            .value()
            .clone()
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with) for fallible construction
    pub fn get_or_try_insert_with<E>(
        &self,
        device: DeviceId,
        create: impl FnOnce() -> Result<KeepAliveGatt, E>,
    ) -> Result<Arc<KeepAliveGatt>, E> {
        match self.entries.entry(device) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let gatt = Arc::new(create()?);
                debug!(device = %gatt.device(), "Registered keep-alive connection");
                Ok(entry.insert(gatt).value().clone())
            }
        }
    }

    pub fn get(&self, device: &DeviceId) -> Option<Arc<KeepAliveGatt>> {
        self.entries.get(device).map(|entry| entry.value().clone())
    }

    /// Unregister `device` and cancel its supervisor
    pub fn remove(&self, device: &DeviceId) -> Option<Arc<KeepAliveGatt>> {
        let (_, gatt) = self.entries.remove(device)?;
        gatt.cancel();
        debug!(device = %device, "Removed keep-alive connection");
        Some(gatt)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
