//! Transport abstraction for GATT communication
//!
//! The BLE stack itself (radio, connection setup, attribute protocol) lives
//! outside this workspace. It is reached through three traits:
//!
//! - [`GattTransport`] starts a connection and hands back a [`GattHandle`]
//! - [`GattHandle`] issues requests, which the stack accepts or rejects
//!   synchronously
//! - [`GattCallback`] receives every asynchronous outcome, on whatever thread
//!   the stack chooses

use std::sync::Arc;

use crate::types::{
    CharacteristicHandle, ConnectionState, DescriptorHandle, DeviceId, GattStatus,
    ServiceHandle, WriteType,
};

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Entry point into a BLE stack
pub trait GattTransport: Send + Sync {
    /// Start connecting to `device`, reporting progress through `callback`
    ///
    /// Returns `None` when the stack refuses to even start (radio off,
    /// unknown device, ...).
    fn connect(
        &self,
        device: &DeviceId,
        callback: Arc<dyn GattCallback>,
    ) -> Option<Arc<dyn GattHandle>>;
}

/// A live transport-level connection
///
/// Request methods return whether the stack accepted the request; the actual
/// result arrives later through the matching [`GattCallback`] method.
/// `disconnect` and `close` must be idempotent.
pub trait GattHandle: Send + Sync {
    fn disconnect(&self);

    fn close(&self);

    fn discover_services(&self) -> bool;

    /// Services found by the last successful discovery
    fn services(&self) -> Vec<ServiceHandle>;

    fn read_characteristic(&self, characteristic: &CharacteristicHandle) -> bool;

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> bool;

    fn write_descriptor(&self, descriptor: &DescriptorHandle, value: &[u8]) -> bool;

    fn request_mtu(&self, mtu: u16) -> bool;

    fn read_remote_rssi(&self) -> bool;

    /// Enable or disable local delivery of notifications; fully synchronous
    fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> bool;
}

/// Receiver of asynchronous transport outcomes
pub trait GattCallback: Send + Sync {
    fn on_connection_state_change(&self, status: GattStatus, new_state: ConnectionState);

    fn on_services_discovered(&self, status: GattStatus);

    fn on_characteristic_read(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        status: GattStatus,
    );

    fn on_characteristic_write(&self, characteristic: &CharacteristicHandle, status: GattStatus);

    fn on_descriptor_write(&self, descriptor: &DescriptorHandle, status: GattStatus);

    fn on_characteristic_changed(&self, characteristic: &CharacteristicHandle, value: &[u8]);

    fn on_mtu_changed(&self, mtu: u16, status: GattStatus);

    fn on_read_remote_rssi(&self, rssi: i16, status: GattStatus);
}
