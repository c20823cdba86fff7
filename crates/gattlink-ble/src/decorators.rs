//! Capability trait and decorators
//!
//! [`GattIo`] is the request surface shared by the engine and the keep-alive
//! supervisor. Decorators wrap any `GattIo` by explicit composition:
//!
//! - [`GattIoExt`] adds "or fail" variants that turn a non-success status
//!   into `StatusFailure`
//! - [`TransformingGatt`] encodes outgoing and decodes incoming
//!   attribute payloads (for example application-level encryption)

use std::sync::Arc;

use async_trait::async_trait;
use gattlink_core::{
    CharacteristicChanged, CharacteristicHandle, CharacteristicRead, CharacteristicWrite,
    DescriptorHandle, DescriptorWrite, GattError, GattOperation, GattResult, GattStatus,
    MtuChanged, RemoteRssiRead, ServiceHandle, Uuid, WriteType,
};

use crate::gatt::Gatt;

// ----------------------------------------------------------------------------
// Capability Trait
// ----------------------------------------------------------------------------

/// GATT request surface
#[async_trait]
pub trait GattIo: Send + Sync {
    async fn discover_services(&self) -> GattResult<()>;

    fn services(&self) -> GattResult<Vec<ServiceHandle>>;

    async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<CharacteristicRead>;

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<CharacteristicWrite>;

    async fn write_descriptor(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<DescriptorWrite>;

    async fn request_mtu(&self, mtu: u16) -> GattResult<MtuChanged>;

    async fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<bool>;

    async fn read_remote_rssi(&self) -> GattResult<RemoteRssiRead>;
}

#[async_trait]
impl GattIo for Gatt {
    async fn discover_services(&self) -> GattResult<()> {
        Gatt::discover_services(self).await
    }

    fn services(&self) -> GattResult<Vec<ServiceHandle>> {
        Ok(Gatt::services(self))
    }

    async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<CharacteristicRead> {
        Gatt::read_characteristic(self, characteristic).await
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<CharacteristicWrite> {
        Gatt::write_characteristic(self, characteristic, value, write_type).await
    }

    async fn write_descriptor(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<DescriptorWrite> {
        Gatt::write_descriptor(self, descriptor, value).await
    }

    async fn request_mtu(&self, mtu: u16) -> GattResult<MtuChanged> {
        Gatt::request_mtu(self, mtu).await
    }

    async fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<bool> {
        Gatt::set_characteristic_notification(self, characteristic, enable).await
    }

    async fn read_remote_rssi(&self) -> GattResult<RemoteRssiRead> {
        Gatt::read_remote_rssi(self).await
    }
}

#[async_trait]
impl<T: GattIo + ?Sized> GattIo for Arc<T> {
    async fn discover_services(&self) -> GattResult<()> {
        (**self).discover_services().await
    }

    fn services(&self) -> GattResult<Vec<ServiceHandle>> {
        (**self).services()
    }

    async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<CharacteristicRead> {
        (**self).read_characteristic(characteristic).await
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<CharacteristicWrite> {
        (**self)
            .write_characteristic(characteristic, value, write_type)
            .await
    }

    async fn write_descriptor(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<DescriptorWrite> {
        (**self).write_descriptor(descriptor, value).await
    }

    async fn request_mtu(&self, mtu: u16) -> GattResult<MtuChanged> {
        (**self).request_mtu(mtu).await
    }

    async fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<bool> {
        (**self)
            .set_characteristic_notification(characteristic, enable)
            .await
    }

    async fn read_remote_rssi(&self) -> GattResult<RemoteRssiRead> {
        (**self).read_remote_rssi().await
    }
}

// ----------------------------------------------------------------------------
// Status-Checking Wrappers
// ----------------------------------------------------------------------------

fn ensure_success(operation: GattOperation, status: GattStatus) -> GattResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(GattError::StatusFailure { operation, status })
    }
}

/// Variants of the [`GattIo`] operations that fail on a non-success status
#[async_trait]
pub trait GattIoExt: GattIo {
    /// Read a characteristic, returning only its value
    async fn read_characteristic_or_fail(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<Vec<u8>> {
        let read = self.read_characteristic(characteristic).await?;
        ensure_success(GattOperation::ReadCharacteristic, read.status)?;
        Ok(read.value)
    }

    async fn write_characteristic_or_fail(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<()> {
        let write = self
            .write_characteristic(characteristic, value, write_type)
            .await?;
        ensure_success(GattOperation::WriteCharacteristic, write.status)
    }

    async fn write_descriptor_or_fail(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<()> {
        let write = self.write_descriptor(descriptor, value).await?;
        ensure_success(GattOperation::WriteDescriptor, write.status)
    }

    /// Negotiate the MTU, returning the value the peripheral agreed to
    async fn request_mtu_or_fail(&self, mtu: u16) -> GattResult<u16> {
        let changed = self.request_mtu(mtu).await?;
        ensure_success(GattOperation::RequestMtu, changed.status)?;
        Ok(changed.mtu)
    }

    async fn read_remote_rssi_or_fail(&self) -> GattResult<i16> {
        let read = self.read_remote_rssi().await?;
        ensure_success(GattOperation::ReadRemoteRssi, read.status)?;
        Ok(read.rssi)
    }

    /// Like `set_characteristic_notification`, with `false` reported as `Rejected`
    async fn set_characteristic_notification_or_fail(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<()> {
        if self
            .set_characteristic_notification(characteristic, enable)
            .await?
        {
            Ok(())
        } else {
            Err(GattError::rejected(
                GattOperation::SetCharacteristicNotification,
            ))
        }
    }
}

impl<T: GattIo + ?Sized> GattIoExt for T {}

// ----------------------------------------------------------------------------
// Payload Transformation
// ----------------------------------------------------------------------------

/// Reversible transformation of characteristic payloads
pub trait PayloadTransform: Send + Sync {
    /// Transform a payload about to be written to the attribute `uuid`
    fn encode(&self, uuid: &Uuid, payload: &[u8]) -> GattResult<Vec<u8>>;

    /// Transform a payload read from or pushed by the attribute `uuid`
    fn decode(&self, uuid: &Uuid, payload: &[u8]) -> GattResult<Vec<u8>>;
}

/// [`GattIo`] wrapper applying a [`PayloadTransform`]
///
/// Characteristic and descriptor writes are encoded, successful
/// characteristic reads decoded. Every other operation is forwarded as is.
pub struct TransformingGatt<G, T> {
    inner: G,
    transform: T,
}

impl<G: GattIo, T: PayloadTransform> TransformingGatt<G, T> {
    pub fn new(inner: G, transform: T) -> Self {
        Self { inner, transform }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    /// Decode a notification received from the wrapped connection
    pub fn decode_changed(&self, changed: CharacteristicChanged) -> GattResult<CharacteristicChanged> {
        let value = self
            .transform
            .decode(&changed.characteristic.uuid, &changed.value)?;
        Ok(CharacteristicChanged { value, ..changed })
    }
}

#[async_trait]
impl<G: GattIo, T: PayloadTransform> GattIo for TransformingGatt<G, T> {
    async fn discover_services(&self) -> GattResult<()> {
        self.inner.discover_services().await
    }

    fn services(&self) -> GattResult<Vec<ServiceHandle>> {
        self.inner.services()
    }

    async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<CharacteristicRead> {
        let read = self.inner.read_characteristic(characteristic).await?;
        if !read.status.is_success() {
            return Ok(read);
        }
        let value = self.transform.decode(&characteristic.uuid, &read.value)?;
        Ok(CharacteristicRead { value, ..read })
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<CharacteristicWrite> {
        let encoded = self.transform.encode(&characteristic.uuid, value)?;
        self.inner
            .write_characteristic(characteristic, &encoded, write_type)
            .await
    }

    async fn write_descriptor(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<DescriptorWrite> {
        let encoded = self.transform.encode(&descriptor.uuid, value)?;
        self.inner.write_descriptor(descriptor, &encoded).await
    }

    async fn request_mtu(&self, mtu: u16) -> GattResult<MtuChanged> {
        self.inner.request_mtu(mtu).await
    }

    async fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<bool> {
        self.inner
            .set_characteristic_notification(characteristic, enable)
            .await
    }

    async fn read_remote_rssi(&self) -> GattResult<RemoteRssiRead> {
        self.inner.read_remote_rssi().await
    }
}
