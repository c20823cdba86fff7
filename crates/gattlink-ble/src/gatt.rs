//! GATT request/response engine
//!
//! [`Gatt`] turns the transport's fire-and-callback requests into awaitable
//! operations. One operation is in flight at a time: the engine holds its
//! request lock from the moment a request is handed to the transport until
//! the matching response arrives, fails, or the caller gives up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gattlink_core::{
    CharacteristicHandle, CharacteristicRead, CharacteristicWrite, ConnectionState,
    ConnectionStateChange, DescriptorHandle, DescriptorWrite, DeviceId, GattError, GattHandle,
    GattLogger, GattOperation, GattResponse, GattResult, MtuChanged, RemoteRssiRead,
    ResponseKind, ServiceHandle, ServicesDiscovered, WriteType,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::callback::{CallbackAdapter, ChangeSubscription};
use crate::worker::GattWorker;

// ----------------------------------------------------------------------------
// Response Extraction
// ----------------------------------------------------------------------------

/// Typed payload of one response kind
trait ExpectedResponse: Sized {
    const KIND: ResponseKind;

    fn extract(response: GattResponse) -> Option<Self>;
}

macro_rules! expected_response {
    ($ty:ident) => {
        impl ExpectedResponse for $ty {
            const KIND: ResponseKind = ResponseKind::$ty;

            fn extract(response: GattResponse) -> Option<Self> {
                match response {
                    GattResponse::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

expected_response!(ServicesDiscovered);
expected_response!(CharacteristicRead);
expected_response!(CharacteristicWrite);
expected_response!(DescriptorWrite);
expected_response!(MtuChanged);
expected_response!(RemoteRssiRead);

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Request/response engine for one physical connection
///
/// Created by [`GattDevice::connect`](crate::GattDevice::connect). Once the
/// connection reaches `Disconnected` the engine is defunct and every
/// operation fails with `ConnectionLost`; reconnecting means creating a new
/// engine.
pub struct Gatt {
    device: DeviceId,
    handle: Arc<dyn GattHandle>,
    adapter: Arc<CallbackAdapter>,
    worker: GattWorker,
    logger: Arc<dyn GattLogger>,
    request_lock: Mutex<()>,
    released: AtomicBool,
}

impl Gatt {
    pub(crate) fn new(
        device: DeviceId,
        handle: Arc<dyn GattHandle>,
        adapter: Arc<CallbackAdapter>,
        worker: GattWorker,
        logger: Arc<dyn GattLogger>,
    ) -> Self {
        Self {
            device,
            handle,
            adapter,
            worker,
            logger,
            request_lock: Mutex::new(()),
            released: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Receiver of the latest reported connection state
    pub fn state(&self) -> watch::Receiver<ConnectionStateChange> {
        self.adapter.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.adapter.current_state().new_state
    }

    /// New subscription to unsolicited characteristic changes
    pub fn characteristic_changed(&self) -> ChangeSubscription {
        self.adapter.subscribe()
    }

    /// Services found by the last discovery
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.handle.services()
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    async fn execute<T, F>(&self, operation: GattOperation, request: F) -> GattResult<T>
    where
        T: ExpectedResponse,
        F: FnOnce(&dyn GattHandle) -> bool + Send + 'static,
    {
        let _in_flight = self.request_lock.lock().await;

        if let Some(error) = self.adapter.closed_error() {
            return Err(error);
        }
        self.adapter.discard_stale_response();

        self.logger.log_request(&self.device, operation);
        let handle = self.handle.clone();
        let accepted = self.worker.run(move || request(handle.as_ref())).await?;
        if !accepted {
            debug!(device = %self.device, %operation, "Transport rejected request");
            return Err(GattError::rejected(operation));
        }

        let response = self.adapter.next_response().await?;
        let received = response.kind();
        T::extract(response).ok_or(GattError::OutOfOrderCallback {
            expected: T::KIND,
            received,
        })
    }

    /// Discover the peripheral's services
    ///
    /// A non-success status is reported as `StatusFailure`; on success the
    /// result is available from [`Gatt::services`].
    pub async fn discover_services(&self) -> GattResult<()> {
        let discovered: ServicesDiscovered = self
            .execute(GattOperation::DiscoverServices, |handle| {
                handle.discover_services()
            })
            .await?;
        if discovered.status.is_success() {
            Ok(())
        } else {
            Err(GattError::StatusFailure {
                operation: GattOperation::DiscoverServices,
                status: discovered.status,
            })
        }
    }

    pub async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<CharacteristicRead> {
        let characteristic = characteristic.clone();
        self.execute(GattOperation::ReadCharacteristic, move |handle| {
            handle.read_characteristic(&characteristic)
        })
        .await
    }

    pub async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<CharacteristicWrite> {
        let characteristic = characteristic.clone();
        let value = value.to_vec();
        self.execute(GattOperation::WriteCharacteristic, move |handle| {
            handle.write_characteristic(&characteristic, &value, write_type)
        })
        .await
    }

    pub async fn write_descriptor(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<DescriptorWrite> {
        let descriptor = descriptor.clone();
        let value = value.to_vec();
        self.execute(GattOperation::WriteDescriptor, move |handle| {
            handle.write_descriptor(&descriptor, &value)
        })
        .await
    }

    pub async fn request_mtu(&self, mtu: u16) -> GattResult<MtuChanged> {
        self.execute(GattOperation::RequestMtu, move |handle| {
            handle.request_mtu(mtu)
        })
        .await
    }

    pub async fn read_remote_rssi(&self) -> GattResult<RemoteRssiRead> {
        self.execute(GattOperation::ReadRemoteRssi, |handle| {
            handle.read_remote_rssi()
        })
        .await
    }

    /// Enable or disable local notification delivery
    ///
    /// Completes synchronously in the transport, so it neither takes the
    /// request lock nor waits for a response.
    pub async fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<bool> {
        self.logger
            .log_request(&self.device, GattOperation::SetCharacteristicNotification);
        let handle = self.handle.clone();
        let characteristic = characteristic.clone();
        self.worker
            .run(move || handle.set_characteristic_notification(&characteristic, enable))
            .await
    }

    /// Disconnect gracefully and release the connection
    ///
    /// Waits for the transport to report `Disconnected`. The adapter, handle
    /// and worker are released exactly once, including when this future is
    /// dropped before completing.
    pub async fn disconnect(&self) -> GattResult<()> {
        let _release = ReleaseOnDrop(self);

        let mut state = self.adapter.state();
        let current = state.borrow().new_state;
        if current == ConnectionState::Disconnected {
            return Ok(());
        }

        info!(device = %self.device, "Disconnecting");
        self.logger.log_request(&self.device, GattOperation::Disconnect);
        let handle = self.handle.clone();
        self.worker.run(move || handle.disconnect()).await?;

        state
            .wait_for(|change| change.new_state == ConnectionState::Disconnected)
            .await
            .map_err(|_| GattError::connection_lost(None))?;
        debug!(device = %self.device, "Disconnected");
        Ok(())
    }

    /// Release the connection immediately, without waiting for the transport
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(device = %self.device, "Releasing GATT connection");
        self.adapter.close();
        self.worker.close();
    }
}

impl Drop for Gatt {
    fn drop(&mut self) {
        self.close();
    }
}

struct ReleaseOnDrop<'a>(&'a Gatt);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_core::testing::{FakeHandle, FakeRequest, HandleOptions};
    use gattlink_core::{GattConfig, GattStatus, NoOpLogger, Uuid};
    use std::time::Duration;
    use tokio::time::timeout;

    fn engine(options: HandleOptions) -> (Gatt, Arc<FakeHandle>) {
        let device = DeviceId::new("11:22:33:44:55:66");
        let config = GattConfig::new().with_logger(Arc::new(NoOpLogger));
        let adapter = Arc::new(CallbackAdapter::new(device.clone(), &config));
        let handle = Arc::new(FakeHandle::new(device.clone(), adapter.clone(), options));
        adapter.attach(handle.clone());
        handle.report_state(GattStatus::SUCCESS, ConnectionState::Connected);
        let worker = GattWorker::spawn("gatt-worker-unit").unwrap();
        let gatt = Gatt::new(device, handle.clone(), adapter, worker, config.logger);
        (gatt, handle)
    }

    fn characteristic() -> CharacteristicHandle {
        CharacteristicHandle::new(Uuid::from_u128(0x2A29), Uuid::from_u128(0x180A), 3)
    }

    #[tokio::test]
    async fn test_mismatched_response_is_out_of_order() {
        let (gatt, handle) = engine(HandleOptions::default());
        handle.set_responder(Some(Arc::new(
            |_: &FakeRequest, callback: &dyn gattlink_core::GattCallback| {
                callback.on_mtu_changed(23, GattStatus::SUCCESS)
            },
        )));

        let result = gatt.read_characteristic(&characteristic()).await;
        assert_eq!(
            result,
            Err(GattError::OutOfOrderCallback {
                expected: ResponseKind::CharacteristicRead,
                received: ResponseKind::MtuChanged,
            })
        );
    }

    #[tokio::test]
    async fn test_set_notification_is_synchronous() {
        let (gatt, handle) = engine(HandleOptions::default());
        assert_eq!(
            gatt.set_characteristic_notification(&characteristic(), true)
                .await,
            Ok(true)
        );
        handle.set_accept_requests(false);
        assert_eq!(
            gatt.set_characteristic_notification(&characteristic(), false)
                .await,
            Ok(false)
        );
    }

    #[tokio::test]
    async fn test_disconnect_releases_once() {
        let (gatt, handle) = engine(HandleOptions::default());
        timeout(Duration::from_secs(1), gatt.disconnect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.disconnect_calls(), 1);
        assert_eq!(handle.close_calls(), 1);
        assert!(gatt.is_closed());

        // Already disconnected: returns at once without asking the transport again
        gatt.disconnect().await.unwrap();
        drop(gatt);
        assert_eq!(handle.disconnect_calls(), 1);
        assert_eq!(handle.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_disconnect_still_releases() {
        let (gatt, handle) = engine(HandleOptions {
            report_disconnect: false,
            ..HandleOptions::default()
        });

        let result = timeout(Duration::from_millis(50), gatt.disconnect()).await;
        assert!(result.is_err());
        assert_eq!(handle.disconnect_calls(), 1);
        assert_eq!(handle.close_calls(), 1);
        assert!(gatt.is_closed());
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let (gatt, handle) = engine(HandleOptions::default());
        gatt.close();
        assert!(matches!(
            gatt.request_mtu(100).await,
            Err(GattError::ConnectionLost { .. })
        ));
        assert!(handle.requests().is_empty());
    }
}
