//! Bridge from transport callbacks to awaitable channels
//!
//! The [`CallbackAdapter`] is registered with the transport as the
//! [`GattCallback`] of exactly one connection. It republishes what it hears as:
//!
//! - the latest connection state (a `watch` cell, newer overwrites older)
//! - characteristic changes (a bounded `broadcast` stream, every subscriber
//!   sees every event unless it falls behind)
//! - the last operation response (a single slot consumed once per request)

use std::sync::{Arc, Mutex, MutexGuard};

use gattlink_core::logging::LogLevel;
use gattlink_core::{
    CallbackEvent, CharacteristicChanged, CharacteristicHandle, CharacteristicRead,
    CharacteristicWrite, ConnectionState, ConnectionStateChange, DescriptorHandle,
    DescriptorWrite, DeviceId, GattCallback, GattConfig, GattError, GattHandle, GattLogger,
    GattResponse, GattResult, GattStatus, MtuChanged, RemoteRssiRead, ServicesDiscovered,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Response Slot
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    value: Option<GattResponse>,
    closed: Option<GattError>,
}

/// Single-slot cell holding the most recent response
///
/// Once closed, every wait fails with the close error; a response that was
/// already stored is still handed out first.
#[derive(Default)]
struct ResponseSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl ResponseSlot {
    /// Store a response, returning the one it replaced
    fn offer(&self, response: GattResponse) -> Option<GattResponse> {
        let replaced = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return Some(response);
            }
            state.value.replace(response)
        };
        self.notify.notify_one();
        replaced
    }

    fn close(&self, error: GattError) {
        {
            let mut state = lock(&self.state);
            if state.closed.is_none() {
                state.closed = Some(error);
            }
        }
        self.notify.notify_one();
    }

    fn closed_error(&self) -> Option<GattError> {
        lock(&self.state).closed.clone()
    }

    fn discard(&self) -> Option<GattResponse> {
        lock(&self.state).value.take()
    }

    async fn take(&self) -> GattResult<GattResponse> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = lock(&self.state);
                if let Some(response) = state.value.take() {
                    return Ok(response);
                }
                if let Some(error) = &state.closed {
                    return Err(error.clone());
                }
            }
            notified.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Characteristic Change Subscription
// ----------------------------------------------------------------------------

/// Receiving end of a characteristic-changed stream
///
/// A subscriber that falls further behind than the stream capacity loses the
/// oldest events; the loss is logged and reception continues.
pub struct ChangeSubscription {
    device: DeviceId,
    logger: Arc<dyn GattLogger>,
    rx: broadcast::Receiver<CharacteristicChanged>,
}

impl ChangeSubscription {
    pub fn new(
        device: DeviceId,
        logger: Arc<dyn GattLogger>,
        rx: broadcast::Receiver<CharacteristicChanged>,
    ) -> Self {
        Self { device, logger, rx }
    }

    /// Next change, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<CharacteristicChanged> {
        loop {
            match self.rx.recv().await {
                Ok(changed) => return Some(changed),
                Err(RecvError::Lagged(dropped)) => {
                    self.logger.log_drop(
                        &self.device,
                        dropped,
                        "characteristic change subscriber fell behind",
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Callback Adapter
// ----------------------------------------------------------------------------

#[derive(Default)]
struct HandleSlot {
    handle: Option<Arc<dyn GattHandle>>,
    released: bool,
}

/// [`GattCallback`] implementation owned by one engine
pub struct CallbackAdapter {
    device: DeviceId,
    logger: Arc<dyn GattLogger>,
    state_tx: watch::Sender<ConnectionStateChange>,
    changed_tx: broadcast::Sender<CharacteristicChanged>,
    response: ResponseSlot,
    handle: Mutex<HandleSlot>,
}

impl CallbackAdapter {
    pub fn new(device: DeviceId, config: &GattConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionStateChange::new(
            GattStatus::SUCCESS,
            ConnectionState::Connecting,
        ));
        let (changed_tx, _) = broadcast::channel(config.characteristic_changed_capacity.max(1));
        Self {
            device,
            logger: config.logger.clone(),
            state_tx,
            changed_tx,
            response: ResponseSlot::default(),
            handle: Mutex::new(HandleSlot::default()),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Hand over the transport handle this adapter releases on disconnect
    ///
    /// If the connection already ended, the handle is closed right away.
    pub fn attach(&self, handle: Arc<dyn GattHandle>) {
        let mut slot = lock(&self.handle);
        if slot.released {
            drop(slot);
            handle.close();
        } else {
            slot.handle = Some(handle);
        }
    }

    /// Receiver of the latest connection state
    pub fn state(&self) -> watch::Receiver<ConnectionStateChange> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionStateChange {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription::new(
            self.device.clone(),
            self.logger.clone(),
            self.changed_tx.subscribe(),
        )
    }

    /// Wait for the response to the request in flight
    pub async fn next_response(&self) -> GattResult<GattResponse> {
        self.response.take().await
    }

    /// Error every response wait fails with, once the connection is gone
    pub fn closed_error(&self) -> Option<GattError> {
        self.response.closed_error()
    }

    /// Drop a response nobody is waiting for any more
    pub fn discard_stale_response(&self) {
        if let Some(stale) = self.response.discard() {
            self.logger.log_event(
                &self.device,
                LogLevel::Warn,
                &format!("Discarding unclaimed {} response", stale.kind()),
            );
        }
    }

    /// Abort pending waits and release the transport handle
    pub fn close(&self) {
        self.response.close(GattError::connection_lost(None));
        self.release_handle();
    }

    pub fn is_released(&self) -> bool {
        lock(&self.handle).released
    }

    fn release_handle(&self) {
        let handle = {
            let mut slot = lock(&self.handle);
            if slot.released {
                return;
            }
            slot.released = true;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            debug!(device = %self.device, "Closing transport handle");
            handle.close();
        }
    }

    fn deliver(&self, response: GattResponse) {
        self.logger
            .log_callback(&self.device, &CallbackEvent::Response(response.clone()));
        if let Some(unclaimed) = self.response.offer(response) {
            self.logger.log_event(
                &self.device,
                LogLevel::Warn,
                &format!("Dropping unclaimed {} response", unclaimed.kind()),
            );
        }
    }
}

impl GattCallback for CallbackAdapter {
    fn on_connection_state_change(&self, status: GattStatus, new_state: ConnectionState) {
        let change = ConnectionStateChange::new(status, new_state);
        self.logger
            .log_callback(&self.device, &CallbackEvent::ConnectionStateChange(change));

        if new_state.is_disconnecting_or_disconnected() {
            self.response.close(GattError::connection_lost(Some(change)));
        }
        self.state_tx.send_replace(change);
        if new_state == ConnectionState::Disconnected {
            self.release_handle();
        }
    }

    fn on_services_discovered(&self, status: GattStatus) {
        self.deliver(GattResponse::ServicesDiscovered(ServicesDiscovered {
            status,
        }));
    }

    fn on_characteristic_read(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        status: GattStatus,
    ) {
        self.deliver(GattResponse::CharacteristicRead(CharacteristicRead {
            characteristic: characteristic.clone(),
            value: value.to_vec(),
            status,
        }));
    }

    fn on_characteristic_write(&self, characteristic: &CharacteristicHandle, status: GattStatus) {
        self.deliver(GattResponse::CharacteristicWrite(CharacteristicWrite {
            characteristic: characteristic.clone(),
            status,
        }));
    }

    fn on_descriptor_write(&self, descriptor: &DescriptorHandle, status: GattStatus) {
        self.deliver(GattResponse::DescriptorWrite(DescriptorWrite {
            descriptor: descriptor.clone(),
            status,
        }));
    }

    fn on_characteristic_changed(&self, characteristic: &CharacteristicHandle, value: &[u8]) {
        let changed = CharacteristicChanged {
            characteristic: characteristic.clone(),
            value: value.to_vec(),
        };
        self.logger.log_callback(
            &self.device,
            &CallbackEvent::CharacteristicChanged(changed.clone()),
        );
        // No subscribers is not an error
        let _ = self.changed_tx.send(changed);
    }

    fn on_mtu_changed(&self, mtu: u16, status: GattStatus) {
        self.deliver(GattResponse::MtuChanged(MtuChanged { mtu, status }));
    }

    fn on_read_remote_rssi(&self, rssi: i16, status: GattStatus) {
        self.deliver(GattResponse::RemoteRssiRead(RemoteRssiRead { rssi, status }));
    }
}
