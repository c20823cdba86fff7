//! btleplug-backed transport
//!
//! Adapts btleplug's async `Peripheral` API to the callback-style
//! [`GattTransport`]: every connection gets a task that executes queued
//! requests in order and reports each outcome through the registered
//! callback. Peripherals are registered by the application, since scanning
//! is not part of this crate.
//!
//! Links dropped by the peripheral are detected from the adapter's
//! `DeviceDisconnected` events, with a periodic `is_connected` check for
//! platforms that do not emit them.

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central as _, CentralEvent, Characteristic, Descriptor, Peripheral as _,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{Stream, StreamExt};
use gattlink_core::{
    CharacteristicHandle, ConnectionState, DescriptorHandle, DeviceId, GattCallback,
    GattHandle, GattStatus, GattTransport, ServiceHandle, WriteType,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Period of the `is_connected` fallback check
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// [`GattTransport`] over btleplug peripherals
pub struct BtleplugTransport {
    runtime: Handle,
    adapter: Adapter,
    peripherals: Mutex<HashMap<DeviceId, Peripheral>>,
}

impl BtleplugTransport {
    /// Create a transport for peripherals of `adapter`, running its
    /// connection tasks on `runtime`
    pub fn new(runtime: Handle, adapter: Adapter) -> Self {
        Self {
            runtime,
            adapter,
            peripherals: Mutex::new(HashMap::new()),
        }
    }

    /// Make a discovered peripheral connectable under `device`
    pub fn register(&self, device: DeviceId, peripheral: Peripheral) {
        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device, peripheral);
    }

    pub fn unregister(&self, device: &DeviceId) -> Option<Peripheral> {
        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(device)
    }
}

impl GattTransport for BtleplugTransport {
    fn connect(
        &self,
        device: &DeviceId,
        callback: Arc<dyn GattCallback>,
    ) -> Option<Arc<dyn GattHandle>> {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device)
            .cloned();
        let Some(peripheral) = peripheral else {
            warn!(device = %device, "No registered peripheral");
            return None;
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = self.runtime.spawn(run_connection(
            device.clone(),
            self.adapter.clone(),
            peripheral.clone(),
            callback,
            commands_rx,
        ));

        Some(Arc::new(BtleplugHandle {
            peripheral,
            commands: Mutex::new(Some(commands_tx)),
            task: Mutex::new(Some(task)),
        }))
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

enum Command {
    DiscoverServices,
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>, WriteType),
    WriteDescriptor(DescriptorHandle, Vec<u8>),
    ReadRssi,
    Subscribe(CharacteristicHandle, bool, oneshot::Sender<bool>),
    Disconnect,
}

struct BtleplugHandle {
    peripheral: Peripheral,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugHandle {
    fn submit(&self, command: Command) -> bool {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|commands| commands.send(command).is_ok())
            .unwrap_or(false)
    }
}

/// Block the calling thread until the connection task answers
///
/// Handle methods run on the engine's worker thread, never on the runtime.
/// A task that ends without answering counts as failure.
fn await_reply(reply: oneshot::Receiver<bool>) -> bool {
    reply.blocking_recv().unwrap_or(false)
}

impl GattHandle for BtleplugHandle {
    fn disconnect(&self) {
        self.submit(Command::Disconnect);
    }

    fn close(&self) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    fn discover_services(&self) -> bool {
        self.submit(Command::DiscoverServices)
    }

    fn services(&self) -> Vec<ServiceHandle> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| ServiceHandle {
                uuid: service.uuid,
                instance_id: 0,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(to_characteristic_handle)
                    .collect(),
            })
            .collect()
    }

    fn read_characteristic(&self, characteristic: &CharacteristicHandle) -> bool {
        self.submit(Command::Read(characteristic.clone()))
    }

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        self.submit(Command::Write(
            characteristic.clone(),
            value.to_vec(),
            write_type,
        ))
    }

    fn write_descriptor(&self, descriptor: &DescriptorHandle, value: &[u8]) -> bool {
        self.submit(Command::WriteDescriptor(descriptor.clone(), value.to_vec()))
    }

    fn request_mtu(&self, _mtu: u16) -> bool {
        // btleplug negotiates the MTU itself
        false
    }

    fn read_remote_rssi(&self) -> bool {
        self.submit(Command::ReadRssi)
    }

    /// Subscribes or unsubscribes and reports whether btleplug succeeded
    fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> bool {
        let (reply, outcome) = oneshot::channel();
        if !self.submit(Command::Subscribe(characteristic.clone(), enable, reply)) {
            return false;
        }
        await_reply(outcome)
    }
}

// ----------------------------------------------------------------------------
// Connection Task
// ----------------------------------------------------------------------------

fn to_characteristic_handle(characteristic: &Characteristic) -> CharacteristicHandle {
    CharacteristicHandle::new(characteristic.uuid, characteristic.service_uuid, 0)
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service_uuid)
}

fn find_descriptor(peripheral: &Peripheral, handle: &DescriptorHandle) -> Option<Descriptor> {
    find_characteristic(peripheral, &handle.characteristic)?
        .descriptors
        .into_iter()
        .find(|d| d.uuid == handle.uuid)
}

fn status_of<T>(result: &btleplug::Result<T>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::SUCCESS,
        Err(_) => GattStatus::FAILURE,
    }
}

/// Next item of an optional stream; pends forever once it is absent or ended
async fn next_or_pending<S>(stream: &mut Option<S>) -> S::Item
where
    S: Stream + Unpin,
{
    if let Some(items) = stream.as_mut() {
        if let Some(item) = items.next().await {
            return item;
        }
        *stream = None;
    }
    pending().await
}

/// Aborts the notification pump when the connection task ends or is aborted
struct PumpGuard(Option<JoinHandle<()>>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if let Some(pump) = self.0.take() {
            pump.abort();
        }
    }
}

async fn execute(
    device: &DeviceId,
    peripheral: &Peripheral,
    callback: &Arc<dyn GattCallback>,
    command: Command,
) {
    match command {
        Command::DiscoverServices => {
            let result = peripheral.discover_services().await;
            callback.on_services_discovered(status_of(&result));
        }
        Command::Read(handle) => match find_characteristic(peripheral, &handle) {
            Some(characteristic) => {
                let result = peripheral.read(&characteristic).await;
                let status = status_of(&result);
                let value = result.unwrap_or_default();
                callback.on_characteristic_read(&handle, &value, status);
            }
            None => callback.on_characteristic_read(&handle, &[], GattStatus::FAILURE),
        },
        Command::Write(handle, value, write_type) => {
            let status = match find_characteristic(peripheral, &handle) {
                Some(characteristic) => {
                    let write_type = match write_type {
                        WriteType::NoResponse => BtleWriteType::WithoutResponse,
                        WriteType::Default | WriteType::Signed => BtleWriteType::WithResponse,
                    };
                    status_of(&peripheral.write(&characteristic, &value, write_type).await)
                }
                None => GattStatus::FAILURE,
            };
            callback.on_characteristic_write(&handle, status);
        }
        Command::WriteDescriptor(handle, value) => {
            let status = match find_descriptor(peripheral, &handle) {
                Some(descriptor) => {
                    status_of(&peripheral.write_descriptor(&descriptor, &value).await)
                }
                None => GattStatus::FAILURE,
            };
            callback.on_descriptor_write(&handle, status);
        }
        Command::ReadRssi => {
            let rssi = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|properties| properties.rssi);
            match rssi {
                Some(rssi) => callback.on_read_remote_rssi(rssi, GattStatus::SUCCESS),
                None => callback.on_read_remote_rssi(0, GattStatus::FAILURE),
            }
        }
        Command::Subscribe(handle, enable, reply) => {
            let toggled = match find_characteristic(peripheral, &handle) {
                Some(characteristic) => {
                    let result = if enable {
                        peripheral.subscribe(&characteristic).await
                    } else {
                        peripheral.unsubscribe(&characteristic).await
                    };
                    if let Err(e) = &result {
                        warn!(device = %device, "Notification toggle failed: {}", e);
                    }
                    result.is_ok()
                }
                None => false,
            };
            let _ = reply.send(toggled);
        }
        // Handled by the connection loop
        Command::Disconnect => {}
    }
}

async fn run_connection(
    device: DeviceId,
    adapter: Adapter,
    peripheral: Peripheral,
    callback: Arc<dyn GattCallback>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    // Subscribe before connecting so an immediate drop is not missed
    let mut central: Option<CentralEvents> = match adapter.events().await {
        Ok(events) => Some(events),
        Err(e) => {
            warn!(device = %device, "Adapter events unavailable: {}", e);
            None
        }
    };

    if let Err(e) = peripheral.connect().await {
        error!(device = %device, "btleplug connect failed: {}", e);
        callback.on_connection_state_change(GattStatus::ERROR, ConnectionState::Disconnected);
        return;
    }
    info!(device = %device, "btleplug peripheral connected");
    callback.on_connection_state_change(GattStatus::SUCCESS, ConnectionState::Connected);

    let _pump = PumpGuard(match peripheral.notifications().await {
        Ok(mut notifications) => {
            let peripheral = peripheral.clone();
            let callback = callback.clone();
            Some(tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    let characteristic = peripheral
                        .characteristics()
                        .into_iter()
                        .find(|c| c.uuid == notification.uuid)
                        .map(|c| to_characteristic_handle(&c));
                    if let Some(characteristic) = characteristic {
                        callback.on_characteristic_changed(&characteristic, &notification.value);
                    }
                }
            }))
        }
        Err(e) => {
            warn!(device = %device, "Notifications unavailable: {}", e);
            None
        }
    });

    let peripheral_id = peripheral.id();
    let mut link_check = interval(LINK_CHECK_INTERVAL);
    link_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let status = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Disconnect) => {
                    callback.on_connection_state_change(
                        GattStatus::SUCCESS,
                        ConnectionState::Disconnecting,
                    );
                    if let Err(e) = peripheral.disconnect().await {
                        warn!(device = %device, "btleplug disconnect failed: {}", e);
                    }
                    break GattStatus::SUCCESS;
                }
                Some(command) => execute(&device, &peripheral, &callback, command).await,
                None => break GattStatus::SUCCESS,
            },
            event = next_or_pending(&mut central) => {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!(device = %device, "Peripheral dropped the link");
                        break GattStatus::ERROR;
                    }
                }
            }
            _ = link_check.tick() => {
                if !peripheral.is_connected().await.unwrap_or(false) {
                    warn!(device = %device, "Peripheral no longer connected");
                    break GattStatus::ERROR;
                }
            }
        }
    };

    debug!(device = %device, "btleplug connection task finished");
    callback.on_connection_state_change(status, ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_next_or_pending_yields_items_then_pends() {
        let mut events = Some(stream::iter(vec![1, 2]));
        assert_eq!(next_or_pending(&mut events).await, 1);
        assert_eq!(next_or_pending(&mut events).await, 2);

        let ended = timeout(Duration::from_millis(20), next_or_pending(&mut events)).await;
        assert!(ended.is_err());
        assert!(events.is_none());
    }

    #[tokio::test]
    async fn test_missing_stream_pends() {
        let mut events: Option<stream::Iter<std::vec::IntoIter<u8>>> = None;
        let result = timeout(Duration::from_millis(20), next_or_pending(&mut events)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_reply_reports_outcome() {
        let (reply, outcome) = oneshot::channel();
        let answer = std::thread::spawn(move || reply.send(true));
        assert!(await_reply(outcome));
        assert!(answer.join().unwrap().is_ok());
    }

    #[test]
    fn test_unanswered_reply_is_failure() {
        let (reply, outcome) = oneshot::channel::<bool>();
        drop(reply);
        assert!(!await_reply(outcome));
    }
}
