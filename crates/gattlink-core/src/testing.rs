//! In-memory transport for tests
//!
//! [`FakeTransport`] hands out [`FakeHandle`]s that record every request and
//! can answer them through a scripted [`Responder`]. Callbacks fire
//! synchronously on the calling thread unless a test drives them itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::events::ConnectionStateChange;
use crate::transport::{GattCallback, GattHandle, GattTransport};
use crate::types::{
    CharacteristicHandle, ConnectionState, DescriptorHandle, DeviceId, GattStatus,
    ServiceHandle, WriteType,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// A request recorded by a [`FakeHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeRequest {
    DiscoverServices,
    ReadCharacteristic(CharacteristicHandle),
    WriteCharacteristic {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    WriteDescriptor {
        descriptor: DescriptorHandle,
        value: Vec<u8>,
    },
    RequestMtu(u16),
    ReadRemoteRssi,
    SetCharacteristicNotification {
        characteristic: CharacteristicHandle,
        enable: bool,
    },
}

/// Answers a request by driving the callback
pub type Responder = Arc<dyn Fn(&FakeRequest, &dyn GattCallback) + Send + Sync>;

/// Responder answering every request with `GattStatus::SUCCESS`
///
/// Reads return the characteristic's instance id as little-endian bytes so
/// tests can tell answers apart.
pub fn success_responder() -> Responder {
    Arc::new(|request: &FakeRequest, callback: &dyn GattCallback| match request {
        FakeRequest::DiscoverServices => callback.on_services_discovered(GattStatus::SUCCESS),
        FakeRequest::ReadCharacteristic(characteristic) => callback.on_characteristic_read(
            characteristic,
            &characteristic.instance_id.to_le_bytes(),
            GattStatus::SUCCESS,
        ),
        FakeRequest::WriteCharacteristic { characteristic, .. } => {
            callback.on_characteristic_write(characteristic, GattStatus::SUCCESS)
        }
        FakeRequest::WriteDescriptor { descriptor, .. } => {
            callback.on_descriptor_write(descriptor, GattStatus::SUCCESS)
        }
        FakeRequest::RequestMtu(mtu) => callback.on_mtu_changed(*mtu, GattStatus::SUCCESS),
        FakeRequest::ReadRemoteRssi => callback.on_read_remote_rssi(-60, GattStatus::SUCCESS),
        FakeRequest::SetCharacteristicNotification { .. } => {}
    })
}

// ----------------------------------------------------------------------------
// Fake Handle
// ----------------------------------------------------------------------------

/// Behaviour shared by every handle a [`FakeTransport`] creates
#[derive(Clone)]
pub struct HandleOptions {
    /// Whether requests are accepted
    pub accept_requests: bool,
    /// Whether `disconnect()` reports `Disconnected` through the callback
    pub report_disconnect: bool,
    pub responder: Option<Responder>,
    pub services: Vec<ServiceHandle>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            accept_requests: true,
            report_disconnect: true,
            responder: None,
            services: Vec::new(),
        }
    }
}

/// Recording [`GattHandle`]
pub struct FakeHandle {
    device: DeviceId,
    callback: Arc<dyn GattCallback>,
    accept_requests: AtomicBool,
    report_disconnect: AtomicBool,
    responder: Mutex<Option<Responder>>,
    services: Mutex<Vec<ServiceHandle>>,
    requests: Mutex<Vec<FakeRequest>>,
    disconnect_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl FakeHandle {
    pub fn new(device: DeviceId, callback: Arc<dyn GattCallback>, options: HandleOptions) -> Self {
        Self {
            device,
            callback,
            accept_requests: AtomicBool::new(options.accept_requests),
            report_disconnect: AtomicBool::new(options.report_disconnect),
            responder: Mutex::new(options.responder),
            services: Mutex::new(options.services),
            requests: Mutex::new(Vec::new()),
            disconnect_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The callback registered at connect time
    pub fn callback(&self) -> Arc<dyn GattCallback> {
        self.callback.clone()
    }

    pub fn set_accept_requests(&self, accept: bool) {
        self.accept_requests.store(accept, Ordering::SeqCst);
    }

    pub fn set_report_disconnect(&self, report: bool) {
        self.report_disconnect.store(report, Ordering::SeqCst);
    }

    pub fn set_responder(&self, responder: Option<Responder>) {
        *lock(&self.responder) = responder;
    }

    pub fn requests(&self) -> Vec<FakeRequest> {
        lock(&self.requests).clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Report a state transition as the stack would
    pub fn report_state(&self, status: GattStatus, state: ConnectionState) {
        self.callback.on_connection_state_change(status, state);
    }

    /// Simulate the peripheral dropping the link
    pub fn simulate_disconnect(&self, status: GattStatus) {
        self.report_state(status, ConnectionState::Disconnected);
    }

    fn submit(&self, request: FakeRequest) -> bool {
        lock(&self.requests).push(request.clone());
        if !self.accept_requests.load(Ordering::SeqCst) {
            return false;
        }
        let responder = lock(&self.responder).clone();
        if let Some(responder) = responder {
            responder(&request, self.callback.as_ref());
        }
        true
    }
}

impl GattHandle for FakeHandle {
    fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.report_disconnect.load(Ordering::SeqCst) {
            self.report_state(GattStatus::SUCCESS, ConnectionState::Disconnected);
        }
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn discover_services(&self) -> bool {
        self.submit(FakeRequest::DiscoverServices)
    }

    fn services(&self) -> Vec<ServiceHandle> {
        lock(&self.services).clone()
    }

    fn read_characteristic(&self, characteristic: &CharacteristicHandle) -> bool {
        self.submit(FakeRequest::ReadCharacteristic(characteristic.clone()))
    }

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        self.submit(FakeRequest::WriteCharacteristic {
            characteristic: characteristic.clone(),
            value: value.to_vec(),
            write_type,
        })
    }

    fn write_descriptor(&self, descriptor: &DescriptorHandle, value: &[u8]) -> bool {
        self.submit(FakeRequest::WriteDescriptor {
            descriptor: descriptor.clone(),
            value: value.to_vec(),
        })
    }

    fn request_mtu(&self, mtu: u16) -> bool {
        self.submit(FakeRequest::RequestMtu(mtu))
    }

    fn read_remote_rssi(&self) -> bool {
        self.submit(FakeRequest::ReadRemoteRssi)
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> bool {
        self.submit(FakeRequest::SetCharacteristicNotification {
            characteristic: characteristic.clone(),
            enable,
        })
    }
}

// ----------------------------------------------------------------------------
// Fake Transport
// ----------------------------------------------------------------------------

/// What the next `connect` call does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Return no handle
    Reject,
    /// Return a handle and optionally report a state change right away
    Accept(Option<ConnectionStateChange>),
}

impl ConnectBehavior {
    /// Accept and report a successful connection
    pub fn connected() -> Self {
        Self::Accept(Some(ConnectionStateChange::new(
            GattStatus::SUCCESS,
            ConnectionState::Connected,
        )))
    }

    /// Accept and leave the connection pending
    pub fn pending() -> Self {
        Self::Accept(None)
    }
}

/// Recording [`GattTransport`]
pub struct FakeTransport {
    scripted: Mutex<VecDeque<ConnectBehavior>>,
    fallback: Mutex<ConnectBehavior>,
    options: Mutex<HandleOptions>,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    connect_calls: AtomicUsize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Transport that connects successfully on every call
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ConnectBehavior::connected()),
            options: Mutex::new(HandleOptions::default()),
            handles: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
        }
    }

    /// Queue behaviours consumed by the next `connect` calls, in order
    pub fn script(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        lock(&self.scripted).extend(behaviors);
    }

    /// Behaviour once the script is exhausted
    pub fn set_fallback(&self, behavior: ConnectBehavior) {
        *lock(&self.fallback) = behavior;
    }

    /// Options applied to handles created from now on
    pub fn set_handle_options(&self, options: HandleOptions) {
        *lock(&self.options) = options;
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        lock(&self.handles).clone()
    }

    pub fn last_handle(&self) -> Option<Arc<FakeHandle>> {
        lock(&self.handles).last().cloned()
    }
}

impl GattTransport for FakeTransport {
    fn connect(
        &self,
        device: &DeviceId,
        callback: Arc<dyn GattCallback>,
    ) -> Option<Arc<dyn GattHandle>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.scripted)
            .pop_front()
            .unwrap_or_else(|| *lock(&self.fallback));

        match behavior {
            ConnectBehavior::Reject => None,
            ConnectBehavior::Accept(report) => {
                let options = lock(&self.options).clone();
                let handle = Arc::new(FakeHandle::new(device.clone(), callback, options));
                lock(&self.handles).push(handle.clone());
                if let Some(change) = report {
                    handle.report_state(change.status, change.new_state);
                }
                Some(handle)
            }
        }
    }
}
