//! Keep-alive supervision
//!
//! A [`KeepAliveGatt`] is a logical connection to one device that outlives
//! its physical connections. A control loop, spawned once at construction,
//! owns at most one [`Gatt`] engine at a time and cycles through
//!
//! 1. connect, retrying failed attempts after `retry_delay`
//! 2. run the on-connect action against the new engine
//! 3. publish `Connected` and wait for the link to drop, a disconnect request
//!    or cancellation
//! 4. disconnect gracefully within `disconnect_timeout`, then force-close
//! 5. publish `Disconnected` and start over
//!
//! Characteristic changes of every engine are forwarded onto one
//! supervisor-owned stream, so subscribers survive reconnects.

use std::fmt;
use std::future::{pending, Future};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use gattlink_ble::{ChangeSubscription, ConnectGattResult, Gatt, GattDevice, GattIo};
use gattlink_core::{
    CharacteristicChanged, CharacteristicHandle, CharacteristicRead, CharacteristicWrite,
    ConfigError, ConnectionStateChange, DescriptorHandle, DescriptorWrite, DeviceId, GattError,
    GattLogger, GattResult, GattTransport, KeepAliveConfig, LogLevel, MtuChanged,
    RemoteRssiRead, ServiceHandle, WriteType,
};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Action run against every freshly connected engine before it is published
pub type OnConnect = Arc<dyn Fn(Arc<Gatt>) -> BoxFuture<'static, GattResult<()>> + Send + Sync>;

/// Handler run inline for every lifecycle event
pub type EventHandler =
    Arc<dyn Fn(KeepAliveEvent) -> BoxFuture<'static, GattResult<()>> + Send + Sync>;

// ----------------------------------------------------------------------------
// State and Events
// ----------------------------------------------------------------------------

/// Externally observed state of a keep-alive connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveState {
    Connecting,
    Connected,
    Disconnecting,
    /// No engine; carries the reason the last attempt ended, if any
    Disconnected(Option<GattError>),
    /// Terminal; carries the error that stopped the supervisor, if any
    Cancelled(Option<GattError>),
}

impl KeepAliveState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl fmt::Display for KeepAliveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected => f.write_str("Connected"),
            Self::Disconnecting => f.write_str("Disconnecting"),
            Self::Disconnected(None) => f.write_str("Disconnected"),
            Self::Disconnected(Some(cause)) => write!(f, "Disconnected ({})", cause),
            Self::Cancelled(None) => f.write_str("Cancelled"),
            Self::Cancelled(Some(cause)) => write!(f, "Cancelled ({})", cause),
        }
    }
}

/// Lifecycle event of a keep-alive connection
#[derive(Clone)]
pub enum KeepAliveEvent {
    /// A new engine is connected and prepared
    Connected(Arc<Gatt>),
    /// A connection attempt ended
    Disconnected {
        /// Whether `Connected` was published for this attempt
        was_connected: bool,
        /// 1-based number of the attempt that ended
        connection_attempt: u64,
    },
    /// The transport refused to connect; no retry until `connect()`
    Rejected(GattError),
}

impl fmt::Debug for KeepAliveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(gatt) => f.debug_tuple("Connected").field(gatt.device()).finish(),
            Self::Disconnected {
                was_connected,
                connection_attempt,
            } => f
                .debug_struct("Disconnected")
                .field("was_connected", was_connected)
                .field("connection_attempt", connection_attempt)
                .finish(),
            Self::Rejected(cause) => f.debug_tuple("Rejected").field(cause).finish(),
        }
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for [`KeepAliveGatt`]
pub struct KeepAliveGattBuilder {
    transport: Arc<dyn GattTransport>,
    device: DeviceId,
    config: KeepAliveConfig,
    on_connect: Option<OnConnect>,
    on_event: Option<EventHandler>,
    runtime: Option<Handle>,
}

impl KeepAliveGattBuilder {
    pub fn config(mut self, config: KeepAliveConfig) -> Self {
        self.config = config;
        self
    }

    /// Action run on every (re)connection before `Connected` is published
    ///
    /// A connection loss reported by the action starts a new attempt; any
    /// other error stops the supervisor.
    pub fn on_connect<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<Gatt>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GattResult<()>> + Send + 'static,
    {
        let action: OnConnect = Arc::new(move |gatt: Arc<Gatt>| action(gatt).boxed());
        self.on_connect = Some(action);
        self
    }

    /// Handler awaited for every lifecycle event; an error stops the supervisor
    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(KeepAliveEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GattResult<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event: KeepAliveEvent| handler(event).boxed());
        self.on_event = Some(handler);
        self
    }

    /// Runtime hosting the control loop; defaults to the current one
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the configuration and start the control loop
    pub fn build(self) -> Result<KeepAliveGatt, ConfigError> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| ConfigError::InvalidValue {
                field: "runtime",
                reason: e.to_string(),
            })?,
        };

        let (state, _) = watch::channel(KeepAliveState::Disconnected(None));
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (changed, _) = broadcast::channel(self.config.gatt.characteristic_changed_capacity);
        let (armed, armed_rx) = watch::channel(false);
        let (teardowns, teardowns_rx) = watch::channel(0u64);
        let (cancelled, cancelled_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            device: self.device,
            logger: self.config.gatt.logger.clone(),
            state,
            events,
            changed,
            current: RwLock::new(None),
            armed,
            teardowns,
            cancelled,
        });

        let supervisor = Supervisor {
            shared: shared.clone(),
            transport: self.transport,
            config: self.config,
            on_connect: self.on_connect,
            on_event: self.on_event,
            runtime: runtime.clone(),
            armed: armed_rx,
            teardowns: teardowns_rx,
            cancelled: cancelled_rx,
            attempt: 0,
        };
        debug!(device = %shared.device, "Starting keep-alive supervisor");
        runtime.spawn(supervisor.run());

        Ok(KeepAliveGatt { shared })
    }
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct Shared {
    device: DeviceId,
    logger: Arc<dyn GattLogger>,
    state: watch::Sender<KeepAliveState>,
    events: broadcast::Sender<KeepAliveEvent>,
    changed: broadcast::Sender<CharacteristicChanged>,
    current: RwLock<Option<Arc<Gatt>>>,
    /// Whether a connection is wanted
    armed: watch::Sender<bool>,
    /// Bumped by every `disconnect()`; each bump ends the running attempt
    teardowns: watch::Sender<u64>,
    cancelled: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, state: KeepAliveState) {
        self.logger.log_event(
            &self.device,
            LogLevel::Debug,
            &format!("Keep-alive state {}", state),
        );
        self.state.send_replace(state);
    }

    fn current(&self) -> Option<Arc<Gatt>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, gatt: Option<Arc<Gatt>>) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = gatt;
    }
}

// ----------------------------------------------------------------------------
// Keep-Alive Connection
// ----------------------------------------------------------------------------

/// Self-healing logical connection to one device
///
/// Dropping it cancels the supervisor, which tears down the active
/// connection in the background.
pub struct KeepAliveGatt {
    shared: Arc<Shared>,
}

impl KeepAliveGatt {
    pub fn builder(transport: Arc<dyn GattTransport>, device: DeviceId) -> KeepAliveGattBuilder {
        KeepAliveGattBuilder {
            transport,
            device,
            config: KeepAliveConfig::default(),
            on_connect: None,
            on_event: None,
            runtime: None,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    /// Ask the supervisor to establish a connection
    ///
    /// Returns `true` if this call started a new attempt and `false` if one
    /// is already running. Connection failures are reported through the
    /// state and events, not here.
    pub fn connect(&self) -> GattResult<bool> {
        if *self.shared.cancelled.borrow() {
            return Err(GattError::cancelled("keep-alive supervisor was cancelled"));
        }
        let started = self.shared.armed.send_if_modified(|armed| {
            if *armed {
                false
            } else {
                *armed = true;
                true
            }
        });
        if started {
            debug!(device = %self.shared.device, "Keep-alive connect requested");
        }
        Ok(started)
    }

    /// Tear down the current attempt or connection; `connect()` resumes
    ///
    /// A `connect()` right after still tears the current connection down
    /// before starting a new attempt.
    pub fn disconnect(&self) {
        let was_armed = self.shared.armed.send_replace(false);
        self.shared
            .teardowns
            .send_modify(|generation| *generation = generation.wrapping_add(1));
        if was_armed {
            debug!(device = %self.shared.device, "Keep-alive disconnect requested");
        }
    }

    /// Stop the supervisor for good
    pub fn cancel(&self) {
        if !self.shared.cancelled.send_replace(true) {
            info!(device = %self.shared.device, "Cancelling keep-alive supervisor");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancelled.borrow()
    }

    /// Receiver of the latest supervisor state
    pub fn state(&self) -> watch::Receiver<KeepAliveState> {
        self.shared.state.subscribe()
    }

    pub fn current_state(&self) -> KeepAliveState {
        self.shared.state.borrow().clone()
    }

    /// New receiver of lifecycle events
    pub fn events(&self) -> broadcast::Receiver<KeepAliveEvent> {
        self.shared.events.subscribe()
    }

    /// New subscription to characteristic changes across all connections
    pub fn characteristic_changed(&self) -> ChangeSubscription {
        ChangeSubscription::new(
            self.shared.device.clone(),
            self.shared.logger.clone(),
            self.shared.changed.subscribe(),
        )
    }

    /// The engine of the current physical connection, if connected
    pub fn gatt(&self) -> Option<Arc<Gatt>> {
        self.shared.current()
    }

    fn active(&self) -> GattResult<Arc<Gatt>> {
        self.shared.current().ok_or(GattError::NotReady)
    }
}

impl Drop for KeepAliveGatt {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[async_trait]
impl GattIo for KeepAliveGatt {
    async fn discover_services(&self) -> GattResult<()> {
        self.active()?.discover_services().await
    }

    fn services(&self) -> GattResult<Vec<ServiceHandle>> {
        let gatt = self.active()?;
        Ok(Gatt::services(&gatt))
    }

    async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> GattResult<CharacteristicRead> {
        self.active()?.read_characteristic(characteristic).await
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> GattResult<CharacteristicWrite> {
        self.active()?
            .write_characteristic(characteristic, value, write_type)
            .await
    }

    async fn write_descriptor(
        &self,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) -> GattResult<DescriptorWrite> {
        self.active()?.write_descriptor(descriptor, value).await
    }

    async fn request_mtu(&self, mtu: u16) -> GattResult<MtuChanged> {
        self.active()?.request_mtu(mtu).await
    }

    async fn set_characteristic_notification(
        &self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> GattResult<bool> {
        self.active()?
            .set_characteristic_notification(characteristic, enable)
            .await
    }

    async fn read_remote_rssi(&self) -> GattResult<RemoteRssiRead> {
        self.active()?.read_remote_rssi().await
    }
}

// ----------------------------------------------------------------------------
// Control Loop
// ----------------------------------------------------------------------------

/// How one connection attempt ended
enum Next {
    /// Reconnect after the retry delay
    Retry,
    /// Wait for the next `connect()`
    Idle,
}

/// Why the supervisor stopped; `Some` for a fail-stop error
type Stop = Option<GattError>;

/// What ended an established connection
enum Interrupt {
    Cancelled,
    Disconnected,
    Lost(GattError),
    Failed(GattError),
}

async fn until(flag: &mut watch::Receiver<bool>, wanted: bool) {
    let _ = flag.wait_for(|value| *value == wanted).await;
}

/// Resolves on the next `disconnect()` not yet seen by this receiver
async fn teardown_requested(teardowns: &mut watch::Receiver<u64>) {
    if teardowns.changed().await.is_err() {
        pending::<()>().await;
    }
}

async fn link_lost(
    state: &mut watch::Receiver<ConnectionStateChange>,
) -> Option<ConnectionStateChange> {
    state
        .wait_for(|change| change.new_state.is_disconnecting_or_disconnected())
        .await
        .ok()
        .map(|change| *change)
}

struct Supervisor {
    shared: Arc<Shared>,
    transport: Arc<dyn GattTransport>,
    config: KeepAliveConfig,
    on_connect: Option<OnConnect>,
    on_event: Option<EventHandler>,
    runtime: Handle,
    armed: watch::Receiver<bool>,
    teardowns: watch::Receiver<u64>,
    cancelled: watch::Receiver<bool>,
    attempt: u64,
}

impl Supervisor {
    async fn run(mut self) {
        let cause = loop {
            tokio::select! {
                biased;
                _ = until(&mut self.cancelled, true) => break None,
                _ = until(&mut self.armed, true) => {}
            }

            match self.attempt().await {
                Ok(Next::Retry) => {
                    tokio::select! {
                        biased;
                        _ = until(&mut self.cancelled, true) => break None,
                        _ = teardown_requested(&mut self.teardowns) => {}
                        _ = sleep(self.config.retry_delay) => {}
                    }
                }
                Ok(Next::Idle) => {}
                Err(stop) => break stop,
            }
        };

        match &cause {
            Some(error) => error!(device = %self.shared.device, "Keep-alive supervisor stopped: {}", error),
            None => info!(device = %self.shared.device, "Keep-alive supervisor cancelled"),
        }
        // Refuse further connect() calls before the terminal state is visible
        self.shared.cancelled.send_replace(true);
        self.shared.armed.send_replace(false);
        self.shared.set_current(None);
        self.shared.set_state(KeepAliveState::Cancelled(cause));
    }

    /// Publish an event and return the handler's completion
    fn emit(&self, event: KeepAliveEvent) -> BoxFuture<'static, GattResult<()>> {
        // No receivers is not an error
        let _ = self.shared.events.send(event.clone());
        match &self.on_event {
            Some(handler) => handler(event),
            None => async { Ok::<(), GattError>(()) }.boxed(),
        }
    }

    fn prepare(&self, gatt: Arc<Gatt>) -> BoxFuture<'static, GattResult<()>> {
        match &self.on_connect {
            Some(action) => action(gatt),
            None => async { Ok::<(), GattError>(()) }.boxed(),
        }
    }

    fn forward_changes(&self, gatt: &Gatt) -> JoinHandle<()> {
        let mut changes = gatt.characteristic_changed();
        let changed = self.shared.changed.clone();
        self.runtime.spawn(async move {
            while let Some(change) = changes.recv().await {
                let _ = changed.send(change);
            }
        })
    }

    async fn attempt(&mut self) -> Result<Next, Stop> {
        self.attempt += 1;
        let attempt = self.attempt;
        // Disconnects requested before this attempt do not end it
        let _ = self.teardowns.borrow_and_update();
        info!(device = %self.shared.device, attempt, "Keep-alive connecting");
        self.shared.set_state(KeepAliveState::Connecting);

        let device = GattDevice::new(self.transport.clone(), self.shared.device.clone());
        let result = tokio::select! {
            biased;
            _ = until(&mut self.cancelled, true) => return Err(None),
            _ = teardown_requested(&mut self.teardowns) => {
                info!(device = %self.shared.device, attempt, "Keep-alive attempt abandoned");
                return self.settle(Interrupt::Disconnected, false, attempt).await;
            }
            result = device.connect(&self.config.gatt) => result,
        };

        let gatt = match result {
            ConnectGattResult::Success(gatt) => Arc::new(gatt),
            ConnectGattResult::Rejected(cause) => {
                warn!(device = %self.shared.device, attempt, "Keep-alive connect rejected: {}", cause);
                self.shared.armed.send_replace(false);
                self.shared
                    .set_state(KeepAliveState::Disconnected(Some(cause.clone())));
                self.emit(KeepAliveEvent::Rejected(cause)).await?;
                return Ok(Next::Idle);
            }
            ConnectGattResult::Failure(cause) => {
                warn!(device = %self.shared.device, attempt, "Keep-alive connect failed: {}", cause);
                self.shared
                    .set_state(KeepAliveState::Disconnected(Some(cause)));
                self.emit(KeepAliveEvent::Disconnected {
                    was_connected: false,
                    connection_attempt: attempt,
                })
                .await?;
                return Ok(Next::Retry);
            }
        };

        // Subscribe before the on-connect action can trigger notifications
        let forwarder = self.forward_changes(&gatt);
        let mut engine_state = gatt.state();

        let preparation = self.prepare(gatt.clone());
        let prepared = tokio::select! {
            biased;
            _ = until(&mut self.cancelled, true) => Some(Interrupt::Cancelled),
            _ = teardown_requested(&mut self.teardowns) => Some(Interrupt::Disconnected),
            change = link_lost(&mut engine_state) => {
                Some(Interrupt::Lost(GattError::connection_lost(change)))
            }
            result = preparation => match result {
                Ok(()) => None,
                Err(cause) if cause.is_connection_loss() => Some(Interrupt::Lost(cause)),
                Err(cause) => Some(Interrupt::Failed(cause)),
            },
        };
        if let Some(interrupt) = prepared {
            self.teardown(gatt, forwarder).await;
            return self.settle(interrupt, false, attempt).await;
        }

        self.shared.set_current(Some(gatt.clone()));
        self.shared.set_state(KeepAliveState::Connected);
        info!(device = %self.shared.device, attempt, "Keep-alive connected");

        let delivery = self.emit(KeepAliveEvent::Connected(gatt.clone()));
        let interrupt = match delivery.await {
            Ok(()) => tokio::select! {
                biased;
                _ = until(&mut self.cancelled, true) => Interrupt::Cancelled,
                _ = teardown_requested(&mut self.teardowns) => Interrupt::Disconnected,
                change = link_lost(&mut engine_state) => {
                    Interrupt::Lost(GattError::connection_lost(change))
                }
            },
            Err(cause) => Interrupt::Failed(cause),
        };

        self.teardown(gatt, forwarder).await;
        self.settle(interrupt, true, attempt).await
    }

    /// Release the engine, gracefully if it answers in time
    async fn teardown(&self, gatt: Arc<Gatt>, forwarder: JoinHandle<()>) {
        self.shared.set_current(None);
        self.shared.set_state(KeepAliveState::Disconnecting);

        match timeout(self.config.disconnect_timeout, gatt.disconnect()).await {
            Ok(Ok(())) => debug!(device = %self.shared.device, "Keep-alive disconnected"),
            Ok(Err(e)) => {
                warn!(device = %self.shared.device, "Graceful disconnect failed: {}", e);
                gatt.close();
            }
            Err(_) => {
                warn!(
                    device = %self.shared.device,
                    timeout_ms = self.config.disconnect_timeout.as_millis() as u64,
                    "Graceful disconnect timed out, closing"
                );
                gatt.close();
            }
        }
        forwarder.abort();
    }

    async fn settle(
        &self,
        interrupt: Interrupt,
        was_connected: bool,
        attempt: u64,
    ) -> Result<Next, Stop> {
        let (cause, next) = match interrupt {
            Interrupt::Cancelled => return Err(None),
            Interrupt::Failed(cause) => return Err(Some(cause)),
            Interrupt::Disconnected => (None, Next::Idle),
            Interrupt::Lost(cause) => {
                info!(device = %self.shared.device, attempt, "Keep-alive connection lost: {}", cause);
                (Some(cause), Next::Retry)
            }
        };

        self.shared.set_state(KeepAliveState::Disconnected(cause));
        self.emit(KeepAliveEvent::Disconnected {
            was_connected,
            connection_attempt: attempt,
        })
        .await?;
        Ok(next)
    }
}
