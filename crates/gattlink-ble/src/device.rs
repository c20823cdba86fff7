//! Connection establishment
//!
//! [`GattDevice`] pairs a transport with a device identity. Each call to
//! [`GattDevice::connect`] starts one physical connection attempt with a
//! fresh callback adapter and worker, and resolves once the attempt reaches a
//! terminal state.

use std::sync::Arc;

use gattlink_core::{
    ConnectionState, DeviceId, GattConfig, GattError, GattOperation, GattTransport,
};
use tracing::{debug, error, info, warn};

use crate::callback::CallbackAdapter;
use crate::gatt::Gatt;
use crate::worker::GattWorker;

// ----------------------------------------------------------------------------
// Connection Result
// ----------------------------------------------------------------------------

/// Outcome of one connection attempt
pub enum ConnectGattResult {
    /// Connected; the engine is ready for requests
    Success(Gatt),
    /// The transport refused to start connecting
    Rejected(GattError),
    /// The attempt started but did not reach `Connected`
    Failure(GattError),
}

impl ConnectGattResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Convert into a `Result`, dropping the rejected/failed distinction
    pub fn into_result(self) -> Result<Gatt, GattError> {
        match self {
            Self::Success(gatt) => Ok(gatt),
            Self::Rejected(error) | Self::Failure(error) => Err(error),
        }
    }
}

impl std::fmt::Debug for ConnectGattResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(gatt) => f.debug_tuple("Success").field(gatt.device()).finish(),
            Self::Rejected(error) => f.debug_tuple("Rejected").field(error).finish(),
            Self::Failure(error) => f.debug_tuple("Failure").field(error).finish(),
        }
    }
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

/// A peripheral reachable through a transport
#[derive(Clone)]
pub struct GattDevice {
    transport: Arc<dyn GattTransport>,
    id: DeviceId,
}

impl GattDevice {
    pub fn new(transport: Arc<dyn GattTransport>, id: DeviceId) -> Self {
        Self { transport, id }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Establish one physical connection
    ///
    /// If the returned future is dropped while the attempt is pending, the
    /// half-open engine is dropped with it, which closes the transport
    /// handle and the worker.
    pub async fn connect(&self, config: &GattConfig) -> ConnectGattResult {
        let adapter = Arc::new(CallbackAdapter::new(self.id.clone(), config));

        let worker = match GattWorker::spawn(format!("{}-{}", config.worker_thread_name, self.id))
        {
            Ok(worker) => worker,
            Err(e) => {
                error!(device = %self.id, "Failed to start GATT worker: {}", e);
                return ConnectGattResult::Rejected(GattError::rejected(GattOperation::Connect));
            }
        };

        debug!(device = %self.id, "Connecting");
        let handle = match self.transport.connect(&self.id, adapter.clone()) {
            Some(handle) => handle,
            None => {
                warn!(device = %self.id, "Transport rejected connection");
                worker.close();
                return ConnectGattResult::Rejected(GattError::rejected(GattOperation::Connect));
            }
        };
        adapter.attach(handle.clone());

        let gatt = Gatt::new(
            self.id.clone(),
            handle,
            adapter,
            worker,
            config.logger.clone(),
        );

        let mut state = gatt.state();
        let outcome = state
            .wait_for(|change| {
                !change.status.is_success()
                    || matches!(
                        change.new_state,
                        ConnectionState::Connected | ConnectionState::Disconnected
                    )
            })
            .await
            .map(|change| *change);

        match outcome {
            Ok(change)
                if change.status.is_success()
                    && change.new_state == ConnectionState::Connected =>
            {
                info!(device = %self.id, "Connected");
                ConnectGattResult::Success(gatt)
            }
            Ok(change) => {
                warn!(device = %self.id, "Connection failed: {}", change);
                gatt.close();
                ConnectGattResult::Failure(GattError::ConnectionFailed { event: change })
            }
            Err(_) => {
                gatt.close();
                ConnectGattResult::Failure(GattError::connection_lost(None))
            }
        }
    }
}

/// Establish one physical connection to `device` through `transport`
pub async fn connect_gatt(
    transport: Arc<dyn GattTransport>,
    device: DeviceId,
    config: &GattConfig,
) -> ConnectGattResult {
    GattDevice::new(transport, device).connect(config).await
}
