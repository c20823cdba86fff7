//! gattlink core vocabulary
//!
//! This crate provides the types shared by the GATT request/response engine
//! and the keep-alive supervisor:
//!
//! - [`types`] - connection states, statuses, write types, attribute handles
//! - [`events`] - structured records of every transport callback
//! - [`errors`] - the [`GattError`] taxonomy
//! - [`transport`] - the traits a BLE stack implements
//! - [`config`] - engine and supervisor configuration
//! - [`logging`] - callback logging observers
//!
//! With the `testing` feature, [`testing`] offers an in-memory transport.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{GattConfig, KeepAliveConfig};
pub use errors::{ConfigError, GattError, GattOperation, GattResult};
pub use events::{
    CallbackEvent, CallbackSummary, CharacteristicChanged, CharacteristicRead,
    CharacteristicWrite, ConnectionStateChange, DescriptorWrite, GattResponse, MtuChanged,
    RemoteRssiRead, ResponseKind, ServicesDiscovered,
};
pub use logging::{GattLogger, LogLevel, NoOpLogger, TracingLogger};
pub use transport::{GattCallback, GattHandle, GattTransport};
pub use types::{
    CharacteristicHandle, ConnectionState, DescriptorHandle, DeviceId, GattStatus,
    ServiceHandle, WriteType,
};

pub use uuid::Uuid;
