//! Serialized GATT request/response engine
//!
//! This crate turns a callback-based BLE GATT transport into an awaitable,
//! strictly serialized client API.
//!
//! ## Architecture
//!
//! - [`callback`] - adapter receiving transport callbacks and routing them
//!   into a state cell, a single-slot response cell and a change stream
//! - [`worker`] - the dedicated thread every transport call runs on
//! - [`gatt`] - the engine holding one request in flight at a time
//! - [`device`] - connection establishment
//! - [`decorators`] - the [`GattIo`] capability trait and its wrappers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink_ble::{connect_gatt, ConnectGattResult};
//! use gattlink_core::{CharacteristicHandle, DeviceId, GattConfig, GattTransport, Uuid};
//!
//! # async fn example(transport: Arc<dyn GattTransport>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = GattConfig::new();
//! let gatt = connect_gatt(transport, DeviceId::new("C0:FF:EE:00:00:01"), &config)
//!     .await
//!     .into_result()?;
//!
//! gatt.discover_services().await?;
//! let battery = CharacteristicHandle::new(Uuid::from_u128(0x2A19), Uuid::from_u128(0x180F), 0);
//! let read = gatt.read_characteristic(&battery).await?;
//! println!("battery: {:?} ({})", read.value, read.status);
//!
//! gatt.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! With the `btleplug` feature, [`BtleplugTransport`] drives real
//! peripherals through btleplug.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod callback;
pub mod decorators;
pub mod device;
pub mod gatt;
pub mod worker;

#[cfg(feature = "btleplug")]
mod btleplug_transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use callback::{CallbackAdapter, ChangeSubscription};
pub use decorators::{GattIo, GattIoExt, PayloadTransform, TransformingGatt};
pub use device::{connect_gatt, ConnectGattResult, GattDevice};
pub use gatt::Gatt;
pub use worker::GattWorker;

#[cfg(feature = "btleplug")]
pub use btleplug_transport::BtleplugTransport;
