//! gattlink keep-alive runtime
//!
//! This crate keeps logical GATT connections alive on top of the
//! request/response engine from `gattlink-ble`:
//! - [`KeepAliveGatt`]: a supervised connection that reconnects after drops,
//!   re-runs its on-connect action and keeps characteristic subscribers
//!   attached across physical connections
//! - [`GattRegistry`]: an application-owned map of supervised connections
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink_runtime::{KeepAliveEvent, KeepAliveGatt};
//! use gattlink_core::{DeviceId, GattTransport, KeepAliveConfig};
//!
//! # async fn example(transport: Arc<dyn GattTransport>) -> Result<(), Box<dyn std::error::Error>> {
//! let gatt = KeepAliveGatt::builder(transport, DeviceId::new("C0:FF:EE:00:00:01"))
//!     .config(KeepAliveConfig::new())
//!     .on_connect(|gatt| async move { gatt.discover_services().await })
//!     .on_event(|event| async move {
//!         if let KeepAliveEvent::Disconnected { connection_attempt, .. } = event {
//!             println!("attempt {} ended", connection_attempt);
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//!
//! gatt.connect()?;
//! # Ok(())
//! # }
//! ```

pub mod keep_alive;
pub mod registry;

pub use keep_alive::{
    EventHandler, KeepAliveEvent, KeepAliveGatt, KeepAliveGattBuilder, KeepAliveState, OnConnect,
};
pub use registry::GattRegistry;
