//! Core types for GATT communication
//!
//! Connection states, operation statuses, write types and the opaque handles
//! through which services, characteristics and descriptors are addressed.

use core::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Identity of a remote peripheral (platform address or opaque identifier)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Whether the link is going or gone
    pub fn is_disconnecting_or_disconnected(&self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

// ----------------------------------------------------------------------------
// Operation Status
// ----------------------------------------------------------------------------

/// Status code attached to every GATT operation outcome
///
/// `GattStatus::SUCCESS` is the only value meaning success; every other code
/// is a failure whose meaning is defined by the transport or the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x0000);
    pub const READ_NOT_PERMITTED: Self = Self(0x0002);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x0003);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x0005);
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x0006);
    pub const INVALID_OFFSET: Self = Self(0x0007);
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(0x000D);
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x000F);
    /// Generic link-level error reported by most stacks when a connection fails
    pub const ERROR: Self = Self(0x0085);
    pub const CONNECTION_CONGESTED: Self = Self(0x008F);
    pub const FAILURE: Self = Self(0x0101);

    /// Whether this status reports success
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Raw status code
    pub fn code(&self) -> u16 {
        self.0
    }

    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::SUCCESS => "GATT_SUCCESS",
            Self::READ_NOT_PERMITTED => "GATT_READ_NOT_PERMITTED",
            Self::WRITE_NOT_PERMITTED => "GATT_WRITE_NOT_PERMITTED",
            Self::INSUFFICIENT_AUTHENTICATION => "GATT_INSUFFICIENT_AUTHENTICATION",
            Self::REQUEST_NOT_SUPPORTED => "GATT_REQUEST_NOT_SUPPORTED",
            Self::INVALID_OFFSET => "GATT_INVALID_OFFSET",
            Self::INVALID_ATTRIBUTE_LENGTH => "GATT_INVALID_ATTRIBUTE_LENGTH",
            Self::INSUFFICIENT_ENCRYPTION => "GATT_INSUFFICIENT_ENCRYPTION",
            Self::ERROR => "GATT_ERROR",
            Self::CONNECTION_CONGESTED => "GATT_CONNECTION_CONGESTED",
            Self::FAILURE => "GATT_FAILURE",
            _ => return None,
        };
        Some(name)
    }
}

impl Default for GattStatus {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "GattStatus(0x{:04x})", self.0),
        }
    }
}

impl From<u16> for GattStatus {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

// ----------------------------------------------------------------------------
// Write Type
// ----------------------------------------------------------------------------

/// How a characteristic write is carried over the air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteType {
    /// Write request, acknowledged by the peripheral
    #[default]
    Default,
    /// Write command, not acknowledged
    NoResponse,
    /// Authenticated signed write
    Signed,
}

// ----------------------------------------------------------------------------
// Attribute Handles
// ----------------------------------------------------------------------------

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub characteristics: Vec<CharacteristicHandle>,
}

/// A characteristic of a discovered service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub instance_id: u16,
}

impl CharacteristicHandle {
    pub fn new(uuid: Uuid, service_uuid: Uuid, instance_id: u16) -> Self {
        Self {
            uuid,
            service_uuid,
            instance_id,
        }
    }
}

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uuid, self.instance_id)
    }
}

/// A descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorHandle {
    pub uuid: Uuid,
    pub characteristic: CharacteristicHandle,
}

impl DescriptorHandle {
    pub fn new(uuid: Uuid, characteristic: CharacteristicHandle) -> Self {
        Self {
            uuid,
            characteristic,
        }
    }
}

impl fmt::Display for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uuid, self.characteristic)
    }
}
