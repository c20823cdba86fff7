//! Error types for GATT communication
//!
//! [`GattError`] is the single error type surfaced by the request/response
//! engine, connection establishment and the keep-alive supervisor.
//! Errors are `Clone` so that one connection loss can be handed to every
//! waiter that was aborted by it.

use core::fmt;

use crate::events::{ConnectionStateChange, ResponseKind};
use crate::types::GattStatus;

// ----------------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------------

/// The operation an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattOperation {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    WriteDescriptor,
    RequestMtu,
    ReadRemoteRssi,
    SetCharacteristicNotification,
}

impl GattOperation {
    /// The response kind that completes this operation, if any
    pub fn expected_response(&self) -> Option<ResponseKind> {
        match self {
            Self::DiscoverServices => Some(ResponseKind::ServicesDiscovered),
            Self::ReadCharacteristic => Some(ResponseKind::CharacteristicRead),
            Self::WriteCharacteristic => Some(ResponseKind::CharacteristicWrite),
            Self::WriteDescriptor => Some(ResponseKind::DescriptorWrite),
            Self::RequestMtu => Some(ResponseKind::MtuChanged),
            Self::ReadRemoteRssi => Some(ResponseKind::RemoteRssiRead),
            Self::Connect | Self::Disconnect | Self::SetCharacteristicNotification => None,
        }
    }
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::DiscoverServices => "discover services",
            Self::ReadCharacteristic => "read characteristic",
            Self::WriteCharacteristic => "write characteristic",
            Self::WriteDescriptor => "write descriptor",
            Self::RequestMtu => "request MTU",
            Self::ReadRemoteRssi => "read remote RSSI",
            Self::SetCharacteristicNotification => "set characteristic notification",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by GATT operations and connection management
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GattError {
    #[error("Transport rejected {operation}")]
    Rejected { operation: GattOperation },

    #[error("Connection lost{}", describe_cause(.cause))]
    ConnectionLost {
        cause: Option<ConnectionStateChange>,
    },

    #[error("{operation} failed with status {status}")]
    StatusFailure {
        operation: GattOperation,
        status: GattStatus,
    },

    #[error("Out-of-order callback: expected {expected}, received {received}")]
    OutOfOrderCallback {
        expected: ResponseKind,
        received: ResponseKind,
    },

    #[error("Not ready: no active GATT connection")]
    NotReady,

    #[error("Connection failed: {event}")]
    ConnectionFailed { event: ConnectionStateChange },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Payload transform failed: {reason}")]
    Transform { reason: String },
}

fn describe_cause(cause: &Option<ConnectionStateChange>) -> String {
    match cause {
        Some(change) => format!(": {}", change),
        None => String::new(),
    }
}

impl GattError {
    pub fn rejected(operation: GattOperation) -> Self {
        Self::Rejected { operation }
    }

    pub fn connection_lost(cause: Option<ConnectionStateChange>) -> Self {
        Self::ConnectionLost { cause }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn transform(reason: impl Into<String>) -> Self {
        Self::Transform {
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by the link going away
    ///
    /// The keep-alive supervisor treats these as an ordinary disconnect and
    /// reconnects, rather than stopping.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::ConnectionFailed { .. }
        )
    }
}

/// Result alias for GATT operations
pub type GattResult<T> = core::result::Result<T, GattError>;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
