//! Structured event records delivered by the transport
//!
//! Every asynchronous transport callback is turned into one of the records in
//! this module. Records produced in answer to a request are grouped into
//! [`GattResponse`]; unsolicited notifications travel as
//! [`CharacteristicChanged`].

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::{CharacteristicHandle, ConnectionState, DescriptorHandle, GattStatus};

// ----------------------------------------------------------------------------
// Connection Events
// ----------------------------------------------------------------------------

/// A reported connection state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateChange {
    pub status: GattStatus,
    pub new_state: ConnectionState,
}

impl ConnectionStateChange {
    pub fn new(status: GattStatus, new_state: ConnectionState) -> Self {
        Self { status, new_state }
    }
}

impl fmt::Display for ConnectionStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.new_state, self.status)
    }
}

// ----------------------------------------------------------------------------
// Response Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesDiscovered {
    pub status: GattStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicRead {
    pub characteristic: CharacteristicHandle,
    pub value: Vec<u8>,
    pub status: GattStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicWrite {
    pub characteristic: CharacteristicHandle,
    pub status: GattStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorWrite {
    pub descriptor: DescriptorHandle,
    pub status: GattStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtuChanged {
    pub mtu: u16,
    pub status: GattStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRssiRead {
    pub rssi: i16,
    pub status: GattStatus,
}

/// Unsolicited value change pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicChanged {
    pub characteristic: CharacteristicHandle,
    pub value: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Response Envelope
// ----------------------------------------------------------------------------

/// The answer to exactly one issued request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattResponse {
    ServicesDiscovered(ServicesDiscovered),
    CharacteristicRead(CharacteristicRead),
    CharacteristicWrite(CharacteristicWrite),
    DescriptorWrite(DescriptorWrite),
    MtuChanged(MtuChanged),
    RemoteRssiRead(RemoteRssiRead),
}

/// Discriminant of a [`GattResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    ServicesDiscovered,
    CharacteristicRead,
    CharacteristicWrite,
    DescriptorWrite,
    MtuChanged,
    RemoteRssiRead,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServicesDiscovered => "ServicesDiscovered",
            Self::CharacteristicRead => "CharacteristicRead",
            Self::CharacteristicWrite => "CharacteristicWrite",
            Self::DescriptorWrite => "DescriptorWrite",
            Self::MtuChanged => "MtuChanged",
            Self::RemoteRssiRead => "RemoteRssiRead",
        };
        f.write_str(name)
    }
}

impl GattResponse {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::ServicesDiscovered(_) => ResponseKind::ServicesDiscovered,
            Self::CharacteristicRead(_) => ResponseKind::CharacteristicRead,
            Self::CharacteristicWrite(_) => ResponseKind::CharacteristicWrite,
            Self::DescriptorWrite(_) => ResponseKind::DescriptorWrite,
            Self::MtuChanged(_) => ResponseKind::MtuChanged,
            Self::RemoteRssiRead(_) => ResponseKind::RemoteRssiRead,
        }
    }

    pub fn status(&self) -> GattStatus {
        match self {
            Self::ServicesDiscovered(r) => r.status,
            Self::CharacteristicRead(r) => r.status,
            Self::CharacteristicWrite(r) => r.status,
            Self::DescriptorWrite(r) => r.status,
            Self::MtuChanged(r) => r.status,
            Self::RemoteRssiRead(r) => r.status,
        }
    }
}

// ----------------------------------------------------------------------------
// Callback Events
// ----------------------------------------------------------------------------

/// Any transport callback, as seen by loggers and observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    ConnectionStateChange(ConnectionStateChange),
    Response(GattResponse),
    CharacteristicChanged(CharacteristicChanged),
}

impl CallbackEvent {
    /// Short variant name used in log lines
    pub fn name(&self) -> String {
        match self {
            Self::ConnectionStateChange(_) => "ConnectionStateChange".to_string(),
            Self::Response(response) => response.kind().to_string(),
            Self::CharacteristicChanged(_) => "CharacteristicChanged".to_string(),
        }
    }
}

/// Human readable one-line summary for log output
pub trait CallbackSummary {
    fn summary(&self) -> String;
}

impl CallbackSummary for CallbackEvent {
    fn summary(&self) -> String {
        match self {
            Self::ConnectionStateChange(change) => format!("state:{}", change),
            Self::Response(response) => response.summary(),
            Self::CharacteristicChanged(changed) => format!(
                "char:{} value:{}",
                changed.characteristic,
                hex::encode(&changed.value)
            ),
        }
    }
}

impl CallbackSummary for GattResponse {
    fn summary(&self) -> String {
        match self {
            Self::ServicesDiscovered(r) => format!("status:{}", r.status),
            Self::CharacteristicRead(r) => format!(
                "char:{} value:{} status:{}",
                r.characteristic,
                hex::encode(&r.value),
                r.status
            ),
            Self::CharacteristicWrite(r) => {
                format!("char:{} status:{}", r.characteristic, r.status)
            }
            Self::DescriptorWrite(r) => format!("desc:{} status:{}", r.descriptor, r.status),
            Self::MtuChanged(r) => format!("mtu:{} status:{}", r.mtu, r.status),
            Self::RemoteRssiRead(r) => format!("rssi:{} status:{}", r.rssi, r.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn characteristic() -> CharacteristicHandle {
        CharacteristicHandle::new(Uuid::from_u128(0x2A37), Uuid::from_u128(0x180D), 1)
    }

    #[test]
    fn test_response_kind_and_status() {
        let response = GattResponse::CharacteristicRead(CharacteristicRead {
            characteristic: characteristic(),
            value: vec![0xAB],
            status: GattStatus::READ_NOT_PERMITTED,
        });
        assert_eq!(response.kind(), ResponseKind::CharacteristicRead);
        assert_eq!(response.status(), GattStatus::READ_NOT_PERMITTED);
    }

    #[test]
    fn test_callback_summary() {
        let event = CallbackEvent::CharacteristicChanged(CharacteristicChanged {
            characteristic: characteristic(),
            value: vec![0xde, 0xad],
        });
        assert_eq!(event.name(), "CharacteristicChanged");
        assert!(event.summary().ends_with("value:dead"));

        let event = CallbackEvent::Response(GattResponse::MtuChanged(MtuChanged {
            mtu: 185,
            status: GattStatus::SUCCESS,
        }));
        assert_eq!(event.name(), "MtuChanged");
        assert_eq!(event.summary(), "mtu:185 status:GATT_SUCCESS");
    }
}
