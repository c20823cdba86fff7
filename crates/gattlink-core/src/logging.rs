//! Callback Logging Infrastructure
//!
//! Structured logging of every transport callback and engine request. The
//! logger is an explicit dependency carried by [`GattConfig`](crate::GattConfig)
//! rather than a process-wide singleton.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::GattOperation;
use crate::events::{CallbackEvent, CallbackSummary};
use crate::types::DeviceId;

// ----------------------------------------------------------------------------
// Log Levels
// ----------------------------------------------------------------------------

/// Log levels for GATT logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ----------------------------------------------------------------------------
// Logger Trait
// ----------------------------------------------------------------------------

/// Observer for GATT traffic
pub trait GattLogger: Send + Sync + fmt::Debug {
    /// A transport callback arrived
    fn log_callback(&self, device: &DeviceId, event: &CallbackEvent);

    /// A request is about to be handed to the transport
    fn log_request(&self, device: &DeviceId, operation: GattOperation);

    /// Notifications were dropped for a subscriber that fell behind
    fn log_drop(&self, device: &DeviceId, dropped: u64, reason: &str);

    fn log_event(&self, device: &DeviceId, level: LogLevel, message: &str);
}

/// Logger forwarding to `tracing`
#[derive(Debug, Clone)]
pub struct TracingLogger {
    min_level: LogLevel,
}

impl TracingLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(LogLevel::Trace)
    }
}

impl GattLogger for TracingLogger {
    fn log_callback(&self, device: &DeviceId, event: &CallbackEvent) {
        if !self.should_log(LogLevel::Trace) {
            return;
        }
        tracing::trace!(
            device = %device,
            callback = %event.name(),
            "← {}",
            event.summary()
        );
    }

    fn log_request(&self, device: &DeviceId, operation: GattOperation) {
        if !self.should_log(LogLevel::Debug) {
            return;
        }
        tracing::debug!(device = %device, "→ {}", operation);
    }

    fn log_drop(&self, device: &DeviceId, dropped: u64, reason: &str) {
        if !self.should_log(LogLevel::Warn) {
            return;
        }
        tracing::warn!(device = %device, dropped, "✗ {}", reason);
    }

    fn log_event(&self, device: &DeviceId, level: LogLevel, message: &str) {
        if !self.should_log(level) {
            return;
        }
        match level {
            LogLevel::Trace => tracing::trace!(device = %device, "{}", message),
            LogLevel::Debug => tracing::debug!(device = %device, "{}", message),
            LogLevel::Info => tracing::info!(device = %device, "{}", message),
            LogLevel::Warn => tracing::warn!(device = %device, "{}", message),
            LogLevel::Error => tracing::error!(device = %device, "{}", message),
        }
    }
}

/// No-op logger for when logging is disabled
#[derive(Debug, Clone)]
pub struct NoOpLogger;

impl GattLogger for NoOpLogger {
    fn log_callback(&self, _device: &DeviceId, _event: &CallbackEvent) {}

    fn log_request(&self, _device: &DeviceId, _operation: GattOperation) {}

    fn log_drop(&self, _device: &DeviceId, _dropped: u64, _reason: &str) {}

    fn log_event(&self, _device: &DeviceId, _level: LogLevel, _message: &str) {}
}

pub fn default_logger() -> Arc<dyn GattLogger> {
    Arc::new(TracingLogger::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        let logger = TracingLogger::new(LogLevel::Warn);
        assert!(!logger.should_log(LogLevel::Debug));
        assert!(!logger.should_log(LogLevel::Info));
        assert!(logger.should_log(LogLevel::Warn));
        assert!(logger.should_log(LogLevel::Error));
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Trace.to_string(), "TRACE");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }
}
