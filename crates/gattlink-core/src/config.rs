//! Configuration for GATT engines and keep-alive supervisors

use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::logging::{default_logger, GattLogger};

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Configuration for a single GATT connection
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GattConfig {
    /// Buffer size of the characteristic-changed stream per subscriber
    pub characteristic_changed_capacity: usize,
    /// Name prefix for the per-connection worker thread
    pub worker_thread_name: String,
    /// Observer for callbacks and requests
    #[serde(skip, default = "default_logger")]
    pub logger: Arc<dyn GattLogger>,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            characteristic_changed_capacity: 64,
            worker_thread_name: "gatt-worker".to_string(),
            logger: default_logger(),
        }
    }
}

impl GattConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set characteristic-changed buffer size
    pub fn with_characteristic_changed_capacity(mut self, capacity: usize) -> Self {
        self.characteristic_changed_capacity = capacity;
        self
    }

    /// Set worker thread name prefix
    pub fn with_worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    /// Set the callback logger
    pub fn with_logger(mut self, logger: Arc<dyn GattLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.characteristic_changed_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "characteristic_changed_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.worker_thread_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "worker_thread_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Keep-Alive Configuration
// ----------------------------------------------------------------------------

/// Configuration for a keep-alive supervisor
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeepAliveConfig {
    /// Configuration applied to every underlying connection
    pub gatt: GattConfig,
    /// Upper bound on a graceful disconnect before the handle is force closed
    pub disconnect_timeout: Duration,
    /// Pause between a failed connection attempt and the next one
    pub retry_delay: Duration,
    /// Buffer size of the lifecycle event stream
    pub event_capacity: usize,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            gatt: GattConfig::default(),
            disconnect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            event_capacity: 16,
        }
    }
}

impl KeepAliveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short timings for tests and simulations
    pub fn testing() -> Self {
        Self {
            disconnect_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// Set the per-connection configuration
    pub fn with_gatt(mut self, gatt: GattConfig) -> Self {
        self.gatt = gatt;
        self
    }

    /// Set disconnect grace period
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set delay between failed attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set lifecycle event buffer size
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gatt.validate()?;
        if self.disconnect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "disconnect_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GattConfig::default().validate().is_ok());
        assert!(KeepAliveConfig::default().validate().is_ok());
        assert!(KeepAliveConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_capacity() {
        let config = GattConfig::new().with_characteristic_changed_capacity(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "characteristic_changed_capacity",
                reason: "must be greater than zero".to_string(),
            })
        );

        let config = KeepAliveConfig::new().with_gatt(config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_disconnect_timeout() {
        let config = KeepAliveConfig::new().with_disconnect_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = KeepAliveConfig::new()
            .with_retry_delay(Duration::from_millis(250))
            .with_event_capacity(4)
            .with_gatt(GattConfig::new().with_worker_thread_name("hrm"));
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.event_capacity, 4);
        assert_eq!(config.gatt.worker_thread_name, "hrm");
    }
}
