//! Bus configuration for development and production environments
//!
//! Pre-configured settings for different deployment scenarios with validation
//! and builder support. Unknown keys are rejected at load time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::domain_types::OverflowPolicy;
use crate::domain_types::{ChannelCapacity, MaxRetries, RetryDelayMs};

/// Configuration errors
#[derive(Debug, Error)]
pub enum BusConfigError {
    /// A field failed cross-field validation
    #[error("Invalid configuration: {field} - {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// File could not be read or written
    #[error("I/O error: {source}")]
    Io {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed; unknown keys land here
    #[error("Serialization error: {source}")]
    Serialization {
        /// Underlying error
        #[from]
        source: serde_json::Error,
    },
}

/// Complete bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Capacity of the five-band message queue (per-bus, not per-band)
    pub message_queue_capacity: ChannelCapacity,
    /// Capacity of the delivery-outcome queue
    pub delivery_queue_capacity: ChannelCapacity,
    /// Capacity of the event queue
    pub event_queue_capacity: ChannelCapacity,
    /// Policy applied when a queue hits its high-watermark
    pub overflow_policy: OverflowPolicy,
    /// High-watermark fraction of capacity at which `Send` starts rejecting
    pub high_watermark: f64,

    /// Number of message-processing workers
    pub worker_count: usize,
    /// Maximum accepted payload size in bytes
    pub max_payload_bytes: usize,
    /// Bound on the message-id uniqueness window
    pub id_window_size: usize,

    /// Default retry attempts when a message carries no policy
    pub default_max_retries: MaxRetries,
    /// Default delay before the first retry
    pub default_retry_delay: RetryDelayMs,

    /// Dead letter queue bound
    pub dead_letter_capacity: usize,

    /// Whether delivery records of terminal sends are persisted
    pub persist_deliveries: bool,
    /// Emit bus lifecycle events (dispatched/acked/failed)
    pub emit_lifecycle_events: bool,
}

impl BusConfig {
    /// Development configuration: small queues, fast feedback
    ///
    /// # Panics
    /// Panics if hardcoded values are out of range for their domain types.
    #[must_use]
    pub fn development() -> Self {
        Self {
            message_queue_capacity: ChannelCapacity::try_new(1_000).unwrap(),
            delivery_queue_capacity: ChannelCapacity::try_new(1_000).unwrap(),
            event_queue_capacity: ChannelCapacity::try_new(2_000).unwrap(),
            overflow_policy: OverflowPolicy::Reject,
            high_watermark: 0.9,
            worker_count: 2,
            max_payload_bytes: 1_048_576,
            id_window_size: 10_000,
            default_max_retries: MaxRetries::try_new(2).unwrap(),
            default_retry_delay: RetryDelayMs::try_new(500).unwrap(),
            dead_letter_capacity: 10_000,
            persist_deliveries: false,
            emit_lifecycle_events: true,
        }
    }

    /// Production configuration: throughput-oriented
    ///
    /// # Panics
    /// Panics if hardcoded values are out of range for their domain types.
    #[must_use]
    pub fn production() -> Self {
        Self {
            message_queue_capacity: ChannelCapacity::try_new(100_000).unwrap(),
            delivery_queue_capacity: ChannelCapacity::try_new(50_000).unwrap(),
            event_queue_capacity: ChannelCapacity::try_new(100_000).unwrap(),
            overflow_policy: OverflowPolicy::DropLowestPriority,
            high_watermark: 0.95,
            worker_count: 8,
            max_payload_bytes: 10_485_760,
            id_window_size: 1_000_000,
            default_max_retries: MaxRetries::try_new(3).unwrap(),
            default_retry_delay: RetryDelayMs::try_new(1_000).unwrap(),
            dead_letter_capacity: 1_000_000,
            persist_deliveries: true,
            emit_lifecycle_events: true,
        }
    }

    /// Testing configuration: single worker, tiny windows
    ///
    /// # Panics
    /// Panics if hardcoded values are out of range for their domain types.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            message_queue_capacity: ChannelCapacity::try_new(500).unwrap(),
            delivery_queue_capacity: ChannelCapacity::try_new(500).unwrap(),
            event_queue_capacity: ChannelCapacity::try_new(500).unwrap(),
            overflow_policy: OverflowPolicy::Reject,
            high_watermark: 1.0,
            worker_count: 1,
            max_payload_bytes: 65_536,
            id_window_size: 1_000,
            default_max_retries: MaxRetries::try_new(1).unwrap(),
            default_retry_delay: RetryDelayMs::try_new(10).unwrap(),
            dead_letter_capacity: 100,
            persist_deliveries: false,
            emit_lifecycle_events: true,
        }
    }

    /// Creates a configuration builder starting from development defaults
    #[must_use]
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::new()
    }

    /// Validates the configuration for consistency
    ///
    /// # Errors
    /// Returns `BusConfigError::Validation` on inconsistent values.
    pub fn validate(&self) -> Result<(), BusConfigError> {
        if !(0.1..=1.0).contains(&self.high_watermark) {
            return Err(BusConfigError::Validation {
                field: "high_watermark".to_string(),
                reason: "must be within [0.1, 1.0]".to_string(),
            });
        }
        if self.worker_count == 0 {
            return Err(BusConfigError::Validation {
                field: "worker_count".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker_count > num_cpus::get() * 4 {
            return Err(BusConfigError::Validation {
                field: "worker_count".to_string(),
                reason: format!("should not exceed 4x CPU cores ({})", num_cpus::get() * 4),
            });
        }
        if self.max_payload_bytes == 0 {
            return Err(BusConfigError::Validation {
                field: "max_payload_bytes".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.id_window_size < self.message_queue_capacity.as_usize() {
            return Err(BusConfigError::Validation {
                field: "id_window_size".to_string(),
                reason: "must be at least the message queue capacity".to_string(),
            });
        }
        if self.dead_letter_capacity == 0 {
            return Err(BusConfigError::Validation {
                field: "dead_letter_capacity".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Loads configuration from a JSON file, rejecting unknown keys
    ///
    /// # Errors
    /// Returns `BusConfigError` on I/O, parse, or validation failure.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, BusConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a JSON file
    ///
    /// # Errors
    /// Returns `BusConfigError` on I/O or serialization failure.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), BusConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Builder for custom bus configurations
#[derive(Debug)]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl BusConfigBuilder {
    /// Creates a new builder starting with development defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: BusConfig::development(),
        }
    }

    /// Sets the message queue capacity
    #[must_use]
    pub fn message_queue_capacity(mut self, capacity: ChannelCapacity) -> Self {
        self.config.message_queue_capacity = capacity;
        self
    }

    /// Sets the event queue capacity
    #[must_use]
    pub fn event_queue_capacity(mut self, capacity: ChannelCapacity) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Sets the overflow policy
    #[must_use]
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = policy;
        self
    }

    /// Sets the worker count
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Sets the maximum payload size
    #[must_use]
    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_payload_bytes = bytes;
        self
    }

    /// Sets the dead letter queue capacity
    #[must_use]
    pub fn dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.config.dead_letter_capacity = capacity;
        self
    }

    /// Enables or disables delivery persistence
    #[must_use]
    pub fn persist_deliveries(mut self, enable: bool) -> Self {
        self.config.persist_deliveries = enable;
        self
    }

    /// Builds and validates the configuration
    ///
    /// # Errors
    /// Returns `BusConfigError::Validation` on inconsistent values.
    pub fn build(self) -> Result<BusConfig, BusConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for BusConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert!(BusConfig::development().validate().is_ok());
        assert!(BusConfig::production().validate().is_ok());
        assert!(BusConfig::testing().validate().is_ok());
    }

    #[test]
    fn builder_applies_overrides() {
        let config = BusConfig::builder()
            .message_queue_capacity(ChannelCapacity::try_new(5_000).unwrap())
            .overflow_policy(OverflowPolicy::DropOldest)
            .build()
            .unwrap();
        assert_eq!(config.message_queue_capacity.as_usize(), 5_000);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn validation_rejects_small_id_window() {
        let result = BusConfig::builder()
            .message_queue_capacity(ChannelCapacity::try_new(100_000).unwrap())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let json = r#"{"message_queue_capacity":1000,"unknown_knob":5}"#;
        let parsed: Result<BusConfig, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }
}
