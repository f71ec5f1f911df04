//! SCCP engine configuration
//!
//! Only engine policy lives here. The translation table and the concerned
//! subsystem relation are handed to the stack as snapshots by an external
//! loader (see [`crate::sccp::SccpStack::reload_translation_table`]).

use crate::errors::{Result, SccpError};
use crate::types::PointCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete SCCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SccpConfig {
    /// Stack name, used in logs
    pub name: String,
    /// Local point code
    pub local_point_code: PointCode,
    /// Hop counter for originated XUDT messages (1-15)
    pub hop_counter: u8,
    /// Largest user data carried in a single UDT/segment
    pub max_segment_size: usize,
    /// Capacity of each notification channel
    pub event_channel_capacity: usize,
    /// Reassembly configuration
    pub reassembly: ReassemblyConfig,
    /// SCCP management configuration
    pub management: ManagementConfig,
    /// Local delivery configuration
    pub delivery: DeliveryConfig,
}

/// Reassembly cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Reassembly timer (T reass) in milliseconds
    pub timeout_ms: u64,
    /// Maximum number of in-progress reassemblies
    pub max_entries: usize,
    /// Maximum reassembled message length
    pub max_message_length: usize,
}

/// SCCP management (SCMG) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Initial subsystem status test interval in milliseconds
    pub sst_interval_ms: u64,
    /// Upper bound of the status test interval in milliseconds
    pub sst_interval_max_ms: u64,
    /// Interval multiplier applied once the anti-flap threshold is reached
    pub sst_backoff_factor: f64,
    /// Consecutive failed status tests before the interval backs off
    pub anti_flap_threshold: u32,
}

/// Local delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-subsystem delivery queue capacity
    pub queue_capacity: usize,
    /// Bounded wait for draining a subsystem on unregister/stop (ms)
    pub drain_timeout_ms: u64,
}

impl Default for SccpConfig {
    fn default() -> Self {
        Self {
            name: "sccp".to_string(),
            local_point_code: PointCode(1001),
            hop_counter: 15,
            max_segment_size: 200,
            event_channel_capacity: 1024,
            reassembly: ReassemblyConfig::default(),
            management: ManagementConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_entries: 10_000,
            max_message_length: 3952,
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            sst_interval_ms: 10_000,
            sst_interval_max_ms: 600_000,
            sst_backoff_factor: 1.5,
            anti_flap_threshold: 3,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            drain_timeout_ms: 5_000,
        }
    }
}

impl SccpConfig {
    /// Load configuration from a file, with `SCCP__*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("SCCP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SccpError::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| SccpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.local_point_code.value() > PointCode::ITU_MAX {
            return Err(SccpError::Config(format!(
                "local point code {} exceeds 14 bits",
                self.local_point_code
            )));
        }
        if self.hop_counter == 0 || self.hop_counter > 15 {
            return Err(SccpError::Config("hop_counter must be 1-15".to_string()));
        }
        if self.max_segment_size == 0 || self.max_segment_size > 255 {
            return Err(SccpError::Config("max_segment_size must be 1-255".to_string()));
        }
        if self.reassembly.max_entries == 0 || self.delivery.queue_capacity == 0 {
            return Err(SccpError::Config("capacities must be non-zero".to_string()));
        }
        if self.event_channel_capacity == 0 {
            return Err(SccpError::Config("event_channel_capacity must be non-zero".to_string()));
        }
        if self.management.sst_backoff_factor < 1.0 {
            return Err(SccpError::Config("sst_backoff_factor must be >= 1.0".to_string()));
        }
        Ok(())
    }

    /// Get reassembly timer as Duration
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly.timeout_ms)
    }

    /// Get initial status test interval as Duration
    pub fn sst_interval(&self) -> Duration {
        Duration::from_millis(self.management.sst_interval_ms)
    }

    /// Get maximum status test interval as Duration
    pub fn sst_interval_max(&self) -> Duration {
        Duration::from_millis(self.management.sst_interval_max_ms)
    }

    /// Get drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SccpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.management.anti_flap_threshold, 3);
        assert_eq!(config.reassembly_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SccpConfig = serde_json::from_str(
            r#"{ "local_point_code": 42, "management": { "anti_flap_threshold": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.local_point_code, PointCode(42));
        assert_eq!(config.management.anti_flap_threshold, 5);
        assert_eq!(config.management.sst_interval_ms, 10_000);
        assert_eq!(config.delivery.queue_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_wide_point_code() {
        let config = SccpConfig {
            local_point_code: PointCode(0x4000),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SccpError::Config(_))));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(SccpConfig::from_file("/nonexistent/sccp-config").is_err());
    }
}
