//! Gateway configuration.
//!
//! All operational knobs (timeouts, keep-alive, lock budget, frame limits)
//! live in [`GatewayConfig`] and can be loaded from TOML.
//!
//! # Example
//!
//! ```ignore
//! use ocpp_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_toml_str(r#"
//!     listen_addr = "0.0.0.0:8010"
//!     keep_alive = "active"
//!     ping_failure_threshold = 5
//! "#)?;
//! ```
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`GatewayConfig`] | Operational settings |
//! | [`KeepAliveMode`] | Passive transport pings or active sweeps |
//! | [`GatewayBuilder`] | Fluent builder wiring config and collaborators |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder for [`crate::Gateway`].
pub mod builder;

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::GatewayBuilder;

// ============================================================================
// Constants
// ============================================================================

/// Default WebSocket listen port.
const DEFAULT_PORT: u16 = 8010;

// ============================================================================
// KeepAliveMode
// ============================================================================

/// How dead connections are detected.
///
/// Only one mechanism runs at a time to avoid double keep-alive traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAliveMode {
    /// Each socket task pings on its own and only timestamps are tracked.
    #[default]
    Passive,
    /// A periodic sweep probes every registered session and evicts
    /// connections that fail too many consecutive probes.
    Active,
}

// ============================================================================
// GatewayConfig
// ============================================================================

/// Operational settings of the gateway.
///
/// Durations are expressed in milliseconds so the TOML stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,

    /// Address of the health endpoint, disabled when `None`.
    pub health_addr: Option<SocketAddr>,

    /// Path prefix for charging stations.
    pub device_path_prefix: String,

    /// Sub-protocol required on the device path.
    pub device_subprotocol: String,

    /// Path prefix for management clients.
    pub management_path_prefix: String,

    /// Sub-protocol required on the management path.
    pub management_subprotocol: String,

    /// Correlation timeout for outgoing CALLs.
    pub call_timeout_ms: u64,

    /// Maximum outgoing CALLs in flight per session.
    pub max_pending_requests: usize,

    /// Keep-alive mechanism.
    pub keep_alive: KeepAliveMode,

    /// Passive ping interval, or active sweep interval.
    pub ping_interval_ms: u64,

    /// How long a probe waits for the pong.
    pub probe_timeout_ms: u64,

    /// Consecutive failed probes before a connection is evicted.
    pub ping_failure_threshold: u32,

    /// Silence after which a connection is closed.
    pub idle_timeout_ms: u64,

    /// Request-Lock waits before proceeding without the lock.
    pub lock_retry_count: u32,

    /// Maximum time of a single Request-Lock wait.
    pub lock_retry_interval_ms: u64,

    /// Consecutive lock budget exhaustions that raise a capacity alarm.
    pub lock_alarm_threshold: u32,

    /// Maximum incoming frame and message size in bytes.
    pub max_frame_size: usize,

    /// Outbound frames buffered per connection.
    pub outbound_queue_capacity: usize,

    /// Remaining queue slots below which a send reports backpressure.
    pub backpressure_watermark: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            health_addr: None,
            device_path_prefix: "/OCPP16".to_string(),
            device_subprotocol: "ocpp1.6".to_string(),
            management_path_prefix: "/REST".to_string(),
            management_subprotocol: "rest".to_string(),
            call_timeout_ms: 10_000,
            max_pending_requests: 100,
            keep_alive: KeepAliveMode::Passive,
            ping_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            ping_failure_threshold: 3,
            idle_timeout_ms: 300_000,
            lock_retry_count: 10,
            lock_retry_interval_ms: 500,
            lock_alarm_threshold: 10,
            max_frame_size: 65_536,
            outbound_queue_capacity: 256,
            backpressure_watermark: 32,
        }
    }
}

// ============================================================================
// GatewayConfig - Loading
// ============================================================================

impl GatewayConfig {
    /// Parses and validates a TOML document. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Toml`] if the document does not parse
    /// - [`Error::Config`] if a value is out of range
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - otherwise as [`GatewayConfig::from_toml_str`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        for (name, prefix) in [
            ("device_path_prefix", &self.device_path_prefix),
            ("management_path_prefix", &self.management_path_prefix),
        ] {
            if prefix.len() < 2 || !prefix.starts_with('/') || prefix.ends_with('/') {
                return Err(Error::config(format!(
                    "{name} must look like \"/NAME\", got {prefix:?}"
                )));
            }
        }
        if self.device_path_prefix == self.management_path_prefix {
            return Err(Error::config(
                "device_path_prefix and management_path_prefix must differ",
            ));
        }
        if self.device_subprotocol.is_empty() || self.management_subprotocol.is_empty() {
            return Err(Error::config("sub-protocols must not be empty"));
        }

        for (name, value) in [
            ("call_timeout_ms", self.call_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("lock_retry_interval_ms", self.lock_retry_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }
        if self.ping_failure_threshold == 0 {
            return Err(Error::config("ping_failure_threshold must be at least 1"));
        }
        if self.lock_alarm_threshold == 0 {
            return Err(Error::config("lock_alarm_threshold must be at least 1"));
        }
        if self.max_pending_requests == 0 {
            return Err(Error::config("max_pending_requests must be at least 1"));
        }
        if self.max_frame_size == 0 {
            return Err(Error::config("max_frame_size must be greater than zero"));
        }
        if self.ping_interval_ms >= self.idle_timeout_ms {
            return Err(Error::config(format!(
                "ping_interval_ms ({}) must be below idle_timeout_ms ({})",
                self.ping_interval_ms, self.idle_timeout_ms
            )));
        }
        if self.backpressure_watermark >= self.outbound_queue_capacity {
            return Err(Error::config(format!(
                "backpressure_watermark ({}) must be below outbound_queue_capacity ({})",
                self.backpressure_watermark, self.outbound_queue_capacity
            )));
        }

        Ok(())
    }
}

// ============================================================================
// GatewayConfig - Durations
// ============================================================================

impl GatewayConfig {
    /// Correlation timeout for outgoing CALLs.
    #[inline]
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Passive ping or active sweep interval.
    #[inline]
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Probe pong wait.
    #[inline]
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Idle timeout.
    #[inline]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Single Request-Lock wait.
    #[inline]
    #[must_use]
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr.port(), 8010);
        assert_eq!(config.device_subprotocol, "ocpp1.6");
        assert_eq!(config.keep_alive, KeepAliveMode::Passive);
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml_partial_keeps_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            listen_addr = "127.0.0.1:9000"
            keep_alive = "active"
            ping_failure_threshold = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.keep_alive, KeepAliveMode::Active);
        assert_eq!(config.ping_failure_threshold, 5);
        assert_eq!(config.lock_retry_count, 10);
    }

    #[test]
    fn test_from_toml_rejects_unknown_mode() {
        let err = GatewayConfig::from_toml_str(r#"keep_alive = "sometimes""#).unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = GatewayConfig {
            probe_timeout_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("probe_timeout_ms"));
    }

    #[test]
    fn test_validate_ping_interval_below_idle() {
        let config = GatewayConfig {
            ping_interval_ms: 10_000,
            idle_timeout_ms: 5_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_prefixes() {
        let config = GatewayConfig {
            management_path_prefix: "/OCPP16".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            device_path_prefix: "OCPP16/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_watermark() {
        let config = GatewayConfig {
            outbound_queue_capacity: 8,
            backpressure_watermark: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "call_timeout_ms = 2500").unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_from_missing_file() {
        let err = GatewayConfig::from_file("/nonexistent/gateway.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
