//! Builder pattern for gateway construction.
//!
//! Provides a fluent API wiring configuration, the directory service and the
//! command executor into a [`Gateway`].
//!
//! # Example
//!
//! ```ignore
//! use ocpp_gateway::{Gateway, KeepAliveMode, StaticDirectory};
//!
//! let gateway = Gateway::builder()
//!     .listen_addr("0.0.0.0:8010".parse()?)
//!     .keep_alive(KeepAliveMode::Active)
//!     .directory(StaticDirectory::new())
//!     .executor(MyExecutor)
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::services::{CommandExecutor, DirectoryService};

use super::{GatewayConfig, KeepAliveMode};

// ============================================================================
// GatewayBuilder
// ============================================================================

/// Builder for configuring a [`Gateway`].
///
/// Use [`Gateway::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct GatewayBuilder {
    /// Operational settings.
    config: GatewayConfig,
    /// Identity resolution.
    directory: Option<Arc<dyn DirectoryService>>,
    /// CALL handling.
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("config", &self.config)
            .field("directory", &self.directory.is_some())
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

// ============================================================================
// GatewayBuilder Implementation
// ============================================================================

impl GatewayBuilder {
    /// Creates a builder with default configuration and no collaborators.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the WebSocket listen address.
    #[inline]
    #[must_use]
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Enables the health endpoint on `addr`.
    #[inline]
    #[must_use]
    pub fn health_addr(mut self, addr: SocketAddr) -> Self {
        self.config.health_addr = Some(addr);
        self
    }

    /// Selects the keep-alive mechanism.
    #[inline]
    #[must_use]
    pub fn keep_alive(mut self, mode: KeepAliveMode) -> Self {
        self.config.keep_alive = mode;
        self
    }

    /// Sets the correlation timeout for outgoing CALLs.
    #[inline]
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the directory service.
    #[inline]
    #[must_use]
    pub fn directory(self, directory: impl DirectoryService + 'static) -> Self {
        self.directory_arc(Arc::new(directory))
    }

    /// Sets a shared directory service.
    #[inline]
    #[must_use]
    pub fn directory_arc(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Sets the command executor.
    #[inline]
    #[must_use]
    pub fn executor(self, executor: impl CommandExecutor + 'static) -> Self {
        self.executor_arc(Arc::new(executor))
    }

    /// Sets a shared command executor.
    #[inline]
    #[must_use]
    pub fn executor_arc(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds the gateway with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the directory or executor is not set
    /// - [`Error::Config`] if the configuration is invalid
    pub fn build(self) -> Result<Arc<Gateway>> {
        self.config.validate()?;
        let directory = self.validate_directory()?;
        let executor = self.validate_executor()?;

        Ok(Gateway::new(self.config, directory, executor))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl GatewayBuilder {
    fn validate_directory(&self) -> Result<Arc<dyn DirectoryService>> {
        self.directory.clone().ok_or_else(|| {
            Error::config(
                "Directory service is required. Use .directory() to set it.\n\
                 Example: Gateway::builder().directory(StaticDirectory::new())",
            )
        })
    }

    fn validate_executor(&self) -> Result<Arc<dyn CommandExecutor>> {
        self.executor.clone().ok_or_else(|| {
            Error::config(
                "Command executor is required. Use .executor() to set it.\n\
                 Example: Gateway::builder().executor(MyExecutor)",
            )
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::services::{CommandContext, CommandError, StaticDirectory};

    struct Echo;

    #[async_trait]
    impl CommandExecutor for Echo {
        async fn execute(
            &self,
            _ctx: &CommandContext,
            _command: &str,
            payload: Value,
        ) -> std::result::Result<Value, CommandError> {
            Ok(payload)
        }
    }

    #[test]
    fn test_new_uses_default_config() {
        let builder = GatewayBuilder::new();
        assert_eq!(builder.config, GatewayConfig::default());
        assert!(builder.directory.is_none());
        assert!(builder.executor.is_none());
    }

    #[test]
    fn test_setters_update_config() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let builder = GatewayBuilder::new()
            .listen_addr(addr)
            .keep_alive(KeepAliveMode::Active)
            .call_timeout(Duration::from_secs(3));

        assert_eq!(builder.config.listen_addr, addr);
        assert_eq!(builder.config.keep_alive, KeepAliveMode::Active);
        assert_eq!(builder.config.call_timeout_ms, 3_000);
    }

    #[test]
    fn test_call_timeout_saturates() {
        let builder = GatewayBuilder::new().call_timeout(Duration::MAX);
        assert_eq!(builder.config.call_timeout_ms, u64::MAX);
    }

    #[test]
    fn test_build_fails_without_directory() {
        let err = GatewayBuilder::new().executor(Echo).build().unwrap_err();
        assert!(err.to_string().contains("Directory"));
    }

    #[test]
    fn test_build_fails_without_executor() {
        let err = GatewayBuilder::new()
            .directory(StaticDirectory::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("executor"));
    }

    #[test]
    fn test_build_validates_config() {
        let config = GatewayConfig {
            ping_failure_threshold: 0,
            ..Default::default()
        };
        let err = GatewayBuilder::new()
            .config(config)
            .directory(StaticDirectory::new())
            .executor(Echo)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_succeeds() {
        let gateway = GatewayBuilder::new()
            .directory(StaticDirectory::new())
            .executor(Echo)
            .build()
            .unwrap();
        assert!(gateway.registry().is_empty());
    }
}
