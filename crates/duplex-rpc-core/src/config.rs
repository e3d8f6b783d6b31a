//! Centralized configuration for duplex-rpc.
//!
//! Protocol constants live on unit structs; per-endpoint settings live on
//! [`EndpointConfig`], overridable per call through [`FireOptions`].

use std::time::Duration;

/// Protocol-level configuration.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_millis(60_000);
    /// Error string sent back when a packet claims the wrong origin role.
    pub const PROTOCOL_ERROR_CODE: &'static str = "500";
    /// Error string sent back when a handler panics instead of returning.
    pub const HANDLER_PANIC_MESSAGE: &'static str = "handler panicked";
}

/// Configuration for the bundled transports.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Settings owned by one endpoint (client or server role).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Default time to wait for a matching Response.
    pub fail_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            fail_timeout: RpcConfig::DEFAULT_FAIL_TIMEOUT,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default per-call timeout.
    pub fn with_fail_timeout(mut self, fail_timeout: Duration) -> Self {
        self.fail_timeout = fail_timeout;
        self
    }
}

/// Fully parameterized call settings.
#[derive(Debug, Clone)]
pub struct FireOptions {
    pub event_name: String,
    pub fail_timeout: Duration,
}

impl FireOptions {
    pub fn new(event_name: impl Into<String>, fail_timeout: Duration) -> Self {
        Self {
            event_name: event_name.into(),
            fail_timeout,
        }
    }
}
