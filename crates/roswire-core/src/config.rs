// ── Runtime connection configuration ──
//
// These types describe *how* to reach a device. They carry credential data
// and connection tuning, but never touch disk -- the consuming layer owns
// persistence and hands tuples in at startup or add-time.

use std::time::Duration;

use secrecy::SecretString;

use crate::device::Generation;

pub use roswire_proto::{TlsMode, TransportConfig};

/// Plaintext API port.
pub const DEFAULT_API_PORT: u16 = 8728;
/// API-over-TLS port.
pub const DEFAULT_API_TLS_PORT: u16 = 8729;

/// Everything needed to connect to and authenticate with one device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Hostname or address of the device.
    pub host: String,
    /// API port; [`DEFAULT_API_PORT`] unless TLS is enabled.
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Generation hint. [`Generation::Unknown`] means detect by probing
    /// after the first successful login; a concrete value skips the probe
    /// and picks the login handshake directly.
    pub generation: Generation,
    /// Socket and timeout tuning.
    pub transport: TransportConfig,
}

impl DeviceConfig {
    /// Config for a plaintext connection with generation auto-detection.
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_API_PORT,
            username: username.into(),
            password,
            generation: Generation::Unknown,
            transport: TransportConfig::default(),
        }
    }

    /// Switch to the TLS port. Routers ship self-signed certificates, so
    /// verification is off unless tightened through `transport.tls`.
    pub fn with_tls(mut self) -> Self {
        self.port = DEFAULT_API_TLS_PORT;
        self.transport.tls = TlsMode::DangerAcceptInvalid;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Pin the device generation, skipping auto-detection.
    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }
}

/// Tuning for the reconnect supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often each tracked device is probed.
    pub probe_interval: Duration,
    /// Deadline for one health probe.
    pub probe_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the backoff delay.
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DeviceConfig::new("192.168.88.1", "admin", SecretString::from(String::new()));
        assert_eq!(config.port, DEFAULT_API_PORT);
        assert_eq!(config.generation, Generation::Unknown);

        let config = config.with_tls();
        assert_eq!(config.port, DEFAULT_API_TLS_PORT);
        assert!(matches!(config.transport.tls, TlsMode::DangerAcceptInvalid));
    }

    #[test]
    fn debug_output_redacts_the_password() {
        let config = DeviceConfig::new("10.0.0.1", "admin", SecretString::from("hunter2".to_string()));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"), "{rendered}");
    }
}
