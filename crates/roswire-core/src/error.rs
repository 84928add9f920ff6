// ── Core error taxonomy ──
//
// Caller-facing errors from roswire-core. Consumers never see raw socket
// or framing failures directly; the `From<roswire_proto::Error>` impl
// translates transport errors into the taxonomy callers branch on.
//
// Only connection-level failures feed the reconnect machinery; the rest
// (auth, capability, device rejections) are surfaced and never retried.

use thiserror::Error;

use crate::device::Generation;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection-level (reconnect-eligible) ────────────────────────
    /// Socket, DNS, TLS, or timeout failure.
    #[error("cannot reach device: {message}")]
    Connectivity { message: String },

    /// Malformed frame or reply shape; the connection was torn down and
    /// only a fresh connection can recover.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    // ── Surfaced, never auto-retried ─────────────────────────────────
    /// The device rejected the credentials.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The operation does not exist on this device generation.
    #[error("{operation} is not supported on a {generation} device")]
    Capability {
        operation: String,
        generation: Generation,
    },

    /// The device returned an error reply for the command, passed through
    /// with its own message and category.
    #[error("device rejected the command: {message}")]
    Device {
        message: String,
        category: Option<String>,
    },

    // ── Registry ─────────────────────────────────────────────────────
    #[error("no device named '{name}'")]
    DeviceNotFound { name: String },

    #[error("device '{name}' already exists")]
    DeviceExists { name: String },
}

impl CoreError {
    /// Returns `true` for failures the reconnect supervisor reacts to.
    ///
    /// Protocol violations count: the connection is already gone by the
    /// time the caller sees the error.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Protocol { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<roswire_proto::Error> for CoreError {
    fn from(err: roswire_proto::Error) -> Self {
        match err {
            roswire_proto::Error::Io(_)
            | roswire_proto::Error::ConnectionClosed
            | roswire_proto::Error::Timeout { .. }
            | roswire_proto::Error::Tls(_) => CoreError::Connectivity {
                message: err.to_string(),
            },
            roswire_proto::Error::Decode { .. } | roswire_proto::Error::SentenceTooLarge { .. } => {
                CoreError::Protocol {
                    message: err.to_string(),
                }
            }
            roswire_proto::Error::Authentication { message } => CoreError::Auth { message },
            roswire_proto::Error::Trap {
                message, category, ..
            } => CoreError::Device { message, category },
            roswire_proto::Error::Fatal { message } => CoreError::Device {
                message,
                category: None,
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
