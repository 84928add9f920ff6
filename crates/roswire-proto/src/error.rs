use thiserror::Error;

use crate::sentence::{Reply, RowMap};

/// Top-level error type for the `roswire-proto` crate.
///
/// Covers every failure mode of the transport layer: socket I/O, TLS,
/// frame decoding, the login handshake, and error replies from the device.
/// `roswire-core` maps these into its caller-facing taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level failure (connect refused, reset, DNS, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is closed; the exchange cannot complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// An exchange did not complete within its deadline.
    #[error("timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Framing ─────────────────────────────────────────────────────
    /// Malformed frame; the byte stream can no longer be trusted.
    #[error("protocol decode error: {reason}")]
    Decode { reason: String },

    /// A sentence exceeded the configured size limit.
    #[error("sentence of {size} bytes exceeds the {max} byte limit")]
    SentenceTooLarge { size: usize, max: usize },

    // ── Login ───────────────────────────────────────────────────────
    /// The device rejected the credentials.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    // ── Device replies ──────────────────────────────────────────────
    /// `!trap` — the command failed; the full reply attributes are kept
    /// so callers see exactly what the device said.
    #[error("device error: {message}")]
    Trap {
        message: String,
        category: Option<String>,
        attrs: RowMap,
    },

    /// `!fatal` — the device is terminating the session.
    #[error("fatal device error: {message}")]
    Fatal { message: String },
}

impl Error {
    /// Build a [`Trap`](Self::Trap) error from a parsed `!trap` reply.
    pub(crate) fn from_trap(reply: Reply) -> Self {
        let message = reply
            .message()
            .map_or_else(|| flatten_attrs(&reply.attrs), ToString::to_string);
        Self::Trap {
            message,
            category: reply.category().map(ToString::to_string),
            attrs: reply.attrs,
        }
    }

    /// Build a [`Fatal`](Self::Fatal) error from a parsed `!fatal` reply.
    pub(crate) fn from_fatal(reply: &Reply) -> Self {
        let message = if reply.attrs.is_empty() {
            "session terminated".to_string()
        } else {
            flatten_attrs(&reply.attrs)
        };
        Self::Fatal { message }
    }

    /// Returns `true` for connection-level failures -- the kind the
    /// reconnect machinery reacts to. Decode errors count: the stream is
    /// torn down and only a fresh connection can recover.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::Tls(_)
                | Self::Decode { .. }
                | Self::SentenceTooLarge { .. }
        )
    }

    /// Returns `true` if the device rejected the credentials.
    /// Never worth an automatic retry.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Render reply attributes as `key=value` pairs for error messages when
/// the device did not include a `message` attribute.
fn flatten_attrs(attrs: &RowMap) -> String {
    if attrs.is_empty() {
        return "(no details)".to_string();
    }
    attrs
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(" ")
}
