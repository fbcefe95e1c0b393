use thiserror::Error;

/// Top-level error type for the `centra-api` crate.
///
/// Covers every failure mode across both channels: authentication, HTTP
/// transport, the push socket, and payload decoding. `centra-core` maps
/// these into consumer-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login rejected (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Login temporarily blocked after repeated network failures.
    ///
    /// No network attempt was made; retry after the indicated delay.
    #[error("Login blocked by backoff -- retry after {retry_after_secs}s")]
    AuthBackoff { retry_after_secs: u64 },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A correlated request got no response before its deadline.
    #[error("Operation {operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Push socket ─────────────────────────────────────────────────
    /// The push socket could not be opened or the handshake failed.
    #[error("Socket connection failed: {0}")]
    SocketConnect(String),

    /// A pending connect attempt was aborted by `disconnect()`.
    #[error("Connection attempt aborted")]
    ConnectAborted,

    /// The connection closed while a request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A push-channel call was issued while disconnected.
    #[error("Push channel is not connected")]
    NotConnected,

    // ── Data ────────────────────────────────────────────────────────
    /// The controller returned an operation-level error.
    #[error("Operation {operation} failed: {message}")]
    Api { operation: String, message: String },

    /// Malformed or unexpected message shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates auth has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. }
            | Self::SocketConnect(_)
            | Self::ConnectionClosed
            | Self::NotConnected
            | Self::AuthBackoff { .. } => true,
            _ => false,
        }
    }
}
