// ── Core error types ──
//
// Consumer-facing errors from centra-core. These are NOT wire-specific --
// consumers never see HTTP status codes or JSON parse failures directly.
// The `From<centra_api::Error>` impl translates transport-layer errors
// into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach controller: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Authentication throttled -- retry after {retry_after_secs}s")]
    AuthThrottled { retry_after_secs: u64 },

    #[error("Controller disconnected")]
    Disconnected,

    #[error("Operation {operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("API error: {message}")]
    Api { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<centra_api::Error> for CoreError {
    fn from(err: centra_api::Error) -> Self {
        match err {
            centra_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            centra_api::Error::AuthBackoff { retry_after_secs } => {
                CoreError::AuthThrottled { retry_after_secs }
            }
            centra_api::Error::Transport(ref e) => {
                if e.is_timeout() || e.is_connect() {
                    CoreError::ConnectionFailed {
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                    }
                }
            }
            centra_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            centra_api::Error::Timeout {
                operation,
                timeout_secs,
            } => CoreError::Timeout {
                operation,
                timeout_secs,
            },
            centra_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                reason: format!("TLS error: {msg}"),
            },
            centra_api::Error::SocketConnect(reason) => CoreError::ConnectionFailed { reason },
            centra_api::Error::ConnectAborted
            | centra_api::Error::ConnectionClosed
            | centra_api::Error::NotConnected => CoreError::Disconnected,
            centra_api::Error::Api { operation, message } => CoreError::Api {
                message: format!("{operation}: {message}"),
            },
            centra_api::Error::Protocol(message) => CoreError::Protocol { message },
            centra_api::Error::Deserialization { message, body: _ } => CoreError::Protocol {
                message: format!("Deserialization error: {message}"),
            },
        }
    }
}
