// ── Runtime connection configuration ──
//
// Describes *how* to reach one controller. Carries credential data and
// connection tuning, never touches disk -- the embedding application
// constructs a `ControllerConfig` and hands it in.

use std::time::Duration;

use centra_api::Credentials;
use centra_api::transport::TlsMode;
use url::Url;

/// Configuration for connecting to a single controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller URL (e.g., `https://192.168.1.20`).
    pub url: Url,
    /// Login credentials for the bearer-token session.
    pub credentials: Credentials,
    /// TLS verification strategy.
    pub tls: TlsMode,
    /// Request timeout for the stateless channel.
    pub timeout: Duration,
    /// Scheduled full-poll interval in seconds. 0 disables the cycle.
    pub poll_interval_secs: u64,
}

impl ControllerConfig {
    pub fn new(url: Url, credentials: Credentials) -> Self {
        Self {
            url,
            credentials,
            tls: TlsMode::DangerAcceptInvalid,
            timeout: Duration::from_secs(30),
            poll_interval_secs: 60,
        }
    }
}
