// Bearer-token session management for the stateless and push channels.
//
// The controller hands out short-lived bearer tokens from its login
// endpoint. Both channels share one SessionManager so a refresh performed
// for either is visible to both. Login attempts are serialized: callers
// that race on an expired token collapse into a single network login.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Token lifetime assumed when the login response omits `validUntilSecs`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(900);

/// Tokens are refreshed this long before they actually expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// First backoff step after a failed network login.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on login backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Username/password pair for the controller's login endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    #[serde(default)]
    valid_until_secs: Option<u64>,
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

#[derive(Default)]
struct SessionState {
    token: Option<CachedToken>,
    failures: u32,
    not_before: Option<Instant>,
}

/// Obtains and refreshes the bearer token used by both channels.
pub struct SessionManager {
    http: reqwest::Client,
    login_url: Url,
    credentials: Credentials,
    state: Mutex<SessionState>,
}

impl SessionManager {
    /// Create a session manager for the controller at `base_url`.
    pub fn new(
        base_url: &Url,
        credentials: Credentials,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let login_url = base_url.join("/api/v1/login").map_err(Error::InvalidUrl)?;
        let http = transport.build_client()?;
        Ok(Self {
            http,
            login_url,
            credentials,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Return a cached, non-expired token, or perform a login.
    ///
    /// Concurrent callers hitting an expired token serialize on the state
    /// lock: the first performs the network login, the rest find the
    /// fresh token cached and return it without another request.
    ///
    /// After a network login failure, calls made before the backoff
    /// deadline fail immediately with [`Error::AuthBackoff`] and no
    /// network attempt. Rejected credentials clear the cache and raise
    /// [`Error::Authentication`] without arming the backoff gate.
    pub async fn get_token(&self) -> Result<SecretString, Error> {
        let mut state = self.state.lock().await;

        if let Some(cached) = &state.token {
            if cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(cached.token.clone());
            }
        }

        if let Some(not_before) = state.not_before {
            let now = Instant::now();
            if not_before > now {
                let retry_after_secs = (not_before - now).as_secs().max(1);
                return Err(Error::AuthBackoff { retry_after_secs });
            }
        }

        match self.login().await {
            Ok(login) => {
                let ttl = login
                    .valid_until_secs
                    .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs);
                let token = SecretString::from(login.token);
                state.token = Some(CachedToken {
                    token: token.clone(),
                    expires_at: Instant::now() + ttl,
                });
                state.failures = 0;
                state.not_before = None;
                debug!(ttl_secs = ttl.as_secs(), "login successful");
                Ok(token)
            }
            Err(e @ Error::Authentication { .. }) => {
                state.token = None;
                Err(e)
            }
            Err(e) => {
                state.failures += 1;
                let delay = backoff_delay(state.failures);
                state.not_before = Some(Instant::now() + delay);
                warn!(
                    error = %e,
                    failures = state.failures,
                    backoff_secs = delay.as_secs(),
                    "login failed, backing off"
                );
                Err(e)
            }
        }
    }

    /// Clear the cached token. The next `get_token()` performs a login.
    pub async fn invalidate(&self) {
        self.state.lock().await.token = None;
    }

    async fn login(&self) -> Result<LoginResponse, Error> {
        debug!(url = %self.login_url, "logging in");

        let body = json!({
            "username": self.credentials.username,
            "password": self.credentials.password.expose_secret(),
        });

        let resp = self
            .http
            .post(self.login_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("login rejected (HTTP {status}): {body}"),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                operation: "Login".into(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }
}

/// Exponential backoff: `base * 2^(failures - 1)`, capped.
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1 << exp);
    delay.min(BACKOFF_CAP)
}
