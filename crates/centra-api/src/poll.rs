// Stateless request/response channel.
//
// Wraps `reqwest::Client` with the Centra invoke envelope, bearer auth
// through the shared SessionManager, and a single re-auth retry on 401.
// This is the channel full-state polls and fallback commands travel on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::session::SessionManager;
use crate::transport::TransportConfig;
use crate::wire::{self, HistoryDelta, Request, Response, WireInstance};

/// Client for the stateless invoke endpoint.
///
/// Every operation is one `POST /api/v1/invoke` carrying the request
/// envelope; the response envelope's `result` is unwrapped before the
/// caller sees it. The sequence counter here exists for log correlation
/// only -- HTTP already pairs requests with responses.
pub struct PollClient {
    http: reqwest::Client,
    invoke_url: Url,
    session: Arc<SessionManager>,
    seq: AtomicU64,
}

impl PollClient {
    /// Create a polling client for the controller at `base_url`.
    pub fn new(
        base_url: &Url,
        session: Arc<SessionManager>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let invoke_url = base_url.join("/api/v1/invoke").map_err(Error::InvalidUrl)?;
        let http = transport.build_client()?;
        Ok(Self {
            http,
            invoke_url,
            session,
            seq: AtomicU64::new(1),
        })
    }

    /// Invoke one operation and return the unwrapped `result`.
    ///
    /// A 401 invalidates the session and retries once with a fresh
    /// token. If the implicit re-login fails, that failure propagates to
    /// the caller -- the token is never left cleared with a silent
    /// success, which is what turns transient network loss into an
    /// immediate-retry storm.
    pub async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, Error> {
        let envelope = Request {
            args,
            operation_name: operation.to_owned(),
            sequence_id: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let token = self.session.get_token().await?;
        let resp = self.send(&envelope, &token).await?;

        let resp = if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!(operation, "token rejected, re-authenticating");
            self.session.invalidate().await;
            let token = self.session.get_token().await?;
            self.send(&envelope, &token).await?
        } else {
            resp
        };

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "request rejected after re-authentication".into(),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        if !status.is_success() {
            return Err(Error::Api {
                operation: operation.to_owned(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let response: Response =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })?;

        if response.operation_name != operation {
            warn!(
                requested = operation,
                answered = %response.operation_name,
                "response names a different operation"
            );
        }

        Ok(response.result)
    }

    /// Fetch the full state of every instance of one entity type.
    pub async fn fetch_instances(&self, entity_type: &str) -> Result<Vec<WireInstance>, Error> {
        let result = self
            .invoke(wire::OP_GET_INSTANCES, vec![Value::from(entity_type)])
            .await?;

        serde_json::from_value(result.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: result.to_string(),
        })
    }

    /// One batched history query covering every listed instance.
    ///
    /// Always a single request no matter how many instances are passed;
    /// per-instance queries starve the executor under load.
    pub async fn fetch_history(
        &self,
        instance_ids: Vec<String>,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, HistoryDelta>, Error> {
        let result = self
            .invoke(
                wire::OP_GET_HISTORY,
                vec![
                    serde_json::to_value(instance_ids).unwrap_or(Value::Null),
                    Value::from(since.to_rfc3339()),
                ],
            )
            .await?;

        serde_json::from_value(result.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: result.to_string(),
        })
    }

    async fn send(
        &self,
        envelope: &Request,
        token: &secrecy::SecretString,
    ) -> Result<reqwest::Response, Error> {
        debug!(
            operation = %envelope.operation_name,
            seq = envelope.sequence_id,
            "POST {}",
            self.invoke_url
        );

        self.http
            .post(self.invoke_url.clone())
            .bearer_auth(token.expose_secret())
            .json(envelope)
            .send()
            .await
            .map_err(Error::Transport)
    }
}
