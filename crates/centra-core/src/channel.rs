// ── Channel seams ──
//
// The coordinator and the command translator never reach for a global
// transport; both channels are injected through these traits. That
// keeps multiple independent controller connections possible and makes
// dispatch behavior deterministic under test, where the channels are
// in-process mocks.

use std::collections::HashMap;
use std::future::Future;

use centra_api::wire::{HistoryDelta, WireInstance};
use centra_api::{Error as ApiError, PollClient, SocketClient};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The persistent push connection, as the core sees it.
pub trait PushChannel: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn call(
        &self,
        operation: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;
}

/// The stateless request/response channel.
pub trait StatelessChannel: Send + Sync + 'static {
    fn invoke(
        &self,
        operation: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn fetch_instances(
        &self,
        entity_type: &str,
    ) -> impl Future<Output = Result<Vec<WireInstance>, ApiError>> + Send;

    fn fetch_history(
        &self,
        instance_ids: Vec<String>,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<HashMap<String, HistoryDelta>, ApiError>> + Send;
}

impl PushChannel for SocketClient {
    fn is_connected(&self) -> bool {
        SocketClient::is_connected(self)
    }

    async fn call(&self, operation: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        SocketClient::call(self, operation, args).await
    }
}

impl StatelessChannel for PollClient {
    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        PollClient::invoke(self, operation, args).await
    }

    async fn fetch_instances(&self, entity_type: &str) -> Result<Vec<WireInstance>, ApiError> {
        PollClient::fetch_instances(self, entity_type).await
    }

    async fn fetch_history(
        &self,
        instance_ids: Vec<String>,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, HistoryDelta>, ApiError> {
        PollClient::fetch_history(self, instance_ids, since).await
    }
}
