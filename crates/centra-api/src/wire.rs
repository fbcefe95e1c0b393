//! Wire envelope types shared by both channels.
//!
//! Every request the core sends -- over the push socket or the stateless
//! HTTP endpoint -- uses the same `{args, operationName, sequenceId}`
//! envelope, and every correlated reply the same
//! `{sequenceId, operationName, result}` shape. Push deltas arrive as
//! `ValuesChanged` batches keyed by `"<instanceId>.<property>"`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Well-known operation names ───────────────────────────────────────

pub const OP_VALUES_CHANGED: &str = "ValuesChanged";
pub const OP_KEEP_ALIVE: &str = "KeepAlive";
pub const OP_SESSION_STARTED: &str = "SessionStarted";
pub const OP_REGISTER_OBSERVERS: &str = "RegisterValueObservers";
pub const OP_GET_INSTANCES: &str = "GetInstances";
pub const OP_GET_HISTORY: &str = "GetHistory";
pub const OP_CLIENT_READY: &str = "ClientReady";

/// Operations the server never answers with a response envelope.
///
/// Calls for these send the request and resolve immediately, with no
/// pending-request bookkeeping. The list is fixed -- response-less
/// behavior is never inferred from a missing reply.
pub const NOTIFY_OPERATIONS: &[&str] = &[OP_CLIENT_READY, OP_KEEP_ALIVE];

// ── Envelopes ────────────────────────────────────────────────────────

/// Outbound request envelope (both channels).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub args: Vec<Value>,
    pub operation_name: String,
    pub sequence_id: u64,
}

/// Correlated response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub sequence_id: u64,
    pub operation_name: String,
    #[serde(default)]
    pub result: Value,
}

/// One cell of a `ValuesChanged` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushValue {
    pub value: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PushValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
            reason: None,
        }
    }
}

/// One entry of a batched `RegisterValueObservers` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverSpec {
    pub instance_id: String,
    pub properties: Vec<String>,
}

/// One instance as reported by a `GetInstances` poll.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInstance {
    pub instance_id: String,
    pub kind: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

/// Per-instance result of a batched `GetHistory` query.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDelta {
    pub delta: f64,
}

// ── Inbound frame discrimination ─────────────────────────────────────

/// A parsed inbound push-socket frame.
#[derive(Debug)]
pub enum Inbound {
    /// Server handshake; sent once, directly after the upgrade.
    SessionStarted { keepalive_secs: u64 },
    /// Periodic liveness traffic. Feeds the idle watchdog, nothing else.
    KeepAlive,
    /// Reply to a correlated request.
    Response(Response),
    /// Incremental property deltas, keyed `"<instanceId>.<property>"`.
    /// Order matches server emission order.
    ValuesChanged(IndexMap<String, PushValue>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    operation_name: String,
    #[serde(default)]
    sequence_id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    table: Option<IndexMap<String, PushValue>>,
}

/// Classify one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, Error> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    })?;

    match raw.operation_name.as_str() {
        OP_SESSION_STARTED => {
            let keepalive_secs = raw
                .result
                .as_ref()
                .and_then(|r| r.get("keepaliveSecs"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok(Inbound::SessionStarted { keepalive_secs })
        }
        OP_KEEP_ALIVE => Ok(Inbound::KeepAlive),
        OP_VALUES_CHANGED => {
            let table = raw
                .table
                .ok_or_else(|| Error::Protocol("ValuesChanged frame without table".into()))?;
            Ok(Inbound::ValuesChanged(table))
        }
        _ => {
            let sequence_id = raw.sequence_id.ok_or_else(|| {
                Error::Protocol(format!(
                    "frame for {} carries neither sequenceId nor table",
                    raw.operation_name
                ))
            })?;
            Ok(Inbound::Response(Response {
                sequence_id,
                operation_name: raw.operation_name,
                result: raw.result.unwrap_or(Value::Null),
            }))
        }
    }
}

/// Split a `"<instanceId>.<property>"` composite key on its **last** dot.
///
/// Instance ids may themselves contain dots; the property name never
/// does. Returns `None` when no separator is present -- the caller must
/// log and skip such keys rather than guess at a parse.
pub fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    match key.rsplit_once('.') {
        Some((instance, property)) if !instance.is_empty() && !property.is_empty() => {
            Some((instance, property))
        }
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────
