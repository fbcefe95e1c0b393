// ── Command API ──
//
// Consumers issue transport-agnostic commands; this module decides the
// channel per command, translates the spelling at the boundary, and
// falls back to the stateless channel whenever the push path is
// unavailable or refuses. The stateless channel is the operation of
// last resort: it is always attempted when the push path did not
// succeed, and no translator failure surfaces before that attempt.

use serde_json::{Value, json};
use tracing::debug;

use crate::channel::{PushChannel, StatelessChannel};
use crate::error::CoreError;
use crate::model::InstanceRecord;

/// Push-channel spelling of the combined shutter axis move.
const OP_SHUTTER_POS_TILT: &str = "SetShutterPosTilt";

/// Canonical → stateless-channel operation names. Names absent from
/// this table are spelled identically on both channels.
const STATELESS_NAMES: &[(&str, &str)] = &[
    ("SwitchOn", "TurnOn"),
    ("SwitchOff", "TurnOff"),
    ("SetDimLevel", "DimTo"),
    ("MoveCover", "SetShutterPos"),
    ("SetCoverTilt", "SetShutterTilt"),
];

/// All write operations against a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SwitchOn { instance_id: String },
    SwitchOff { instance_id: String },
    SetDimLevel { instance_id: String, level: f64 },
    MoveCover { instance_id: String, position: f64 },
    SetCoverTilt { instance_id: String, tilt: f64 },
}

impl Command {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::SwitchOn { instance_id }
            | Self::SwitchOff { instance_id }
            | Self::SetDimLevel { instance_id, .. }
            | Self::MoveCover { instance_id, .. }
            | Self::SetCoverTilt { instance_id, .. } => instance_id,
        }
    }

    /// The canonical operation name, as spelled on the push channel.
    pub(crate) fn canonical_name(&self) -> &'static str {
        match self {
            Self::SwitchOn { .. } => "SwitchOn",
            Self::SwitchOff { .. } => "SwitchOff",
            Self::SetDimLevel { .. } => "SetDimLevel",
            Self::MoveCover { .. } => "MoveCover",
            Self::SetCoverTilt { .. } => "SetCoverTilt",
        }
    }

    pub(crate) fn args(&self) -> Vec<Value> {
        match self {
            Self::SwitchOn { instance_id } | Self::SwitchOff { instance_id } => {
                vec![json!(instance_id)]
            }
            Self::SetDimLevel { instance_id, level } => vec![json!(instance_id), json!(level)],
            Self::MoveCover {
                instance_id,
                position,
            } => vec![json!(instance_id), json!(position)],
            Self::SetCoverTilt { instance_id, tilt } => vec![json!(instance_id), json!(tilt)],
        }
    }
}

/// Which channel ultimately carried a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    Push,
    Stateless,
}

/// Translate a canonical name to its stateless-channel spelling.
pub(crate) fn stateless_name(canonical: &str) -> &str {
    STATELESS_NAMES
        .iter()
        .find(|(c, _)| *c == canonical)
        .map_or(canonical, |(_, stateless)| *stateless)
}

/// Push-channel spelling of `command` against `record`, if one exists.
///
/// `None` routes the command straight to the stateless channel: either
/// the kind is hard-excluded from push commands, or a companion value
/// the push operation needs is not cached yet.
fn push_call_for(record: &InstanceRecord, command: &Command) -> Option<(String, Vec<Value>)> {
    if !record.kind.supports_push_commands() {
        return None;
    }

    match command {
        // The combined axis move needs both coordinates before either
        // can change; the command supplies one and the last-known state
        // provides the other.
        Command::MoveCover {
            instance_id,
            position,
        } => {
            let tilt = record.number("tilt")?;
            Some((
                OP_SHUTTER_POS_TILT.to_owned(),
                vec![json!(instance_id), json!(position), json!(tilt)],
            ))
        }
        Command::SetCoverTilt { instance_id, tilt } => {
            let position = record.number("position")?;
            Some((
                OP_SHUTTER_POS_TILT.to_owned(),
                vec![json!(instance_id), json!(position), json!(tilt)],
            ))
        }
        _ => Some((command.canonical_name().to_owned(), command.args())),
    }
}

/// Dispatch one command: push channel when its preconditions hold,
/// stateless channel otherwise -- exactly one fallback attempt.
pub(crate) async fn dispatch<P: PushChannel, S: StatelessChannel>(
    push: &P,
    stateless: &S,
    record: &InstanceRecord,
    command: &Command,
) -> Result<DispatchRoute, CoreError> {
    if push.is_connected() {
        if let Some((operation, args)) = push_call_for(record, command) {
            match push.call(&operation, args).await {
                Ok(_) => return Ok(DispatchRoute::Push),
                Err(e) => debug!(
                    error = %e,
                    operation = %operation,
                    "push dispatch failed, falling back to stateless channel"
                ),
            }
        }
    }

    let operation = stateless_name(command.canonical_name());
    stateless
        .invoke(operation, command.args())
        .await
        .map_err(|e| CoreError::CommandFailed {
            command: command.canonical_name().to_owned(),
            message: e.to_string(),
        })?;
    Ok(DispatchRoute::Stateless)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceKind, FieldValue};
    use std::collections::BTreeMap;

    fn record(kind: DeviceKind, fields: &[(&str, f64)]) -> InstanceRecord {
        let mut map = BTreeMap::new();
        for (name, value) in fields {
            map.insert((*name).to_owned(), FieldValue::Number(*value));
        }
        InstanceRecord {
            entity_type: "x".into(),
            instance_id: "I1".into(),
            kind,
            fields: map,
            updated_at: None,
        }
    }

    #[test]
    fn stateless_names_translate_or_pass_through() {
        assert_eq!(stateless_name("SwitchOn"), "TurnOn");
        assert_eq!(stateless_name("SwitchOff"), "TurnOff");
        assert_eq!(stateless_name("SetDimLevel"), "DimTo");
        assert_eq!(stateless_name("MoveCover"), "SetShutterPos");
        assert_eq!(stateless_name("SetCoverTilt"), "SetShutterTilt");
        assert_eq!(stateless_name("GetInstances"), "GetInstances");
    }

    #[test]
    fn relay_switches_never_map_to_push() {
        let relay = record(DeviceKind::RelaySwitch, &[]);
        let cmd = Command::SwitchOn {
            instance_id: "I1".into(),
        };
        assert!(push_call_for(&relay, &cmd).is_none());
    }

    #[test]
    fn cover_move_requires_cached_tilt() {
        let cmd = Command::MoveCover {
            instance_id: "I1".into(),
            position: 80.0,
        };

        let without_tilt = record(DeviceKind::Cover, &[("position", 10.0)]);
        assert!(push_call_for(&without_tilt, &cmd).is_none());

        let with_tilt = record(DeviceKind::Cover, &[("position", 10.0), ("tilt", 30.0)]);
        let (operation, args) = push_call_for(&with_tilt, &cmd).unwrap();
        assert_eq!(operation, OP_SHUTTER_POS_TILT);
        assert_eq!(args, vec![serde_json::json!("I1"), serde_json::json!(80.0), serde_json::json!(30.0)]);
    }

    #[test]
    fn tilt_command_requires_cached_position() {
        let cmd = Command::SetCoverTilt {
            instance_id: "I1".into(),
            tilt: 45.0,
        };

        let without_position = record(DeviceKind::Cover, &[("tilt", 30.0)]);
        assert!(push_call_for(&without_position, &cmd).is_none());

        let with_position = record(DeviceKind::Cover, &[("position", 10.0), ("tilt", 30.0)]);
        let (operation, args) = push_call_for(&with_position, &cmd).unwrap();
        assert_eq!(operation, OP_SHUTTER_POS_TILT);
        assert_eq!(args[1], serde_json::json!(10.0));
        assert_eq!(args[2], serde_json::json!(45.0));
    }

    #[test]
    fn plain_commands_use_their_canonical_spelling_on_push() {
        let light = record(DeviceKind::Light, &[]);
        let cmd = Command::SetDimLevel {
            instance_id: "I1".into(),
            level: 55.0,
        };
        let (operation, args) = push_call_for(&light, &cmd).unwrap();
        assert_eq!(operation, "SetDimLevel");
        assert_eq!(args.len(), 2);
    }
}
