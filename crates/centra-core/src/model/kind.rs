// ── Device kinds ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Closed set of device kinds a controller exposes.
///
/// Parsing is exact-match on the wire spelling. Substring matching is
/// deliberately avoided: similarly named kinds (`Switch`, `RelaySwitch`)
/// would cross-match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
pub enum DeviceKind {
    Light,
    Cover,
    RelaySwitch,
    Meter,
    Sensor,
}

impl DeviceKind {
    /// Whether commands for this kind may take the push channel.
    ///
    /// Physical relay switches do not react to push-channel commands
    /// even though the server acknowledges them; their commands always
    /// go directly to the stateless channel.
    pub fn supports_push_commands(self) -> bool {
        !matches!(self, Self::RelaySwitch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_is_exact_match() {
        assert_eq!("Light".parse::<DeviceKind>().ok(), Some(DeviceKind::Light));
        assert_eq!(
            "RelaySwitch".parse::<DeviceKind>().ok(),
            Some(DeviceKind::RelaySwitch)
        );
        // No substring or case-insensitive matching
        assert!("light".parse::<DeviceKind>().is_err());
        assert!("Switch".parse::<DeviceKind>().is_err());
        assert!("RelaySwitchPro".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn relay_switches_are_excluded_from_push_commands() {
        assert!(!DeviceKind::RelaySwitch.supports_push_commands());
        assert!(DeviceKind::Light.supports_push_commands());
        assert!(DeviceKind::Cover.supports_push_commands());
    }
}
