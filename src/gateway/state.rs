//! Gateway lifecycle state

use serde::Serialize;

/// Lifecycle state of the supervised gateway process.
///
/// Only the supervisor moves between these:
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with
/// `Starting -> Stopped` on a failed start and any live state falling
/// back to `Stopped` when the process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl GatewayState {
    /// Get a human-readable description of the state
    pub fn description(&self) -> &'static str {
        match self {
            GatewayState::Stopped => "Gateway stopped",
            GatewayState::Starting => "Gateway starting...",
            GatewayState::Running => "Gateway running",
            GatewayState::Stopping => "Gateway stopping...",
        }
    }

    /// Whether a process is (or is about to be) alive in this state
    pub fn is_live(&self) -> bool {
        matches!(self, GatewayState::Starting | GatewayState::Running)
    }
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GatewayState::Stopped => "stopped",
            GatewayState::Starting => "starting",
            GatewayState::Running => "running",
            GatewayState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_serialize() {
        assert_eq!(GatewayState::default(), GatewayState::Stopped);
        assert_eq!(GatewayState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&GatewayState::Stopping).unwrap(),
            "\"stopping\""
        );
        assert!(GatewayState::Starting.is_live());
        assert!(!GatewayState::Stopping.is_live());
        assert_eq!(GatewayState::Starting.description(), "Gateway starting...");
    }
}
