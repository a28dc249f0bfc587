//! Saga lifecycle status.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The status of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► Compensated
///                                           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Instance created, no step attempted yet.
    #[default]
    Pending,

    /// Forward actions are being executed.
    Running,

    /// Every forward action succeeded (terminal state).
    Completed,

    /// A forward action gave up and completed steps are being undone.
    Compensating,

    /// Every completed step was undone or skipped (terminal state).
    Compensated,

    /// A compensation gave up; operator intervention required (terminal state).
    Failed,
}

impl SagaStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [SagaStatus; 6] = [
        SagaStatus::Pending,
        SagaStatus::Running,
        SagaStatus::Completed,
        SagaStatus::Compensating,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        matches!(
            (self, next),
            (SagaStatus::Pending, SagaStatus::Running)
                | (SagaStatus::Running, SagaStatus::Completed)
                | (SagaStatus::Running, SagaStatus::Compensating)
                | (SagaStatus::Compensating, SagaStatus::Compensated)
                | (SagaStatus::Compensating, SagaStatus::Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "Pending",
            SagaStatus::Running => "Running",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown saga status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for SagaStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(SagaStatus::Pending.can_transition_to(SagaStatus::Running));
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Completed));
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Compensating));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Compensated));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Failed));
    }

    #[test]
    fn test_unwinding_never_skips_compensating() {
        assert!(!SagaStatus::Running.can_transition_to(SagaStatus::Compensated));
        assert!(!SagaStatus::Running.can_transition_to(SagaStatus::Failed));
        assert!(!SagaStatus::Pending.can_transition_to(SagaStatus::Compensating));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in SagaStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in SagaStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Pending.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn test_parse_matches_display() {
        for status in SagaStatus::ALL {
            assert_eq!(status.to_string().parse::<SagaStatus>(), Ok(status));
        }
        assert_eq!(
            "Paused".parse::<SagaStatus>(),
            Err(UnknownStatus("Paused".to_string()))
        );
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&SagaStatus::Compensating).unwrap();
        assert_eq!(json, "\"Compensating\"");
        let deserialized: SagaStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, SagaStatus::Compensating);
    }
}
