//! Panel manager error types.

use bklight_client::SessionError;
use thiserror::Error;

/// One panel's failure within a fan-out.
#[derive(Debug)]
pub struct PanelFailure {
    pub name: String,
    pub address: String,
    pub error: SessionError,
}

impl std::fmt::Display for PanelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.address, self.error)
    }
}

/// Panel manager errors.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("panel {}", .0)]
    Session(PanelFailure),

    #[error("{} of {total} panels failed: {}", .failures.len(), join_failures(.failures))]
    Fanout {
        failures: Vec<PanelFailure>,
        total: usize,
    },

    #[error("expected {expected} frames (one per panel), got {actual}")]
    FrameCountMismatch { expected: usize, actual: usize },
}

fn join_failures(failures: &[PanelFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PanelError {
    /// Every panel failure carried by this error.
    pub fn failures(&self) -> &[PanelFailure] {
        match self {
            PanelError::Session(failure) => std::slice::from_ref(failure),
            PanelError::Fanout { failures, .. } => failures,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(name: &str) -> PanelFailure {
        PanelFailure {
            name: name.to_string(),
            address: "AA:BB".to_string(),
            error: SessionError::ConnectionFailed("refused".to_string()),
        }
    }

    #[test]
    fn test_fanout_display_lists_every_panel() {
        let err = PanelError::Fanout {
            failures: vec![failure("left"), failure("right")],
            total: 3,
        };
        let message = err.to_string();
        assert!(message.starts_with("2 of 3 panels failed"));
        assert!(message.contains("left (AA:BB)"));
        assert!(message.contains("right (AA:BB)"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn test_session_failure() {
        let err = PanelError::Session(failure("panel_1"));
        assert_eq!(
            err.to_string(),
            "panel panel_1 (AA:BB): connection failed: refused"
        );
        assert_eq!(err.failures()[0].name, "panel_1");
    }
}
