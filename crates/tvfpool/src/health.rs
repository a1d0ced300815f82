//! Health status of the pool service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Constructed, not started
    #[default]
    Unknown,
    /// Accepting sessions
    Ready,
    /// Ready but every permit is taken
    Busy,
    /// Draining after stop()
    Stopping,
    /// Stopped; no longer accepts sessions
    Stopped,
}

impl Health {
    pub fn accepts_sessions(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_default_is_unknown() {
        assert_eq!(Health::default(), Health::Unknown);
    }

    #[test]
    fn health_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(Health::Ready, @r#""READY""#);
        insta::assert_json_snapshot!(Health::Stopping, @r#""STOPPING""#);
    }

    #[test]
    fn health_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<Health>("\"BUSY\"").unwrap(),
            Health::Busy
        );
    }

    #[test]
    fn only_ready_and_busy_accept_sessions() {
        assert!(Health::Ready.accepts_sessions());
        assert!(Health::Busy.accepts_sessions());
        assert!(!Health::Unknown.accepts_sessions());
        assert!(!Health::Stopped.accepts_sessions());
    }
}
