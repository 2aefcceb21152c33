use serde::Deserialize;
use serde::Serialize;

/// Failure classes carried on the wire and in attempt logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed envelope, rejected before dispatch.
    Validation,
    /// No eligible agent, or the agent's circuit is open.
    AgentUnavailable,
    Timeout,
    /// The agent itself reported a failure.
    RemoteError,
    QuotaExceeded,
    /// Version negotiation or schema mismatch.
    Protocol,
    LockConflict,
    Cancelled,
}

impl ErrorClass {
    /// Whether the router may move on to the next agent after this class.
    ///
    /// `RemoteError` is retryable by default; an agent can still opt out per
    /// reply through [`crate::ResponseError::retryable`].
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorClass::AgentUnavailable
            | ErrorClass::Timeout
            | ErrorClass::RemoteError
            | ErrorClass::QuotaExceeded => true,
            ErrorClass::Validation
            | ErrorClass::Protocol
            | ErrorClass::LockConflict
            | ErrorClass::Cancelled => false,
        }
    }

    /// Whether this class counts against the agent's health.
    pub fn counts_against_agent(self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::RemoteError
                | ErrorClass::QuotaExceeded
                | ErrorClass::Protocol
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation_error",
            ErrorClass::AgentUnavailable => "agent_unavailable",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RemoteError => "remote_error",
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::Protocol => "protocol_error",
            ErrorClass::LockConflict => "lock_conflict",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes_match_taxonomy() {
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::QuotaExceeded.is_retryable());
        assert!(ErrorClass::AgentUnavailable.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::Protocol.is_retryable());
    }

    #[test]
    fn unavailable_does_not_count_against_agent() {
        assert!(!ErrorClass::AgentUnavailable.counts_against_agent());
        assert!(!ErrorClass::Validation.counts_against_agent());
        assert!(ErrorClass::Timeout.counts_against_agent());
    }
}
