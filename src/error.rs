//! Crate-wide error taxonomy
//!
//! Callers branch on [`CommError`] kinds at the API boundary; subsystem
//! modules define richer internal error enums that convert into these kinds.
//! No stack traces surface at the boundary; each variant carries a best-effort
//! explanation.

use thiserror::Error;

use crate::domain_types::{AgentId, EndpointAddress, MessageId};

/// Distinguishable error kinds exposed at the public API boundary
#[derive(Debug, Error)]
pub enum CommError {
    /// Input failed validation before any state change
    #[error("Validation failed: {field} - {reason}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Human-readable reason
        reason: String,
    },

    /// A bounded queue is at its high-watermark and the policy is reject
    #[error("Queue full: {queue}")]
    QueueFull {
        /// Which queue rejected the item
        queue: String,
    },

    /// The message deadline was already past at submission or expired in flight
    #[error("Deadline exceeded for message {message_id}")]
    DeadlineExceeded {
        /// Message whose deadline passed
        message_id: MessageId,
    },

    /// No candidate routes exist for the destination set
    #[error("No route to destination: {detail}")]
    NoRoute {
        /// What was being routed
        detail: String,
    },

    /// Every candidate route is blocked by an open circuit breaker
    #[error("All candidate routes have open circuit breakers ({candidates} candidates)")]
    AllRoutesOpen {
        /// How many candidates were examined
        candidates: usize,
    },

    /// Connection acquisition timed out waiting for a release
    #[error("Connection acquire timed out after {timeout_ms}ms for {endpoint}")]
    AcquireTimeout {
        /// Endpoint being acquired
        endpoint: EndpointAddress,
        /// How long the caller waited
        timeout_ms: u64,
    },

    /// Operation refused because the target's circuit breaker is open
    #[error("Circuit breaker open for {endpoint}")]
    CircuitOpen {
        /// Tripped endpoint
        endpoint: EndpointAddress,
    },

    /// Transport-level failure (classified by the pool)
    #[error("Transport error: {detail}")]
    Transport {
        /// Classified explanation
        detail: String,
        /// Whether the pool considers this retryable
        retryable: bool,
    },

    /// Remote peer did not respond within the timeout
    #[error("Remote timeout after {timeout_ms}ms")]
    RemoteTimeout {
        /// How long we waited
        timeout_ms: u64,
    },

    /// Remote peer actively rejected the message
    #[error("Remote rejected: {reason}")]
    RemoteRejected {
        /// Rejection reason reported by the peer
        reason: String,
    },

    /// Target or agent is unhealthy and the operation requires health
    #[error("Unhealthy: {subject} - {reason}")]
    Unhealthy {
        /// Agent or endpoint that is unhealthy
        subject: String,
        /// Why it is considered unhealthy
        reason: String,
    },

    /// Operation was cancelled via its cancellation token
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// What was cancelled
        operation: String,
    },

    /// A recovery prerequisite was not satisfied
    #[error("Prerequisite failed for agent {agent_id}: {prerequisite}")]
    PrerequisiteFailed {
        /// Agent whose recovery was blocked
        agent_id: AgentId,
        /// The unmet prerequisite
        prerequisite: String,
    },

    /// A recovery execution ended in failure
    #[error("Recovery failed for agent {agent_id}: {reason}")]
    RecoveryFailed {
        /// Agent whose recovery failed
        agent_id: AgentId,
        /// Failure-analysis summary
        reason: String,
    },

    /// Persistence backend failure, surfaced with context
    #[error("Storage error: {source}")]
    Storage {
        /// Underlying store error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CommError {
    /// Whether a caller-side retry can plausibly succeed
    ///
    /// Retryable kinds are transient resource or network conditions; the rest
    /// either require operator action or will deterministically fail again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull { .. }
            | Self::AcquireTimeout { .. }
            | Self::RemoteTimeout { .. }
            | Self::CircuitOpen { .. } => true,
            Self::Transport { retryable, .. } => *retryable,
            Self::Validation { .. }
            | Self::DeadlineExceeded { .. }
            | Self::NoRoute { .. }
            | Self::AllRoutesOpen { .. }
            | Self::RemoteRejected { .. }
            | Self::Unhealthy { .. }
            | Self::Cancelled { .. }
            | Self::PrerequisiteFailed { .. }
            | Self::RecoveryFailed { .. }
            | Self::Storage { .. } => false,
        }
    }

    /// Short stable label for metrics and error counters
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::QueueFull { .. } => "queue_full",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::NoRoute { .. } => "no_route",
            Self::AllRoutesOpen { .. } => "all_routes_open",
            Self::AcquireTimeout { .. } => "acquire_timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Transport { .. } => "transport",
            Self::RemoteTimeout { .. } => "remote_timeout",
            Self::RemoteRejected { .. } => "remote_rejected",
            Self::Unhealthy { .. } => "unhealthy",
            Self::Cancelled { .. } => "cancelled",
            Self::PrerequisiteFailed { .. } => "prerequisite_failed",
            Self::RecoveryFailed { .. } => "recovery_failed",
            Self::Storage { .. } => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_classification() {
        let full = CommError::QueueFull {
            queue: "message".to_string(),
        };
        assert!(full.is_retryable());

        let no_route = CommError::NoRoute {
            detail: "unknown destination".to_string(),
        };
        assert!(!no_route.is_retryable());

        let transport_fatal = CommError::Transport {
            detail: "connection reset".to_string(),
            retryable: false,
        };
        assert!(!transport_fatal.is_retryable());
    }

    #[test]
    fn kinds_are_stable_labels() {
        let err = CommError::AllRoutesOpen { candidates: 3 };
        assert_eq!(err.kind(), "all_routes_open");
    }
}
