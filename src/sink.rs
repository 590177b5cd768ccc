//! The interface every destination of an observation implements.

use core::fmt;

use crate::observation::Observation;

/// Delivery target for observations.
///
/// A sink never returns an error to its caller: whatever goes wrong is folded
/// into the [`Outcome`] of that single attempt.
pub trait Sink: Send {
    /// Name used in logs and cycle reports.
    fn name(&self) -> &str;

    /// Try to deliver one observation.
    fn publish(&mut self, observation: &Observation) -> Outcome;

    /// Release long-lived resources. Called once, when the driver terminates.
    fn close(&mut self) {}
}

/// Result of one publish attempt on one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Failed(SinkError),
    /// The sink decided not to attempt delivery at all.
    Skipped,
}

impl Outcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Delivered => write!(f, "delivered"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
            Outcome::Skipped => write!(f, "skipped"),
        }
    }
}

impl From<Result<(), SinkError>> for Outcome {
    fn from(result: Result<(), SinkError>) -> Self {
        match result {
            Ok(()) => Outcome::Delivered,
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Why a publish attempt failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("request timed out")]
    NetworkTimeout,

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("server rejected the request with status {status}: {body}")]
    ServerRejected { status: u16, body: String },

    #[error("{delivered}/{total} channels updated")]
    PartialDelivery { delivered: usize, total: usize },

    #[error("not connected to the broker")]
    Disconnected,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Longest response body kept in a [`SinkError::ServerRejected`].
pub const MAX_BODY_CHARS: usize = 100;

/// Cut a response body down to [`MAX_BODY_CHARS`] characters.
pub fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_BODY_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(Outcome::from(Ok(())), Outcome::Delivered);
        assert_eq!(
            Outcome::from(Err(SinkError::Disconnected)),
            Outcome::Failed(SinkError::Disconnected)
        );
    }

    #[test]
    fn test_partial_delivery_message() {
        let e = SinkError::PartialDelivery { delivered: 3, total: 5 };
        assert_eq!(e.to_string(), "3/5 channels updated");
        assert_eq!(Outcome::Failed(e).to_string(), "failed: 3/5 channels updated");
    }

    #[test]
    fn test_truncate_body_counts_chars() {
        let long = "é".repeat(250);
        assert_eq!(truncate_body(&long).chars().count(), MAX_BODY_CHARS);
        assert_eq!(truncate_body("short"), "short");
    }
}
