use thiserror::Error;

use crate::jobs::Phase;

/// Terminal outcome of one acquisition attempt. Every variant except
/// `UpstreamRejected` with a non-retryable status is recovered by the
/// orchestrator via fallback to the next strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("producer did not pick up the job in time")]
    PickupTimeout,
    #[error("preflight budget exhausted in {phase:?} phase")]
    PreflightTimeout { phase: Phase },
    #[error("upstream status not reported in time")]
    StatusTimeout,
    #[error("overall request budget exhausted")]
    OverallTimeout,
    #[error("upstream rejected the request with status {status}")]
    UpstreamRejected { status: u16 },
    #[error("producer failed: {0}")]
    ProducerFailure(String),
    #[error("no acquisition strategy available")]
    NoStrategyAvailable,
}

impl FetchError {
    /// HTTP status the caller sees when this error is what the whole cascade
    /// ends on.
    pub fn client_status(&self) -> u16 {
        match self {
            FetchError::UpstreamRejected { status } => *status,
            FetchError::NoStrategyAvailable => 503,
            _ => 502,
        }
    }
}

/// A single malformed upstream stream line. Never fatal: the translator skips
/// the line and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed stream line (tag {tag}): {reason}")]
pub struct ProtocolError {
    pub tag: String,
    pub reason: String,
}
