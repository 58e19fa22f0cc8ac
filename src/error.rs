//! Error types for the ingestion pipeline
//!
//! Each concern gets its own enum so call sites can match on what actually
//! went wrong; `PipelineError` is what a transfer session reasons about.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while reading or writing a length-prefixed frame
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    Oversized { len: u64, max: u32 },

    #[error("Stream ended after {received} of {expected} frame bytes")]
    Truncated { expected: usize, received: usize },

    #[error("Frame payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Label used for the frame error metric
    pub fn label(&self) -> &'static str {
        match self {
            FrameError::Oversized { .. } => "oversized",
            FrameError::Truncated { .. } => "truncated",
            FrameError::Malformed(_) => "malformed",
            FrameError::Io(_) => "io",
        }
    }
}

/// Publish/subscribe bus errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription closed for channel: {0}")]
    Closed(String),

    #[error("Subscriber lagged, {0} messages skipped")]
    Lagged(u64),

    #[error("Failed to encode bus message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled database error: {operation} failed: {source}")]
    Sled {
        operation: &'static str,
        #[source]
        source: sled::Error,
    },

    #[error("Transaction aborted: {0}")]
    Transaction(String),

    #[error("Record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Image not found: {0}")]
    ImageNotFound(u64),

    #[error("Blocking task failed: {0}")]
    Blocking(String),
}

impl StoreError {
    pub(crate) fn sled(operation: &'static str) -> impl FnOnce(sled::Error) -> StoreError {
        move |source| StoreError::Sled { operation, source }
    }
}

/// Session-level error taxonomy
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transfer interrupted after {received} of {expected} bytes")]
    TransferInterrupted { received: u64, expected: u64 },

    #[error("Worker pool unavailable after {attempts} attempts: {reason}")]
    DispatchUnavailable { attempts: u32, reason: String },

    #[error("No result within {0:?}")]
    ResultTimeout(Duration),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Submitter {0} already has an upload awaiting its result")]
    SubmitterBusy(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable identifier placed in the `error` field of error replies
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Framing(_) => "framing_error",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::TransferInterrupted { .. } => "transfer_interrupted",
            PipelineError::DispatchUnavailable { .. } => "dispatch_unavailable",
            PipelineError::ResultTimeout(_) => "result_timeout",
            PipelineError::Persistence(_) => "storage_unavailable",
            PipelineError::SubmitterBusy(_) => "submitter_busy",
            PipelineError::Bus(_) => "bus_unavailable",
            PipelineError::Io(_) => "transport_error",
        }
    }
}

/// Whether an operation that failed with this error is worth retrying
pub trait Recoverable {
    fn is_recoverable(&self) -> bool;
}

impl Recoverable for BusError {
    fn is_recoverable(&self) -> bool {
        matches!(self, BusError::Unavailable(_) | BusError::Lagged(_))
    }
}

impl Recoverable for StoreError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Sled { .. } | StoreError::Transaction(_) | StoreError::Blocking(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        let err = PipelineError::ResultTimeout(Duration::from_secs(60));
        assert_eq!(err.kind(), "result_timeout");

        let err = PipelineError::InvalidRequest("missing field `file_size`".to_string());
        assert_eq!(err.kind(), "invalid_request");
        assert!(err.to_string().contains("file_size"));
    }

    #[test]
    fn test_recoverability() {
        assert!(BusError::Unavailable("broker down".into()).is_recoverable());
        assert!(!BusError::Closed("results:1".into()).is_recoverable());
        assert!(!StoreError::ImageNotFound(7).is_recoverable());
        assert!(StoreError::Transaction("conflict".into()).is_recoverable());
    }

    #[test]
    fn test_frame_error_labels() {
        let err = FrameError::Oversized { len: 10, max: 4 };
        assert_eq!(err.label(), "oversized");
        assert!(err.to_string().contains("exceeds limit"));
    }
}
