//! Centralized error types for the rivulet core library.
//!
//! All fallible operations on the pipeline surface return
//! [`PipelineResult`]; no error crosses a filter boundary as a panic.
//! Starvation and overflow are not errors (they are wait hints and counted
//! drops respectively), so the taxonomy here covers configuration,
//! connection and lifecycle failures only.

use serde::Serialize;
use thiserror::Error;

use crate::queue::{EndpointId, FilterId};

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for state dumps and logs.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for pipeline construction and control.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum PipelineError {
    /// Invalid parameter value (zero capacity, empty path, ...).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A filter with this id is already registered.
    #[error("Duplicate filter id: {0}")]
    DuplicateFilter(FilterId),

    /// No filter registered under this id.
    #[error("Unknown filter id: {0}")]
    UnknownFilter(FilterId),

    /// Codec/format combination the queues cannot host.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The filter's shape does not allow another endpoint of this kind.
    #[error("Filter {filter} cannot take another {kind} (limit {limit})")]
    ArityExceeded {
        filter: FilterId,
        kind: &'static str,
        limit: usize,
    },

    /// The target reader endpoint is already connected.
    #[error("Reader {reader} of filter {filter} is already connected")]
    AlreadyConnected {
        filter: FilterId,
        reader: EndpointId,
    },

    /// Writer creation was rejected by the filter's connection hook.
    #[error("Writer {writer} of filter {filter} was rejected")]
    WriterRejected {
        filter: FilterId,
        writer: EndpointId,
    },

    /// Reader creation or configuration failed on the downstream filter.
    #[error("Reader {reader} of filter {filter} was rejected")]
    ReaderRejected {
        filter: FilterId,
        reader: EndpointId,
    },

    /// The upstream filter could not allocate an output queue.
    #[error("Queue allocation failed: {0}")]
    QueueAllocation(String),

    /// No path registered under this id.
    #[error("Unknown path id: {0}")]
    UnknownPath(u32),

    /// Path endpoints or intermediates have the wrong arity.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Operation requires a running pipeline.
    #[error("Pipeline is not running")]
    NotRunning,

    /// The pipeline scheduler is already running.
    #[error("Pipeline is already running")]
    AlreadyRunning,
}

impl ErrorCode for PipelineError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::DuplicateFilter(_) => "duplicate_filter",
            Self::UnknownFilter(_) => "unknown_filter",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::ArityExceeded { .. } => "arity_exceeded",
            Self::AlreadyConnected { .. } => "already_connected",
            Self::WriterRejected { .. } => "writer_rejected",
            Self::ReaderRejected { .. } => "reader_rejected",
            Self::QueueAllocation(_) => "queue_allocation_failed",
            Self::UnknownPath(_) => "unknown_path",
            Self::InvalidPath(_) => "invalid_path",
            Self::NotRunning => "not_running",
            Self::AlreadyRunning => "already_running",
        }
    }
}

/// Convenient Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PipelineError::DuplicateFilter(3).code(), "duplicate_filter");
        assert_eq!(PipelineError::NotRunning.code(), "not_running");
        assert_eq!(
            PipelineError::ArityExceeded {
                filter: 1,
                kind: "writer",
                limit: 1
            }
            .code(),
            "arity_exceeded"
        );
    }

    #[test]
    fn display_carries_context() {
        let err = PipelineError::AlreadyConnected {
            filter: 7,
            reader: 2,
        };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('2'));
    }
}
