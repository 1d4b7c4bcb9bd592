//! Error types for memtwin.
//!
//! Detected memory faults are not errors: they travel as `FaultReport` values.
//! This module covers the operational failures around a run.

use thiserror::Error;

/// Unified error type for memtwin operations.
#[derive(Error, Debug)]
pub enum MemtwinError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The test buffers could not be allocated.
    #[error("Buffer allocation failed: requested {requested_bytes} bytes")]
    Allocation { requested_bytes: u64 },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
