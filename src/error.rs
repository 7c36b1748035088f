//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns one of a closed set of
//! tagged error kinds. None of them are retried internally: an operation
//! either fully succeeds or aborts with the first error encountered, and
//! the on-disk blob may already contain bytes from earlier completed steps.

use std::path::PathBuf;

/// Errors that can occur while creating, opening or querying a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file could not be opened for the requested mode.
    #[error("failed to open {path}: {source}")]
    OpenFailure {
        /// Path of the file that could not be opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// EOF was reached before the expected number of bytes was consumed.
    #[error("short read at byte offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Absolute byte offset at which the read started.
        offset: u64,
        /// Number of bytes that were requested.
        expected: usize,
        /// Number of bytes actually available.
        actual: usize,
    },

    /// An underlying I/O stream entered a failure condition.
    #[error("I/O stream failure: {0}")]
    Stream(#[from] std::io::Error),

    /// The metadata sidecar is not well-formed XML.
    #[error("metadata sidecar parse error: {0}")]
    Sidecar(#[from] quick_xml::Error),

    /// The sidecar and the binary blob disagree on a dataset UUID.
    #[error("UUID mismatch: {which} UUID in the blob header differs from the sidecar")]
    UuidMismatch {
        /// Which of the two UUIDs failed the byte comparison.
        which: &'static str,
    },

    /// Two lengths that must agree by invariant do not.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being compared.
        context: &'static str,
        /// Declared or required length.
        expected: usize,
        /// Length actually found.
        actual: usize,
    },

    /// The channel directory violates the gap-free strictly-increasing
    /// offset invariant.
    #[error("channel directory invariant violated at entry {index}: {detail}")]
    DirectoryInvariant {
        /// Index of the offending directory entry.
        index: usize,
        /// Description of the violated invariant.
        detail: String,
    },

    /// A channel window extends past the end of the mass axis.
    #[error("channel window [{start}, {start}+{count}) is out of range for {channels} channels")]
    WindowOutOfRange {
        /// First channel of the requested window.
        start: usize,
        /// Number of channels in the requested window.
        count: usize,
        /// Total number of channels in the dataset.
        channels: usize,
    },

    /// A structural problem in the sidecar or blob that does not fit a
    /// more specific variant (missing section, bad version, ...).
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// A window query would exceed the configured memory budget. Raised
    /// before any blob read is performed.
    #[error("window of {requested} bytes exceeds the memory budget of {budget} bytes")]
    ResourceExceeded {
        /// Cumulative byte length of the requested window.
        requested: u64,
        /// Configured memory budget in bytes.
        budget: u64,
    },

    /// The PNG raster codec failed to compress or decompress a channel.
    #[error("raster codec error: {0}")]
    Codec(#[from] image::ImageError),

    /// A decoded raster's dimensions disagree with the dataset geometry,
    /// which signals corruption of the blob.
    #[error(
        "decoded raster is {actual_width}x{actual_height}, dataset geometry is \
         {expected_width}x{expected_height}; possible blob corruption"
    )]
    CodecGeometry {
        /// Width declared by the dataset geometry.
        expected_width: u32,
        /// Height declared by the dataset geometry.
        expected_height: u32,
        /// Width found in the decoded raster.
        actual_width: u32,
        /// Height found in the decoded raster.
        actual_height: u32,
    },

    /// The requested direction is not implemented.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A worker thread exited without reporting a result.
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
