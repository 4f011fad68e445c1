//! Errors that are fatal to a demultiplexing run.
//!
//! Every malformed record or desynchronized set of input streams aborts the run. Each error
//! reports the 1-based index of the record (or read set) at which it occurred.

use std::fmt::Display;

use thiserror::Error;

/// The input stream a record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Forward,
    Reverse,
    Index,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Reverse => write!(f, "reverse"),
            Self::Index => write!(f, "index"),
        }
    }
}

/// The ways a single FASTQ record (or the barcode extracted from it) can be malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FormatErrorKind {
    #[error("identifier line does not start with '@'")]
    MissingIdentifierMarker,

    #[error("stream ended in the middle of a record")]
    TruncatedRecord,

    #[error("invalid base {base:?} at position {position}")]
    InvalidBaseChar { base: char, position: usize },

    #[error("divider line does not start with '+'")]
    MissingDividerMarker,

    #[error("found {quals} quality symbols for {bases} bases")]
    QualityLengthMismatch { bases: usize, quals: usize },

    #[error("quality symbol {symbol:?} at position {position} is outside the Phred+33 range")]
    QualityOutOfRange { symbol: char, position: usize },

    #[error("observed barcode has length {observed}, expected {expected}")]
    BarcodeLengthMismatch { expected: usize, observed: usize },
}

/// The ways the forward, reverse and index streams can fall out of step with each other.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncErrorKind {
    #[error("the {ended} stream ended while the {remaining} stream still had records")]
    StreamLengthMismatch { ended: StreamKind, remaining: StreamKind },

    #[error("read names did not match: {expected:?} ({expected_stream}) != {found:?} ({found_stream})")]
    IdentifierMismatch {
        expected: String,
        expected_stream: StreamKind,
        found: String,
        found_stream: StreamKind,
    },
}

/// The error type returned by the demultiplexing core.
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("Malformed record #{record} in the {stream} stream: {kind}")]
    Format { stream: StreamKind, record: usize, kind: FormatErrorKind },

    #[error("Input streams out of sync at read set #{record}: {kind}")]
    Sync { record: usize, kind: SyncErrorKind },

    #[error("No index stream was provided; an index read is required to demultiplex")]
    MissingIndexStream,

    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("Failed to build the demultiplexing thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl DemuxError {
    /// The 1-based record (or read set) index at which a format or sync error occurred.
    pub fn record(&self) -> Option<usize> {
        match self {
            Self::Format { record, .. } | Self::Sync { record, .. } => Some(*record),
            _ => None,
        }
    }
}

pub type Result<T, E = DemuxError> = std::result::Result<T, E>;
