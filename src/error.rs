use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CarveError>;

/// Failures that escape a carving session. Rejected candidates are not
/// errors; they are the common case and are only counted.
#[derive(Debug, Error)]
pub enum CarveError {
    /// The source file cannot be opened or read at all. Fatal for that
    /// source, reported per file in a batch.
    #[error("cannot read source {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A resolved boundary runs past the end of the source (or not past its
    /// own start). The candidate is skipped.
    #[error("segment end {end} outside source of {source_len} bytes")]
    BoundaryOverflow { end: u64, source_len: u64 },

    /// An output file could not be written. Any partial output is removed.
    #[error("cannot write output {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cooperative shutdown was requested.
    #[error("operation cancelled")]
    Cancelled,
}

impl CarveError {
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CarveError::Cancelled)
    }
}
