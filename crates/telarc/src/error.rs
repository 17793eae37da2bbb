//! Error and Result types for archive operations.

use crate::store::column::DType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// The error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Invalid magic bytes in a column or stat file header.
    #[error("Invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Expected magic bytes.
        expected: [u8; 4],
        /// Magic bytes found in the file.
        actual: [u8; 4],
    },

    /// Unsupported on-disk file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// File header checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Element type of an append differs from the on-disk column metadata.
    #[error("Schema mismatch for {path}: column is {on_disk:?}, got {requested:?}")]
    SchemaMismatch {
        /// Path of the column file.
        path: PathBuf,
        /// Element type recorded in the file header.
        on_disk: DType,
        /// Element type of the attempted operation.
        requested: DType,
    },

    /// Two parallel arrays of one content type have unequal lengths.
    /// Signals prior corruption; the content must be truncated and rebuilt.
    #[error("Length drift in content {content}: {msid} has {rows} rows, expected {expected}")]
    LengthDrift {
        /// Content type name.
        content: String,
        /// MSID whose column length disagrees.
        msid: String,
        /// Observed row count.
        rows: u64,
        /// Row count of the shared TIME column.
        expected: u64,
    },

    /// Malformed or unreadable source file. The file is skipped and the
    /// catalog is not advanced.
    #[error("Decom error in {filename}: {reason}")]
    SourceDecom {
        /// Source file name.
        filename: String,
        /// Description of the problem.
        reason: String,
    },

    /// Time gap between the previous file's tstop and a candidate tstart
    /// exceeds the hard limit, or the candidate overlaps ingested data.
    #[error("Gap of {gap_secs:.2} s before {filename} in content {content}")]
    Gap {
        /// Content type name.
        content: String,
        /// Source file that triggered the rejection.
        filename: String,
        /// Measured gap in seconds (negative for overlap).
        gap_secs: f64,
    },

    /// A source file with an already-ingested filetime was seen again.
    #[error("File {filename} duplicates filetime {filetime} in content {content}")]
    OverlappingFile {
        /// Content type name.
        content: String,
        /// Duplicate source file name.
        filename: String,
        /// Filetime already present in the catalog.
        filetime: i64,
    },

    /// Archive state inconsistent with its own invariants (catalog vs
    /// column lengths, non-monotonic TIME). Fatal for the content.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A row slice request falls outside the stored data.
    #[error("Row range {row_lo}..{row_hi} out of range for {rows} rows")]
    OutOfRange {
        /// Requested start row.
        row_lo: u64,
        /// Requested stop row (exclusive).
        row_hi: u64,
        /// Rows available.
        rows: u64,
    },

    /// A glob pattern matched no known MSID.
    #[error("MSID {0} is not in the archive")]
    UnknownMsid(String),

    /// A glob pattern matched more MSIDs than the configured limit.
    #[error("Pattern {pattern} matched {matches} MSIDs (limit {limit})")]
    GlobOverMatch {
        /// Offending pattern.
        pattern: String,
        /// Number of matches.
        matches: usize,
        /// Configured match limit.
        limit: usize,
    },

    /// Malformed glob pattern.
    #[error("Invalid pattern: {0}")]
    Pattern(String),

    /// Operation not defined for the data at hand (e.g. interpolating a
    /// statistics result).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Error from the archfiles catalog database.
    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
