use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Structural violation found while reading a trade blob. Always fails closed:
/// the affected day is skipped and its bytes are never trusted for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("blob truncated reading {field}: need {need} bytes at {offset}, have {len}")]
    Truncated {
        field: &'static str,
        offset: usize,
        need: usize,
        len: usize,
    },

    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported version {found}, expected {expected}")]
    UnsupportedVersion { expected: u32, found: u32 },

    #[error("{what} out of bounds: offset {offset} len {len} exceeds buffer of {buf_len}")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        len: u64,
        buf_len: usize,
    },

    #[error("{what} offset {offset} is not {align}-byte aligned")]
    Misaligned {
        what: &'static str,
        offset: u64,
        align: u64,
    },

    #[error("row count mismatch: header declares {declared}, chunks hold {decoded}")]
    RowCountMismatch { declared: u64, decoded: u64 },

    #[error("arithmetic overflow reconstructing {0}")]
    Overflow(&'static str),

    #[error("invalid layout: {0}")]
    Layout(String),
}

/// Input that cannot be represented in the blob format. Fails only the day
/// being encoded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("time delta {delta}ms at row {row} exceeds i32 range")]
    TimeDeltaOverflow { row: usize, delta: i64 },

    #[error("quantity dictionary exceeds {limit} distinct values")]
    DictionaryOverflow { limit: usize },

    #[error("{field} at row {row} is not representable: {value}")]
    InvalidValue {
        field: &'static str,
        row: usize,
        value: f64,
    },

    #[error("column lengths differ: {0}")]
    ColumnLengthMismatch(String),

    #[error("{rows} rows exceed the u32 row-count field")]
    TooManyRows { rows: usize },

    #[error("chunk size {0} outside 1..=65535")]
    ChunkSize(usize),

    #[error("encoded blob of {0} bytes exceeds the u32 chunk-offset range")]
    OffsetOverflow(usize),

    #[error("trade block needs at least one row")]
    EmptyBlock,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed index {path}: {detail}")]
    MalformedIndex { path: PathBuf, detail: String },

    #[error(
        "index entry for day {day} spans [{offset}, {offset}+{length}) past data file of {file_len} bytes"
    )]
    EntryOutOfBounds {
        day: u8,
        offset: u64,
        length: u64,
        file_len: u64,
    },

    #[error("blob for day {day} is {length} bytes, above the {limit} byte cap")]
    BlobTooLarge { day: u8, length: u64, limit: u64 },

    #[error("checksum mismatch for day {day}: index {expected:#018x}, blob {actual:#018x}")]
    ChecksumMismatch { day: u8, expected: u64, actual: u64 },

    #[error("day {0} already indexed")]
    DuplicateDay(u8),

    #[error("day-of-month {0} outside 1..=31")]
    InvalidDay(u16),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Missing or unreadable files mean "day absent" rather than corruption.
    pub fn is_absent(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

#[derive(Debug, Error)]
pub enum FeatureFileError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("feature name {0:?} is empty or longer than 255 bytes")]
    BadName(String),

    #[error("feature name is not utf-8")]
    NameEncoding,

    #[error("{0} features exceed the u16 count field")]
    TooManyFeatures(usize),

    #[error("payload of {payload} bytes is not a whole number of {row_bytes}-byte rows")]
    RaggedRows { payload: usize, row_bytes: usize },

    #[error("feature {feature:?} has {found} rows, expected {expected}")]
    SeriesLength {
        feature: String,
        expected: usize,
        found: usize,
    },

    #[error("{names} names declared for {series} series")]
    NameCount { names: usize, series: usize },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("snapshot hash mismatch: expected {expected}, found {found}")]
    HashMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Run-level failures. Per-day problems never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read data root {path}: {source}")]
    DataRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
