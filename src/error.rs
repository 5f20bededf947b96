use std::fmt;

use thiserror::Error;

/// Squeeze's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Squeeze's crate-wide error type.
///
/// Every variant is terminal for the compression that raised it. We never retry a fault; only
/// bounded-wait poll timeouts are retried, and those are not errors at all.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// A required request field is missing or has the wrong type. Raised before any I/O.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The source container has no recognizable video stream.
    #[error("video track not found")]
    NoVideoTrack,

    /// The source could not be opened for reading.
    #[error("failed to start reading source: {0}")]
    ReaderStartFailed(String),

    /// An input could not be attached to the output container.
    #[error("cannot add writer input: {0}")]
    WriterInputError(String),

    /// Demuxing or decoding failed after reading had started.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Encoding or muxing failed after writing had started.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The caller cancelled the compression.
    #[error("compression cancelled")]
    Cancelled,

    /// Codec configuration or runtime faults not covered by the other kinds.
    #[error("compression error: {0}")]
    CompressionError(String),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub(crate) fn compression(message: impl Into<String>) -> Self {
        Self::CompressionError(message.into())
    }

    /// The wire code reported to bridge callers for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArguments(_) => ErrorCode::InvalidArguments,
            Self::NoVideoTrack => ErrorCode::NoVideoTrack,
            Self::ReaderStartFailed(_) => ErrorCode::ReaderStartFailed,
            Self::WriterInputError(_) => ErrorCode::WriterInputError,
            Self::ReadFailed(_) => ErrorCode::ReadFailed,
            Self::WriteFailed(_) => ErrorCode::WriteFailed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::CompressionError(_) => ErrorCode::CompressionError,
        }
    }

    /// Whether this error only reflects a stop request (from the caller or a failing sibling).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::CompressionError(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::CompressionError(err.to_string())
    }
}

/// Stable, machine-readable error codes.
///
/// These are the strings a bridge (plugin channel, JSON lines, ...) hands to its caller next to the
/// human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArguments,
    NoVideoTrack,
    ReaderStartFailed,
    WriterInputError,
    ReadFailed,
    WriteFailed,
    Cancelled,
    CompressionError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::NoVideoTrack => "NO_VIDEO_TRACK",
            Self::ReaderStartFailed => "READER_START_FAILED",
            Self::WriterInputError => "WRITER_INPUT_ERROR",
            Self::ReadFailed => "READ_FAILED",
            Self::WriteFailed => "WRITE_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::CompressionError => "COMPRESSION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
