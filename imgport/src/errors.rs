//! Error types for the import pipeline and upload server.
//!
//! One flat enum covers the whole crate; variants map onto the failure
//! kinds the operator acts on (scratch space, source too large,
//! unauthorized client) rather than onto modules. The upload server
//! translates variants to HTTP status codes in `server::status_for`.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ImportResult<T> = Result<T, ImportError>;

/// Errors produced by the import pipeline, qemu operations and the
/// upload server.
#[derive(Debug, Error)]
pub enum ImportError {
    /// A transfer rejected its scratch path. The operator must provide
    /// scratch space and retry.
    #[error("scratch space required and none found")]
    RequiresScratchSpace,

    /// A source reported an unusable destination path.
    #[error("invalid transfer path")]
    InvalidPath,

    /// The driver was asked to dispatch a phase it does not know.
    /// Programming error, fatal.
    #[error("unknown processing phase {0:?}")]
    UnknownPhase(String),

    /// The source image references a backing file and is ineligible
    /// for conversion.
    #[error("image {url} is invalid because it has backing file {backing_file}")]
    BackingFileNotAllowed { url: String, backing_file: String },

    /// The source image format is outside the accepted set.
    #[error("unsupported image format {0:?}, expected raw or qcow2")]
    UnsupportedFormat(String),

    /// The source's virtual size does not fit the target.
    #[error(
        "virtual image size {virtual_size} is larger than the available size {available}"
    )]
    SourceTooLarge { virtual_size: i64, available: i64 },

    /// `qemu-img convert` failed.
    #[error("conversion to raw failed: {0}")]
    ConversionFailed(String),

    /// Resize would shrink the image; only in-place expansion is
    /// supported.
    #[error("shrinking image from {current} to {requested} bytes is not supported")]
    ResizeShrinkRefused { current: i64, requested: i64 },

    /// `qemu-img resize` failed.
    #[error("resize of image failed: {0}")]
    ResizeFailed(String),

    /// Client certificate identity did not match the expected name.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Another upload is already in flight.
    #[error("server is busy with another upload")]
    Busy,

    /// An upload has already completed on this server.
    #[error("upload already completed")]
    Conflict,

    /// The HTTP body stream failed mid-transfer.
    #[error("stream error: {0}")]
    Stream(String),

    /// The request was malformed (wrong content type, bad form).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A size string could not be parsed.
    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    /// A `qemu-img` invocation failed; stderr is attached.
    #[error("qemu-img {op} failed: {stderr}")]
    Qemu { op: &'static str, stderr: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything that does not fit the taxonomy above.
    #[error("{0}")]
    Internal(String),
}
