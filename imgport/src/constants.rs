//! Constants for the import pipeline and upload server.
//!
//! Centralized location for well-known paths, file names and defaults.

/// HTTP routes served by the upload server.
pub mod paths {
    /// Synchronous upload, raw body.
    pub const UPLOAD_SYNC: &str = "/v1beta1/upload";

    /// Asynchronous upload, raw body. Also accepts `HEAD` as a
    /// readiness probe.
    pub const UPLOAD_ASYNC: &str = "/v1beta1/upload-async";

    /// Synchronous upload, `multipart/form-data` body (field `file`).
    pub const UPLOAD_FORM_SYNC: &str = "/v1beta1/upload-form";

    /// Asynchronous upload, multipart body.
    pub const UPLOAD_FORM_ASYNC: &str = "/v1beta1/upload-form-async";

    /// Legacy alias of [`UPLOAD_SYNC`].
    pub const UPLOAD_SYNC_ALPHA: &str = "/v1alpha1/upload";

    /// Legacy alias of [`UPLOAD_ASYNC`].
    pub const UPLOAD_ASYNC_ALPHA: &str = "/v1alpha1/upload-async";

    /// Health probe, served on its own listener.
    pub const HEALTHZ: &str = "/healthz";
}

/// File names and modes on the target and scratch volumes.
pub mod files {
    /// Image file created inside a filesystem target directory.
    pub const DATA_FILE_NAME: &str = "disk.img";

    /// Staging file written into the scratch directory before
    /// conversion.
    pub const SCRATCH_IMAGE_NAME: &str = "staging.img";

    /// Mode of the finished target file. Group access is for the qemu
    /// group (GID 107) on hosts that run guests against the volume.
    pub const DATA_FILE_MODE: u32 = 0o660;
}

/// Default tunables.
pub mod defaults {
    /// Fraction of a filesystem target reserved for filesystem
    /// overhead during validation.
    pub const FILESYSTEM_OVERHEAD: f64 = 0.055;

    /// Multipart form field carrying the image bytes.
    pub const FORM_FIELD_NAME: &str = "file";
}
