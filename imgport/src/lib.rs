//! imgport - phased disk-image import.
//!
//! Imports disk-image data from a streamed source into a target block
//! device or filesystem-mounted file, producing a RAW image of a
//! requested virtual size. The crate provides:
//!
//! - [`processor::DataProcessor`] - the phase state machine driving a
//!   [`processor::DataSource`] from initial probe to a finished image
//! - [`qemu::QemuOperations`] - a narrow interface over the `qemu-img`
//!   binary (info, validate, convert, resize, blank image)
//! - [`server::UploadServer`] - an HTTPS endpoint that accepts a
//!   streamed image body under mutual TLS and feeds it to the processor
//! - [`space`] / [`size`] - byte arithmetic for targets and requests

pub mod constants;
pub mod errors;
pub mod pipeline;
pub mod processor;
pub mod qemu;
pub mod server;
pub mod size;
pub mod space;
pub mod trace;

pub use errors::{ImportError, ImportResult};
pub use pipeline::TargetLayout;
pub use processor::{ContentType, DataProcessor, DataSource, ProcessOutcome, ProcessingPhase};
pub use qemu::{ImgInfo, QemuImg, QemuOperations};
pub use server::{ServerConfig, TlsMaterial, UploadServer};
pub use size::Quantity;
pub use trace::ErrorTrace;
