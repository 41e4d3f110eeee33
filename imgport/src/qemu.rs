//! Narrow interface over the `qemu-img` command-line tool.
//!
//! Every operation shells out to the binary and captures stderr into
//! the returned error. The trait exists so tests can substitute a fake
//! that records invocations without spawning subprocesses.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::errors::{ImportError, ImportResult};
use crate::size::Quantity;

/// Source formats accepted for conversion.
pub const SOURCE_FORMATS: &[&str] = &["raw", "qcow2"];

/// Metadata reported by `qemu-img info --output=json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImgInfo {
    /// Image format, e.g. `"raw"` or `"qcow2"`.
    #[serde(default)]
    pub format: String,
    /// Virtual (guest-visible) size in bytes.
    #[serde(default)]
    pub virtual_size: i64,
    /// Bytes actually allocated on disk.
    #[serde(default)]
    pub actual_size: i64,
    /// Backing file reference, if the image has one. A non-empty value
    /// makes the image ineligible for conversion.
    #[serde(default)]
    pub backing_filename: Option<String>,
}

/// Operations the import pipeline needs from `qemu-img`.
///
/// All operations are synchronous and blocking; retry policy belongs
/// to the caller.
pub trait QemuOperations: Send + Sync {
    /// Probe an image and return its metadata. Accepts `file://` and
    /// `http(s)://` URLs as well as plain paths.
    fn info(&self, url: &str) -> ImportResult<ImgInfo>;

    /// Convert the image at `url` to a RAW stream written at `dest`.
    /// `dest` may be a regular file or a block device; the output
    /// never references a backing file.
    fn convert_to_raw_stream(&self, url: &str, dest: &Path) -> ImportResult<()>;

    /// Expand the raw image at `dest` to `size` bytes in place.
    /// Shrinking is refused.
    fn resize(&self, dest: &Path, size: Quantity) -> ImportResult<()>;

    /// Write a zero-filled raw image of exactly `size` bytes at
    /// `dest`. Sparse output is acceptable on filesystem targets.
    fn create_blank_image(&self, dest: &Path, size: Quantity) -> ImportResult<()>;

    /// Check that the image at `url` can be imported into
    /// `available` bytes: known format, no backing file, fits.
    fn validate(&self, url: &str, available: i64) -> ImportResult<()> {
        let info = self.info(url)?;
        if let Some(backing) = info.backing_filename.as_deref() {
            if !backing.is_empty() {
                return Err(ImportError::BackingFileNotAllowed {
                    url: url.to_string(),
                    backing_file: backing.to_string(),
                });
            }
        }
        if !SOURCE_FORMATS.contains(&info.format.as_str()) {
            return Err(ImportError::UnsupportedFormat(info.format));
        }
        if info.virtual_size > available {
            return Err(ImportError::SourceTooLarge {
                virtual_size: info.virtual_size,
                available,
            });
        }
        Ok(())
    }
}

/// Default implementation running the `qemu-img` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct QemuImg;

impl QemuImg {
    fn run(&self, op: &'static str, cmd: &mut Command) -> ImportResult<Vec<u8>> {
        tracing::debug!(?cmd, "running qemu-img");
        let output = cmd.output().map_err(|e| ImportError::Qemu {
            op,
            stderr: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(ImportError::Qemu {
                op,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl QemuOperations for QemuImg {
    fn info(&self, url: &str) -> ImportResult<ImgInfo> {
        let stdout = self.run(
            "info",
            Command::new("qemu-img").args(["info", "--output=json", qemu_arg(url)]),
        )?;
        parse_img_info(&stdout)
    }

    fn convert_to_raw_stream(&self, url: &str, dest: &Path) -> ImportResult<()> {
        self.run(
            "convert",
            Command::new("qemu-img")
                .args(["convert", "-t", "none", "-O", "raw", qemu_arg(url)])
                .arg(dest),
        )?;
        Ok(())
    }

    fn resize(&self, dest: &Path, size: Quantity) -> ImportResult<()> {
        let current = self.info(&format!("file://{}", dest.display()))?;
        if size.bytes() < current.virtual_size {
            return Err(ImportError::ResizeShrinkRefused {
                current: current.virtual_size,
                requested: size.bytes(),
            });
        }
        self.run(
            "resize",
            Command::new("qemu-img")
                .args(["resize", "-f", "raw"])
                .arg(dest)
                .arg(size.bytes().to_string()),
        )?;
        Ok(())
    }

    fn create_blank_image(&self, dest: &Path, size: Quantity) -> ImportResult<()> {
        tracing::info!(dest = %dest.display(), %size, "creating blank raw image");
        self.run(
            "create",
            Command::new("qemu-img")
                .args(["create", "-f", "raw"])
                .arg(dest)
                .arg(size.bytes().to_string()),
        )?;
        Ok(())
    }
}

/// Strip a `file://` scheme; qemu-img takes local images as plain
/// paths. Remote URLs pass through unchanged.
fn qemu_arg(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

fn parse_img_info(raw: &[u8]) -> ImportResult<ImgInfo> {
    serde_json::from_slice(raw).map_err(|e| ImportError::Qemu {
        op: "info",
        stderr: format!("unparseable qemu-img info output: {}", e),
    })
}
