//! Available-space arithmetic for filesystem and block targets.
//!
//! A target is either a directory on a mounted filesystem or a raw
//! block device; the two are distinguished by observing that statvfs
//! reports free bytes for the former and fails (or reports nothing
//! useful) for the latter.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use nix::sys::statvfs::statvfs;
use serde::Deserialize;

use crate::constants::defaults;
use crate::errors::{ImportError, ImportResult};

// BLKGETSIZE64, defined in linux/fs.h.
const BLKGETSIZE64_CODE: u8 = 0x12;
const BLKGETSIZE64_SEQ: u8 = 114;
nix::ioctl_read!(ioctl_blkgetsize64, BLKGETSIZE64_CODE, BLKGETSIZE64_SEQ, u64);

/// Bytes free in the filesystem holding `path`, or a negative value
/// when the path is not a usable filesystem directory.
pub fn available_space(path: &Path) -> i64 {
    match statvfs(path) {
        Ok(stat) => stat.blocks_available() as i64 * stat.fragment_size() as i64,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "statvfs failed");
            -1
        }
    }
}

/// Total size of the block device at `path`, or a negative value when
/// the path is not a block device.
pub fn available_space_block(path: &Path) -> i64 {
    let is_block = std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    if !is_block {
        return -1;
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "cannot open block device");
            return -1;
        }
    };
    let mut size = 0u64;
    match unsafe { ioctl_blkgetsize64(file.as_raw_fd(), &mut size) } {
        Ok(_) => size as i64,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "BLKGETSIZE64 failed");
            -1
        }
    }
}

/// Bytes usable for image data after reserving the filesystem
/// overhead fraction.
pub fn effective_available(available: i64, overhead: f64) -> i64 {
    (available as f64 * (1.0 - overhead)).floor() as i64
}

/// Reserved fraction of filesystem capacity, global with optional
/// per-storage-class overrides.
///
/// Loaded from a small JSON config; values outside `[0, 1)` are
/// rejected at parse time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemOverhead {
    #[serde(default)]
    global: Option<Percent>,
    #[serde(default)]
    storage_class: HashMap<String, Percent>,
}

impl FilesystemOverhead {
    /// The overhead fraction for `storage_class`, falling back to the
    /// global value and then the built-in default.
    pub fn for_storage_class(&self, storage_class: Option<&str>) -> f64 {
        storage_class
            .and_then(|sc| self.storage_class.get(sc))
            .or(self.global.as_ref())
            .map(|p| p.0)
            .unwrap_or(defaults::FILESYSTEM_OVERHEAD)
    }
}

impl Default for FilesystemOverhead {
    fn default() -> Self {
        FilesystemOverhead {
            global: None,
            storage_class: HashMap::new(),
        }
    }
}

/// An overhead fraction, valid in `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "f64")]
pub struct Percent(f64);

impl TryFrom<f64> for Percent {
    type Error = ImportError;

    fn try_from(value: f64) -> ImportResult<Self> {
        if (0.0..1.0).contains(&value) {
            Ok(Percent(value))
        } else {
            Err(ImportError::Internal(format!(
                "overhead {} outside [0, 1)",
                value
            )))
        }
    }
}
