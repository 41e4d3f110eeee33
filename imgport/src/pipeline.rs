//! Target layout selection and pipeline wiring.
//!
//! The target volume is either a directory on a mounted filesystem
//! (image lands at `<data_dir>/disk.img`) or a raw block device
//! (writes go straight to the device, no directory exists).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::constants::files;
use crate::errors::ImportResult;
use crate::qemu::QemuOperations;
use crate::size::Quantity;
use crate::space;

/// Where the finished image lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLayout {
    /// A mounted filesystem directory; the image is a regular file
    /// inside it.
    Filesystem { data_dir: PathBuf, data_file: PathBuf },
    /// A raw block device; the device itself is the image.
    Block { device: PathBuf },
}

impl TargetLayout {
    /// Decide the layout for `destination`: a path with free
    /// filesystem space is a directory target, anything else is
    /// treated as a block device.
    pub fn detect(destination: &Path) -> Self {
        if space::available_space(destination) > 0 {
            TargetLayout::filesystem(destination)
        } else {
            tracing::debug!(dest = %destination.display(), "no filesystem space, block target");
            TargetLayout::Block {
                device: destination.to_path_buf(),
            }
        }
    }

    /// A filesystem layout rooted at `data_dir`.
    pub fn filesystem(data_dir: &Path) -> Self {
        TargetLayout::Filesystem {
            data_dir: data_dir.to_path_buf(),
            data_file: data_dir.join(files::DATA_FILE_NAME),
        }
    }

    /// The file (or device) the finished image is written to.
    pub fn data_file(&self) -> &Path {
        match self {
            TargetLayout::Filesystem { data_file, .. } => data_file,
            TargetLayout::Block { device } => device,
        }
    }

    /// The directory handed to sources transferring directly to the
    /// target. Block targets have no directory, so the device path
    /// stands in.
    pub fn transfer_dir(&self) -> &Path {
        match self {
            TargetLayout::Filesystem { data_dir, .. } => data_dir,
            TargetLayout::Block { device } => device,
        }
    }

    pub fn is_filesystem(&self) -> bool {
        matches!(self, TargetLayout::Filesystem { .. })
    }

    /// Free bytes on the target, sampled now. Filesystem targets
    /// report free space in the directory, block targets the device
    /// size.
    pub fn available_space(&self) -> i64 {
        match self {
            TargetLayout::Filesystem { data_dir, .. } => space::available_space(data_dir),
            TargetLayout::Block { device } => space::available_space_block(device),
        }
    }
}

/// Populate the target with a blank raw image of
/// `min(requested, available)` bytes.
pub fn create_blank_image(
    qemu: &dyn QemuOperations,
    layout: &TargetLayout,
    requested: Quantity,
) -> ImportResult<()> {
    let available = Quantity::from_bytes(layout.available_space());
    let size = requested.min(available);
    if size != requested {
        tracing::warn!(
            %requested,
            actual = %size,
            "available space is less than requested, creating a smaller image"
        );
    }
    qemu.create_blank_image(layout.data_file(), size)?;
    if layout.is_filesystem() {
        set_data_file_permissions(layout.data_file())?;
    }
    Ok(())
}

/// Apply the well-known target file mode.
pub(crate) fn set_data_file_permissions(path: &Path) -> ImportResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(files::DATA_FILE_MODE))?;
    Ok(())
}

/// Render a local path as the `file://` URL handed to qemu.
pub(crate) fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
