//! Copy-on-write volumes and subvolumes.
//!
//! A project owns one volume; every branch is a subvolume beneath the
//! volume's mount point. Snapshots share file extents with their source
//! wherever the filesystem supports reflinks.

mod driver;
mod error;
pub mod reflink;
mod usage;

pub use driver::{device_path, ReflinkVolumeDriver};
pub use error::VolumeError;
pub use usage::SubvolumeUsage;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A created project volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    /// Backing location of the volume.
    pub device: PathBuf,
    /// Where the volume is (or will be) mounted.
    pub mount_point: PathBuf,
    /// Capacity recorded at creation.
    pub size_bytes: u64,
}

/// A subvolume produced by [`VolumeDriver::create_subvolume`] or
/// [`VolumeDriver::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeHandle {
    /// Path of the subvolume.
    pub path: PathBuf,
    /// Files cloned by reflink while snapshotting.
    pub reflinked_files: u64,
    /// Files that had to be copied byte by byte.
    pub copied_files: u64,
}

impl SubvolumeHandle {
    pub(crate) fn empty(path: PathBuf) -> Self {
        Self {
            path,
            reflinked_files: 0,
            copied_files: 0,
        }
    }
}

/// Filesystem capability used by the branch manager.
///
/// Implementations are synchronous; callers on the async runtime move them
/// onto the blocking pool.
pub trait VolumeDriver: Send + Sync + std::fmt::Debug {
    /// Creates the backing volume at `device` for later mounting at `mount_point`.
    ///
    /// # Errors
    ///
    /// Fails with [`VolumeError::VolumeExists`] if a volume is already there.
    fn create_volume(
        &self,
        device: &Path,
        mount_point: &Path,
        size_bytes: u64,
    ) -> Result<VolumeHandle, VolumeError>;

    /// Deletes a volume and everything in it, unmounting it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be unmounted or removed.
    fn delete_volume(&self, handle: &VolumeHandle) -> Result<(), VolumeError>;

    /// Mounts `device` at `mount_point`. Mounting an already mounted target is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if `device` is not a volume or `mount_point` is occupied by something else.
    fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), VolumeError>;

    /// Unmounts `mount_point`. Unmounting an unmounted target is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if `mount_point` is something other than a volume mount.
    fn unmount(&self, mount_point: &Path) -> Result<(), VolumeError>;

    /// Whether a volume is currently mounted at `mount_point`.
    fn is_mounted(&self, mount_point: &Path) -> bool;

    /// Creates an empty subvolume.
    ///
    /// # Errors
    ///
    /// Fails with [`VolumeError::SnapshotConflict`] if `path` already exists.
    fn create_subvolume(&self, path: &Path) -> Result<SubvolumeHandle, VolumeError>;

    /// Creates a writable CoW snapshot of `parent` at `new`.
    ///
    /// # Errors
    ///
    /// Fails with [`VolumeError::SourceNotFound`] if `parent` is missing and
    /// [`VolumeError::SnapshotConflict`] if `new` already exists.
    fn snapshot(&self, parent: &Path, new: &Path) -> Result<SubvolumeHandle, VolumeError>;

    /// Deletes a subvolume. A missing subvolume is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the subvolume cannot be removed.
    fn delete_subvolume(&self, path: &Path) -> Result<(), VolumeError>;

    /// Logical size and file count of a subvolume.
    ///
    /// # Errors
    ///
    /// Returns an error if the subvolume cannot be walked.
    fn usage(&self, path: &Path) -> Result<SubvolumeUsage, VolumeError>;
}
