use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a [`super::VolumeDriver`].
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Snapshot source does not exist.
    #[error("snapshot source not found: {path:?}")]
    SourceNotFound {
        /// Missing source.
        path: PathBuf,
    },

    /// Snapshot or subvolume destination already exists.
    #[error("destination already exists: {path:?}")]
    SnapshotConflict {
        /// Existing destination.
        path: PathBuf,
    },

    /// A volume already lives at the requested device path.
    #[error("volume already exists at {path:?}")]
    VolumeExists {
        /// Device path.
        path: PathBuf,
    },

    /// The path is not a volume created by this driver.
    #[error("not a volume: {path:?}")]
    NotAVolume {
        /// Offending path.
        path: PathBuf,
    },

    /// The mount point is occupied by something that is not this volume.
    #[error("mount point {mount_point:?} is busy")]
    MountPointBusy {
        /// Occupied mount point.
        mount_point: PathBuf,
    },

    /// The volume is not mounted, so its subvolumes are unreachable.
    #[error("volume is not mounted at {mount_point:?}")]
    NotMounted {
        /// Expected mount point.
        mount_point: PathBuf,
    },

    /// The filesystem cannot clone file extents and copying is not allowed.
    #[error("filesystem at {path:?} does not support reflinks")]
    ReflinkUnsupported {
        /// File that could not be cloned.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure.
    #[error("{op} failed for {path:?}")]
    Io {
        /// Operation being performed.
        op: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl VolumeError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { op, path, source }
    }
}
