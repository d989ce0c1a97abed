//! Directory-backed volume driver.
//!
//! A volume is a directory tagged with a marker file; mounting links the
//! mount point to it, so subvolumes are only reachable while mounted.
//! Snapshots clone file extents with reflinks on filesystems that support
//! them (btrfs, XFS, bcachefs, APFS) and fall back to copying elsewhere.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::reflink::copy_tree;
use super::usage;
use super::{SubvolumeHandle, SubvolumeUsage, VolumeDriver, VolumeError, VolumeHandle};

const MARKER: &str = ".dbranch-volume.json";
const PROBE: &str = ".dbranch-reflink-probe";

#[derive(Debug, Serialize, Deserialize)]
struct VolumeMarker {
    size_bytes: u64,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// [`VolumeDriver`] over plain directories with reflink snapshots.
#[derive(Debug, Clone, Default)]
pub struct ReflinkVolumeDriver {
    require_reflink: bool,
}

impl ReflinkVolumeDriver {
    /// Creates a driver. With `require_reflink`, snapshots never degrade to a byte copy.
    #[must_use]
    pub fn new(require_reflink: bool) -> Self {
        Self { require_reflink }
    }

    fn is_volume(device: &Path) -> bool {
        device.join(MARKER).is_file()
    }

    fn probe_reflink(device: &Path) -> Result<(), VolumeError> {
        let src = device.join(PROBE);
        let dst = device.join(format!("{PROBE}.clone"));
        fs::write(&src, b"probe").map_err(VolumeError::io("write probe", &src))?;
        let result = reflink::reflink(&src, &dst);
        let _ = fs::remove_file(&src);
        let _ = fs::remove_file(&dst);
        result.map_err(|source| VolumeError::ReflinkUnsupported {
            path: device.to_path_buf(),
            source,
        })
    }

    fn ensure_reachable(path: &Path) -> Result<(), VolumeError> {
        match path.parent() {
            Some(parent) if !parent.is_dir() => Err(VolumeError::NotMounted {
                mount_point: parent.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }

    fn ensure_absent(path: &Path) -> Result<(), VolumeError> {
        match fs::symlink_metadata(path) {
            Ok(_) => Err(VolumeError::SnapshotConflict {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::io("stat", path)(e)),
        }
    }
}

impl VolumeDriver for ReflinkVolumeDriver {
    #[instrument(skip(self))]
    fn create_volume(
        &self,
        device: &Path,
        mount_point: &Path,
        size_bytes: u64,
    ) -> Result<VolumeHandle, VolumeError> {
        if Self::is_volume(device) {
            return Err(VolumeError::VolumeExists {
                path: device.to_path_buf(),
            });
        }
        let existed = device.exists();
        fs::create_dir_all(device).map_err(VolumeError::io("create volume", device))?;

        if self.require_reflink {
            if let Err(e) = Self::probe_reflink(device) {
                if !existed {
                    let _ = fs::remove_dir_all(device);
                }
                return Err(e);
            }
        }

        let marker = VolumeMarker {
            size_bytes,
            created_at: chrono::Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&marker)
            .map_err(|e| VolumeError::io("encode marker", device)(e.into()))?;
        let marker_path = device.join(MARKER);
        fs::write(&marker_path, body).map_err(VolumeError::io("write marker", &marker_path))?;

        info!("Created volume {:?} ({} bytes)", device, size_bytes);
        Ok(VolumeHandle {
            device: device.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            size_bytes,
        })
    }

    #[instrument(skip(self))]
    fn delete_volume(&self, handle: &VolumeHandle) -> Result<(), VolumeError> {
        self.unmount(&handle.mount_point)?;
        if !handle.device.exists() {
            debug!("Volume {:?} already gone", handle.device);
            return Ok(());
        }
        if !Self::is_volume(&handle.device) {
            return Err(VolumeError::NotAVolume {
                path: handle.device.clone(),
            });
        }
        fs::remove_dir_all(&handle.device)
            .map_err(VolumeError::io("delete volume", &handle.device))?;
        info!("Deleted volume {:?}", handle.device);
        Ok(())
    }

    #[instrument(skip(self))]
    fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), VolumeError> {
        if !Self::is_volume(device) {
            return Err(VolumeError::NotAVolume {
                path: device.to_path_buf(),
            });
        }
        let device =
            dunce::canonicalize(device).map_err(VolumeError::io("canonicalize", device))?;

        match fs::symlink_metadata(mount_point) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current =
                    fs::read_link(mount_point).map_err(VolumeError::io("read link", mount_point))?;
                if current == device {
                    debug!("{:?} already mounted", mount_point);
                    return Ok(());
                }
                return Err(VolumeError::MountPointBusy {
                    mount_point: mount_point.to_path_buf(),
                });
            }
            Ok(meta) if meta.is_dir() => {
                // An empty directory is a conventional mount point; take it over.
                fs::remove_dir(mount_point).map_err(|_| VolumeError::MountPointBusy {
                    mount_point: mount_point.to_path_buf(),
                })?;
            }
            Ok(_) => {
                return Err(VolumeError::MountPointBusy {
                    mount_point: mount_point.to_path_buf(),
                });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(VolumeError::io("stat", mount_point)(e)),
        }

        if let Some(parent) = mount_point.parent() {
            fs::create_dir_all(parent).map_err(VolumeError::io("create dir", parent))?;
        }
        link_dir(&device, mount_point).map_err(VolumeError::io("mount", mount_point))?;
        info!("Mounted {:?} at {:?}", device, mount_point);
        Ok(())
    }

    #[instrument(skip(self))]
    fn unmount(&self, mount_point: &Path) -> Result<(), VolumeError> {
        match fs::symlink_metadata(mount_point) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{:?} not mounted", mount_point);
                Ok(())
            }
            Err(e) => Err(VolumeError::io("stat", mount_point)(e)),
            Ok(meta) if meta.file_type().is_symlink() => {
                unlink_dir(mount_point).map_err(VolumeError::io("unmount", mount_point))?;
                info!("Unmounted {:?}", mount_point);
                Ok(())
            }
            Ok(_) => Err(VolumeError::NotAVolume {
                path: mount_point.to_path_buf(),
            }),
        }
    }

    fn is_mounted(&self, mount_point: &Path) -> bool {
        fs::symlink_metadata(mount_point).is_ok_and(|m| m.file_type().is_symlink())
            && Self::is_volume(mount_point)
    }

    #[instrument(skip(self))]
    fn create_subvolume(&self, path: &Path) -> Result<SubvolumeHandle, VolumeError> {
        Self::ensure_reachable(path)?;
        Self::ensure_absent(path)?;
        fs::create_dir(path).map_err(VolumeError::io("create subvolume", path))?;
        Ok(SubvolumeHandle::empty(path.to_path_buf()))
    }

    #[instrument(skip(self))]
    fn snapshot(&self, parent: &Path, new: &Path) -> Result<SubvolumeHandle, VolumeError> {
        if !parent.is_dir() {
            return Err(VolumeError::SourceNotFound {
                path: parent.to_path_buf(),
            });
        }
        Self::ensure_reachable(new)?;
        Self::ensure_absent(new)?;

        match copy_tree(parent, new, self.require_reflink) {
            Ok(stats) => Ok(SubvolumeHandle {
                path: new.to_path_buf(),
                reflinked_files: stats.reflinked,
                copied_files: stats.copied,
            }),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(new) {
                    warn!("Failed to remove partial snapshot {:?}: {}", new, cleanup);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    fn delete_subvolume(&self, path: &Path) -> Result<(), VolumeError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Subvolume {:?} already gone", path);
                Ok(())
            }
            Err(e) => Err(VolumeError::io("delete subvolume", path)(e)),
        }
    }

    fn usage(&self, path: &Path) -> Result<SubvolumeUsage, VolumeError> {
        usage::measure(path)
    }
}

#[cfg(unix)]
fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn unlink_dir(link: &Path) -> std::io::Result<()> {
    fs::remove_file(link)
}

#[cfg(windows)]
fn unlink_dir(link: &Path) -> std::io::Result<()> {
    fs::remove_dir(link)
}

/// Default device path for a project's volume under `mount_root`.
#[must_use]
pub fn device_path(mount_root: &Path, project: &str) -> PathBuf {
    mount_root.join(".volumes").join(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _root: tempfile::TempDir,
        device: PathBuf,
        mount: PathBuf,
        driver: ReflinkVolumeDriver,
    }

    fn mounted() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let device = root.path().join("dev/p1");
        let mount = root.path().join("mnt/p1");
        let driver = ReflinkVolumeDriver::default();
        driver.create_volume(&device, &mount, 1 << 30).unwrap();
        driver.mount(&device, &mount).unwrap();
        Fixture {
            _root: root,
            device,
            mount,
            driver,
        }
    }

    #[test]
    fn mount_and_unmount_are_idempotent() {
        let f = mounted();
        assert!(f.driver.is_mounted(&f.mount));
        f.driver.mount(&f.device, &f.mount).unwrap();

        f.driver.unmount(&f.mount).unwrap();
        assert!(!f.driver.is_mounted(&f.mount));
        f.driver.unmount(&f.mount).unwrap();
    }

    #[test]
    fn second_volume_at_same_device_is_rejected() {
        let f = mounted();
        let err = f.driver.create_volume(&f.device, &f.mount, 1).unwrap_err();
        assert!(matches!(err, VolumeError::VolumeExists { .. }));
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let f = mounted();
        let main = f.mount.join("main");
        f.driver.create_subvolume(&main).unwrap();
        fs::write(main.join("table"), b"before").unwrap();

        let b1 = f.mount.join("b1");
        f.driver.snapshot(&main, &b1).unwrap();
        fs::write(main.join("table"), b"after").unwrap();
        fs::write(main.join("new"), b"later").unwrap();

        assert_eq!(fs::read(b1.join("table")).unwrap(), b"before");
        assert!(!b1.join("new").exists());
    }

    #[test]
    fn snapshot_errors() {
        let f = mounted();
        let main = f.mount.join("main");
        let err = f.driver.snapshot(&main, &f.mount.join("x")).unwrap_err();
        assert!(matches!(err, VolumeError::SourceNotFound { .. }));

        f.driver.create_subvolume(&main).unwrap();
        let err = f.driver.snapshot(&main, &main).unwrap_err();
        assert!(matches!(err, VolumeError::SnapshotConflict { .. }));
    }

    #[test]
    fn subvolumes_unreachable_while_unmounted() {
        let f = mounted();
        f.driver.unmount(&f.mount).unwrap();
        let err = f
            .driver
            .create_subvolume(&f.mount.join("main"))
            .unwrap_err();
        assert!(matches!(err, VolumeError::NotMounted { .. }));
    }

    #[test]
    fn delete_volume_removes_everything() {
        let f = mounted();
        f.driver.create_subvolume(&f.mount.join("main")).unwrap();
        let handle = VolumeHandle {
            device: f.device.clone(),
            mount_point: f.mount.clone(),
            size_bytes: 1 << 30,
        };
        f.driver.delete_volume(&handle).unwrap();
        assert!(!f.device.exists());
        assert!(fs::symlink_metadata(&f.mount).is_err());
    }

    #[test]
    fn delete_subvolume_tolerates_missing() {
        let f = mounted();
        f.driver.delete_subvolume(&f.mount.join("ghost")).unwrap();
    }
}
