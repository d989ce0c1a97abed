use serde::Serialize;
use std::fs::File;
use std::path::Path;
use walkdir::WalkDir;

use super::VolumeError;

/// Space used by a subvolume.
///
/// `bytes` counts reflinked files at full size. `shared_bytes` is the part of
/// that backed by extents shared with other files, so `unique_bytes` is what
/// the subvolume costs on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubvolumeUsage {
    /// Sum of regular file lengths.
    pub bytes: u64,
    /// Bytes in extents shared with other files.
    pub shared_bytes: u64,
    /// Bytes only this subvolume holds.
    pub unique_bytes: u64,
    /// Number of regular files.
    pub files: u64,
}

pub(super) fn measure(path: &Path) -> Result<SubvolumeUsage, VolumeError> {
    if !path.is_dir() {
        return Err(VolumeError::SourceNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut usage = SubvolumeUsage::default();
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| VolumeError::Io {
            op: "walk",
            path: e.path().unwrap_or(path).to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| VolumeError::Io {
                    op: "stat",
                    path: entry.path().to_path_buf(),
                    source: e.into(),
                })?;
            let len = meta.len();
            usage.bytes += len;
            usage.shared_bytes += shared_bytes(entry.path(), len);
            usage.files += 1;
        }
    }
    usage.unique_bytes = usage.bytes.saturating_sub(usage.shared_bytes);
    Ok(usage)
}

/// Shared part of one file, capped at its length. Zero when the extent map
/// is unavailable.
fn shared_bytes(path: &Path, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    let shared = File::open(path).and_then(|file| fiemap::shared_extent_bytes(&file, len));
    match shared {
        Ok(bytes) => bytes.min(len),
        Err(e) => {
            tracing::trace!(?path, "No extent map: {}", e);
            0
        }
    }
}

#[cfg(target_os = "linux")]
mod fiemap {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    // _IOWR('f', 11, struct fiemap)
    #[allow(clippy::cast_possible_wrap)]
    const FS_IOC_FIEMAP: libc::Ioctl = 0xC020_660B_u32 as libc::Ioctl;
    const EXTENT_LAST: u32 = 0x0000_0001;
    const EXTENT_SHARED: u32 = 0x0000_2000;
    const BATCH: usize = 32;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    struct Extent {
        logical: u64,
        physical: u64,
        length: u64,
        reserved64: [u64; 2],
        flags: u32,
        reserved32: [u32; 3],
    }

    #[repr(C)]
    #[derive(Debug, Default)]
    struct Request {
        start: u64,
        length: u64,
        flags: u32,
        mapped_extents: u32,
        extent_count: u32,
        reserved: u32,
        extents: [Extent; BATCH],
    }

    /// Sums the lengths of extents flagged shared, in batches of [`BATCH`].
    pub(super) fn shared_extent_bytes(file: &File, len: u64) -> io::Result<u64> {
        let mut shared = 0;
        let mut offset = 0;
        loop {
            let mut request = Box::new(Request {
                start: offset,
                length: len.saturating_sub(offset),
                extent_count: BATCH as u32,
                ..Request::default()
            });
            // SAFETY: `request` is a live, correctly laid out `struct fiemap`
            // with room for `extent_count` extents.
            let ret = unsafe {
                libc::ioctl(file.as_raw_fd(), FS_IOC_FIEMAP, &mut *request as *mut Request)
            };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }

            let mapped = (request.mapped_extents as usize).min(BATCH);
            if mapped == 0 {
                return Ok(shared);
            }
            for extent in &request.extents[..mapped] {
                if extent.flags & EXTENT_SHARED != 0 {
                    shared += extent.length;
                }
                if extent.flags & EXTENT_LAST != 0 {
                    return Ok(shared);
                }
                offset = extent.logical + extent.length;
            }
            if mapped < BATCH || offset >= len {
                return Ok(shared);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod fiemap {
    use std::fs::File;
    use std::io;

    pub(super) fn shared_extent_bytes(_file: &File, _len: u64) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extent maps need Linux",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), b"12345").unwrap();
        fs::write(dir.path().join("a/b/two"), b"123").unwrap();

        let usage = measure(dir.path()).unwrap();
        assert_eq!(usage.bytes, 8);
        assert_eq!(usage.files, 2);
        assert_eq!(usage.shared_bytes + usage.unique_bytes, usage.bytes);
    }

    #[test]
    fn freshly_written_data_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7_u8; 256 * 1024];
        fs::write(dir.path().join("table"), &data).unwrap();
        File::open(dir.path().join("table")).unwrap().sync_all().unwrap();

        let usage = measure(dir.path()).unwrap();
        assert_eq!(usage.bytes, data.len() as u64);
        assert_eq!(usage.shared_bytes, 0);
        assert_eq!(usage.unique_bytes, usage.bytes);
    }

    #[test]
    fn reflinked_copy_counts_as_shared_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("table"), vec![1_u8; 128 * 1024]).unwrap();
        File::open(source.join("table")).unwrap().sync_all().unwrap();

        let clone = dir.path().join("clone");
        fs::create_dir(&clone).unwrap();
        if reflink::reflink(source.join("table"), clone.join("table")).is_err() {
            // No extent sharing on this filesystem.
            return;
        }

        let usage = measure(&clone).unwrap();
        assert_eq!(usage.bytes, 128 * 1024);
        assert_eq!(usage.shared_bytes + usage.unique_bytes, usage.bytes);
    }

    #[test]
    fn missing_path_is_source_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = measure(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, VolumeError::SourceNotFound { .. }));
    }
}
