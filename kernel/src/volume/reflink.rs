//! Extent-sharing tree copy.

use std::fs;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::VolumeError;

/// How a tree copy was carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Files cloned by reflink.
    pub reflinked: u64,
    /// Files copied byte by byte.
    pub copied: u64,
}

/// Recursively copies `src` into `dst`, cloning file extents where possible.
///
/// Directory permissions and symlinks are preserved, since database data
/// directories refuse to start with loosened modes. When `require_reflink` is
/// set a file that cannot be cloned aborts the copy instead of falling back
/// to a plain copy.
///
/// # Errors
///
/// Returns an error if a directory, link or file cannot be created.
pub fn copy_tree(src: &Path, dst: &Path, require_reflink: bool) -> Result<CopyStats, VolumeError> {
    let mut stats = CopyStats::default();

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| VolumeError::Io {
            op: "walk",
            path: e.path().unwrap_or(src).to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();

        let Ok(relative) = path.strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(VolumeError::io("create dir", &target))?;
            let perms = fs::metadata(path)
                .map_err(VolumeError::io("stat", path))?
                .permissions();
            fs::set_permissions(&target, perms).map_err(VolumeError::io("chmod", &target))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(path).map_err(VolumeError::io("read link", path))?;
            symlink(&link, &target).map_err(VolumeError::io("symlink", &target))?;
        } else {
            match reflink::reflink(path, &target) {
                Ok(()) => {
                    stats.reflinked += 1;
                }
                Err(e) if require_reflink => {
                    return Err(VolumeError::ReflinkUnsupported {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
                Err(e) => {
                    debug!(
                        "Reflink failed ({}), falling back to copy: {:?} -> {:?}",
                        e, path, target
                    );
                    fs::copy(path, &target).map_err(VolumeError::io("copy", path))?;
                    stats.copied += 1;
                }
            }
            let perms = entry
                .metadata()
                .map_err(|e| VolumeError::Io {
                    op: "stat",
                    path: path.to_path_buf(),
                    source: e.into(),
                })?
                .permissions();
            fs::set_permissions(&target, perms).map_err(VolumeError::io("chmod", &target))?;
        }
    }

    info!(
        reflinked = stats.reflinked,
        copied = stats.copied,
        "Tree copy complete: {:?} -> {:?}",
        src,
        dst
    );
    Ok(stats)
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        fs::create_dir_all(src.path().join("base/1")).unwrap();
        fs::write(src.path().join("base/1/16384"), b"heap").unwrap();
        fs::write(src.path().join("PG_VERSION"), b"17\n").unwrap();

        let stats = copy_tree(src.path(), &target, false).unwrap();

        assert_eq!(stats.reflinked + stats.copied, 2);
        assert_eq!(fs::read(target.join("base/1/16384")).unwrap(), b"heap");
        assert_eq!(fs::read(target.join("PG_VERSION")).unwrap(), b"17\n");
    }

    #[cfg(unix)]
    #[test]
    fn keeps_directory_modes_and_links() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data = src.path().join("data");
        fs::create_dir(&data).unwrap();
        fs::set_permissions(&data, fs::Permissions::from_mode(0o700)).unwrap();
        fs::write(data.join("f"), b"x").unwrap();
        std::os::unix::fs::symlink("f", data.join("link")).unwrap();

        let target = dst.path().join("copy");
        copy_tree(src.path(), &target, false).unwrap();

        let mode = fs::metadata(target.join("data")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert_eq!(
            fs::read_link(target.join("data/link")).unwrap(),
            Path::new("f")
        );
    }
}
