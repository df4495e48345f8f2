//! Link strategies used to materialize cache entries, plus the read-only
//! protection helpers.

use std::io;
use std::path::Path;

use datum_core::LinkType;

/// Create `dst` from `src` with one strategy. `dst` must not exist.
pub fn link(kind: LinkType, src: &Path, dst: &Path) -> io::Result<()> {
    match kind {
        LinkType::Reflink => reflink(src, dst),
        LinkType::Hardlink => std::fs::hard_link(src, dst),
        LinkType::Symlink => symlink(src, dst),
        LinkType::Copy => copy(src, dst),
    }
}

/// Try each strategy in order; returns the one that worked, or every
/// failure in attempt order.
pub fn link_first(
    strategies: &[LinkType],
    src: &Path,
    dst: &Path,
) -> Result<LinkType, Vec<(LinkType, io::Error)>> {
    let mut failures = Vec::new();
    for &kind in strategies {
        match link(kind, src, dst) {
            Ok(()) => return Ok(kind),
            Err(err) => {
                tracing::debug!("{kind} {} -> {} failed: {err}", src.display(), dst.display());
                failures.push((kind, err));
            }
        }
    }
    Err(failures)
}

fn copy(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.symlink_metadata().is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "destination exists",
        ));
    }
    std::fs::copy(src, dst).map(|_| ())
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

#[cfg(target_os = "linux")]
fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;

    // _IOW(0x94, 9, int)
    const FICLONE: u32 = 0x4004_9409;

    let source = File::open(src)?;
    let target = OpenOptions::new().write(true).create_new(true).open(dst)?;
    // SAFETY: both descriptors are open for the duration of the call.
    let ret = unsafe { libc::ioctl(target.as_raw_fd(), FICLONE as _, source.as_raw_fd()) };
    if ret == -1 {
        let err = io::Error::last_os_error();
        drop(target);
        let _ = std::fs::remove_file(dst);
        return Err(err);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let to_c = |p: &Path| {
        CString::new(p.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    };
    let (src_c, dst_c) = (to_c(src)?, to_c(dst)?);
    // SAFETY: both pointers are valid NUL-terminated strings.
    let ret = unsafe { libc::clonefile(src_c.as_ptr(), dst_c.as_ptr(), 0) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn reflink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "reflink is not supported on this platform",
    ))
}

// ---------------------------------------------------------------------------
// Protection
// ---------------------------------------------------------------------------

/// Clear every write bit.
pub fn set_read_only(path: &Path) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.readonly() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() & !0o222);
    }
    #[cfg(not(unix))]
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

/// Give the owner write access back.
pub fn set_writable(path: &Path) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if perms.mode() & 0o200 != 0 {
            return Ok(());
        }
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            return Ok(());
        }
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }
    std::fs::set_permissions(path, perms)
}

pub fn is_read_only(path: &Path) -> io::Result<bool> {
    let perms = std::fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(perms.mode() & 0o222 == 0)
    }
    #[cfg(not(unix))]
    Ok(perms.readonly())
}

/// Whether the workspace file shares storage with another path: a symlink
/// or a file with more than one hard link.
pub fn shares_storage(path: &Path) -> io::Result<bool> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok(meta.nlink() > 1)
    }
    #[cfg(not(unix))]
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copy_produces_independent_bytes() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::write(&src, b"payload").unwrap();
        link(LinkType::Copy, &src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
        assert!(!shares_storage(&dst).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn hardlink_and_symlink_share_storage() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::write(&src, b"payload").unwrap();
        link(LinkType::Hardlink, &src, &tmp.path().join("hard")).unwrap();
        link(LinkType::Symlink, &src, &tmp.path().join("soft")).unwrap();
        assert!(shares_storage(&tmp.path().join("hard")).unwrap());
        assert!(shares_storage(&tmp.path().join("soft")).unwrap());
    }

    #[test]
    fn link_first_falls_through_and_reports_every_failure() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"occupied").unwrap();

        let failures = link_first(&[LinkType::Hardlink, LinkType::Copy], &src, &dst).unwrap_err();
        let kinds: Vec<_> = failures.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, [LinkType::Hardlink, LinkType::Copy]);

        std::fs::remove_file(&dst).unwrap();
        let used = link_first(&[LinkType::Reflink, LinkType::Copy], &src, &dst).unwrap();
        assert!(matches!(used, LinkType::Reflink | LinkType::Copy));
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn protection_toggles() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        set_read_only(&file).unwrap();
        assert!(is_read_only(&file).unwrap());
        set_writable(&file).unwrap();
        assert!(!is_read_only(&file).unwrap());
    }
}
