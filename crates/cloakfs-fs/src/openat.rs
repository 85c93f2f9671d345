//! Thin safe wrappers around the `*at` family of syscalls.
//!
//! All path-relative operations in the storage layer go through a
//! directory file descriptor instead of an absolute path, so a rename of
//! an ancestor directory between lookup and use cannot redirect us
//! outside the backing tree. `O_NOFOLLOW` and `O_CLOEXEC` are always
//! added.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use cloakfs_core::types::FileIdent;

fn cstr(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

/// `openat(2)` relative to `dirfd`. `name` must be a single path
/// component.
pub fn openat(dirfd: BorrowedFd<'_>, name: &str, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    debug_assert!(!name.contains('/'), "openat takes one component");
    let cname = cstr(name)?;
    let fd = unsafe {
        libc::openat(
            dirfd.as_raw_fd(),
            cname.as_ptr(),
            flags | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `unlinkat(2)` relative to `dirfd`.
pub fn unlinkat(dirfd: BorrowedFd<'_>, name: &str, flags: i32) -> io::Result<()> {
    let cname = cstr(name)?;
    let rc = unsafe { libc::unlinkat(dirfd.as_raw_fd(), cname.as_ptr(), flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `fstat(2)` on an open descriptor.
pub fn fstat(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { st.assume_init() })
}

/// Device/inode identity of an open descriptor.
pub fn fstat_ident(fd: BorrowedFd<'_>) -> io::Result<FileIdent> {
    let st = fstat(fd)?;
    Ok(FileIdent {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn openat_resolves_relative_to_dirfd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("probe"), b"x").unwrap();
        let dirfile = std::fs::File::open(dir.path()).unwrap();

        let fd = openat(dirfile.as_fd(), "probe", libc::O_RDONLY, 0).unwrap();
        assert!(fstat(fd.as_fd()).unwrap().st_size == 1);

        assert!(openat(dirfile.as_fd(), "missing", libc::O_RDONLY, 0).is_err());
    }

    #[test]
    fn openat_refuses_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();
        let dirfile = std::fs::File::open(dir.path()).unwrap();

        assert!(openat(dirfile.as_fd(), "link", libc::O_RDONLY, 0).is_err());
    }

    #[test]
    fn unlinkat_removes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doomed"), b"x").unwrap();
        let dirfile = std::fs::File::open(dir.path()).unwrap();

        unlinkat(dirfile.as_fd(), "doomed", 0).unwrap();
        assert!(!dir.path().join("doomed").exists());
    }

    #[test]
    fn ident_is_stable_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let a = std::fs::File::open(&path).unwrap();
        let b = std::fs::File::open(&path).unwrap();
        assert_eq!(
            fstat_ident(a.as_fd()).unwrap(),
            fstat_ident(b.as_fd()).unwrap()
        );
    }
}
