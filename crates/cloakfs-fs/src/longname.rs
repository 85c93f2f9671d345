//! Companion files for hashed long names.
//!
//! An encrypted name longer than the filesystem limit is stored on disk
//! as `cloakfs.longname.<hash>`, and the real encrypted name moves into
//! the companion file `<hashed>.name` next to it. The companion is
//! created before the content entry and deleted after it, so a crash
//! leaves at worst an orphaned companion, never an unresolvable entry.
//! A missing or malformed companion makes exactly one directory entry
//! undecryptable; listings log and skip it.

use std::io::{Read, Write};
use std::os::fd::BorrowedFd;

use tracing::warn;

use cloakfs_core::error::{CloakError, CloakResult};
use cloakfs_crypto::names::{is_long_name, LongNameKind, LONGNAME_SUFFIX};

use crate::openat::{openat, unlinkat};

/// Upper bound for a companion's content. The longest legal encrypted
/// name (255 plaintext bytes, padded, tagged, base64) stays well below
/// this; anything bigger is not a companion file.
const LONGNAME_CONTENT_MAX: usize = 1024;

fn companion(hashed_name: &str) -> String {
    format!("{hashed_name}{LONGNAME_SUFFIX}")
}

/// Load the full encrypted name belonging to the hashed entry
/// `hashed_name` from its companion file.
pub fn read_long_name_at(dirfd: BorrowedFd<'_>, hashed_name: &str) -> CloakResult<String> {
    debug_assert_eq!(is_long_name(hashed_name), LongNameKind::Content);
    let fd = openat(dirfd, &companion(hashed_name), libc::O_RDONLY, 0)?;
    let mut file = std::fs::File::from(fd);
    // Over-read by one to catch oversized files.
    let mut buf = vec![0u8; LONGNAME_CONTENT_MAX + 1];
    let mut n = 0;
    loop {
        let r = file.read(&mut buf[n..])?;
        if r == 0 {
            break;
        }
        n += r;
        if n == buf.len() {
            break;
        }
    }
    if n == 0 || n > LONGNAME_CONTENT_MAX {
        return Err(CloakError::NameDecodeInvalid(format!(
            "companion file has impossible length {n}"
        )));
    }
    buf.truncate(n);
    String::from_utf8(buf)
        .map_err(|_| CloakError::NameDecodeInvalid("companion content is not UTF-8".into()))
}

/// Store `cipher_name` in the companion of `hashed_name`. Exclusive
/// create: the companion must not exist yet. A partially written file is
/// unlinked again.
pub fn write_long_name_at(
    dirfd: BorrowedFd<'_>,
    hashed_name: &str,
    cipher_name: &str,
) -> CloakResult<()> {
    debug_assert_eq!(is_long_name(hashed_name), LongNameKind::Content);
    let name = companion(hashed_name);
    let fd = openat(
        dirfd,
        &name,
        libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
        0o600,
    )?;
    let mut file = std::fs::File::from(fd);
    if let Err(e) = file.write_all(cipher_name.as_bytes()) {
        warn!(error = %e, "companion write failed, removing partial file");
        if let Err(e2) = unlinkat(dirfd, &name, 0) {
            warn!(error = %e2, "could not remove partial companion");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Remove the companion of `hashed_name` after its content entry is gone.
pub fn delete_long_name_at(dirfd: BorrowedFd<'_>, hashed_name: &str) -> CloakResult<()> {
    debug_assert_eq!(is_long_name(hashed_name), LongNameKind::Content);
    unlinkat(dirfd, &companion(hashed_name), 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloakfs_crypto::names::hash_long_name;
    use std::os::fd::AsFd;

    fn open_dir(path: &std::path::Path) -> std::fs::File {
        std::fs::File::open(path).unwrap()
    }

    #[test]
    fn companion_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dirfile = open_dir(dir.path());

        let cipher_name = "x".repeat(300);
        let hashed = hash_long_name(&cipher_name);
        write_long_name_at(dirfile.as_fd(), &hashed, &cipher_name).unwrap();
        assert!(dir.path().join(format!("{hashed}.name")).exists());
        assert_eq!(
            read_long_name_at(dirfile.as_fd(), &hashed).unwrap(),
            cipher_name
        );
    }

    #[test]
    fn missing_companion_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let dirfile = open_dir(dir.path());
        let hashed = hash_long_name("whatever");
        assert!(matches!(
            read_long_name_at(dirfile.as_fd(), &hashed),
            Err(CloakError::Io(_))
        ));
    }

    #[test]
    fn empty_and_oversized_companions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dirfile = open_dir(dir.path());
        let hashed = hash_long_name("victim");
        let path = dir.path().join(format!("{hashed}.name"));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            read_long_name_at(dirfile.as_fd(), &hashed),
            Err(CloakError::NameDecodeInvalid(_))
        ));

        std::fs::write(&path, vec![b'a'; LONGNAME_CONTENT_MAX + 100]).unwrap();
        assert!(matches!(
            read_long_name_at(dirfile.as_fd(), &hashed),
            Err(CloakError::NameDecodeInvalid(_))
        ));
    }

    #[test]
    fn second_write_fails_without_clobbering() {
        let dir = tempfile::tempdir().unwrap();
        let dirfile = open_dir(dir.path());
        let hashed = hash_long_name("name");
        write_long_name_at(dirfile.as_fd(), &hashed, "first").unwrap();
        assert!(write_long_name_at(dirfile.as_fd(), &hashed, "second").is_err());
        assert_eq!(read_long_name_at(dirfile.as_fd(), &hashed).unwrap(), "first");
    }

    #[test]
    fn delete_removes_the_companion() {
        let dir = tempfile::tempdir().unwrap();
        let dirfile = open_dir(dir.path());
        let hashed = hash_long_name("doomed");
        write_long_name_at(dirfile.as_fd(), &hashed, "cipher").unwrap();
        delete_long_name_at(dirfile.as_fd(), &hashed).unwrap();
        assert!(read_long_name_at(dirfile.as_fd(), &hashed).is_err());
        assert!(delete_long_name_at(dirfile.as_fd(), &hashed).is_err());
    }
}
