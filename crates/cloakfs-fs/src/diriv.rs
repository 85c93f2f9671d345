//! Per-directory IV files.
//!
//! Every directory in the backing tree carries a `cloakfs.diriv` file
//! with 16 random bytes, created together with the directory. The IV
//! tweaks the name encryption of all entries in that directory, so a
//! whole-directory rename moves the IV file along and no entry needs to
//! be re-encrypted.

use std::io::{Read, Write};
use std::os::fd::BorrowedFd;

use tracing::warn;

use cloakfs_core::error::{CloakError, CloakResult};
use cloakfs_crypto::{random_bytes, DIR_IV_LEN};

use crate::openat::{openat, unlinkat};

/// Name of the IV file inside every directory.
pub const DIRIV_NAME: &str = "cloakfs.diriv";

/// Read and validate the IV file of the directory open at `dirfd`.
pub fn read_dir_iv_at(dirfd: BorrowedFd<'_>) -> CloakResult<[u8; DIR_IV_LEN]> {
    let fd = openat(dirfd, DIRIV_NAME, libc::O_RDONLY, 0)?;
    let mut file = std::fs::File::from(fd);
    // Read one byte past the expected length so an oversized file is
    // detected instead of silently truncated.
    let mut buf = [0u8; DIR_IV_LEN + 1];
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
    if n != DIR_IV_LEN {
        return Err(CloakError::DirIvInvalid(format!(
            "wrong length: want={DIR_IV_LEN} have={n}"
        )));
    }
    let mut iv = [0u8; DIR_IV_LEN];
    iv.copy_from_slice(&buf[..DIR_IV_LEN]);
    if iv == [0u8; DIR_IV_LEN] {
        return Err(CloakError::DirIvInvalid("IV is all-zero".into()));
    }
    Ok(iv)
}

/// Create a fresh IV file in the directory open at `dirfd`.
///
/// The file is created exclusively and read-only, so a concurrent
/// creator loses cleanly with `EEXIST` and nothing ever rewrites an
/// existing IV. A partially written file is unlinked again.
pub fn create_dir_iv_at(dirfd: BorrowedFd<'_>) -> CloakResult<[u8; DIR_IV_LEN]> {
    let mut iv = [0u8; DIR_IV_LEN];
    iv.copy_from_slice(&random_bytes(DIR_IV_LEN));

    let fd = openat(
        dirfd,
        DIRIV_NAME,
        libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
        0o400,
    )?;
    let mut file = std::fs::File::from(fd);
    if let Err(e) = file.write_all(&iv).and_then(|_| file.sync_data()) {
        warn!(error = %e, "IV write failed, removing partial file");
        if let Err(e2) = unlinkat(dirfd, DIRIV_NAME, 0) {
            warn!(error = %e2, "could not remove partial IV file");
        }
        return Err(e.into());
    }
    Ok(iv)
}
