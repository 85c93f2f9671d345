//! Per-file header: `[ version: u16 BE ][ id: 16 random bytes ]`.
//!
//! Written once on the first write to a file and immutable afterwards.
//! The id goes into the AAD of every content block, so blocks cannot be
//! transplanted between files.

use cloakfs_core::error::{CloakError, CloakResult};

use crate::nonce::random_bytes;
use crate::{FILE_ID_LEN, HEADER_LEN};

/// Current on-disk format version.
pub const CURRENT_VERSION: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    /// Create a header with a fresh random id.
    pub fn random() -> Self {
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&random_bytes(FILE_ID_LEN));
        Self {
            version: CURRENT_VERSION,
            id,
        }
    }

    /// Serialize to the on-disk form.
    pub fn pack(&self) -> [u8; HEADER_LEN] {
        assert_eq!(self.version, CURRENT_VERSION, "header not initialized");
        assert_ne!(self.id, [0u8; FILE_ID_LEN], "header not initialized");
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..].copy_from_slice(&self.id);
        buf
    }

    /// Parse and validate the on-disk form. An all-zero buffer means the
    /// header write was preallocated but never completed.
    pub fn parse(buf: &[u8]) -> CloakResult<Self> {
        if buf.len() != HEADER_LEN {
            return Err(CloakError::HeaderInvalid(format!(
                "wrong length: want={} have={}",
                HEADER_LEN,
                buf.len()
            )));
        }
        if buf.iter().all(|&b| b == 0) {
            return Err(CloakError::HeaderInvalid("header is all-zero".into()));
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != CURRENT_VERSION {
            return Err(CloakError::HeaderInvalid(format!(
                "unsupported version: want={} have={}",
                CURRENT_VERSION, version
            )));
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&buf[2..]);
        if id == [0u8; FILE_ID_LEN] {
            return Err(CloakError::HeaderInvalid("file id is all-zero".into()));
        }
        Ok(Self { version, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_parse_roundtrip() {
        let h = FileHeader::random();
        let parsed = FileHeader::parse(&h.pack()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn random_headers_have_distinct_ids() {
        assert_ne!(FileHeader::random().id, FileHeader::random().id);
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(FileHeader::parse(&[0u8; 17]).is_err());
        assert!(FileHeader::parse(&[0u8; 19]).is_err());
        assert!(FileHeader::parse(&[]).is_err());
    }

    #[test]
    fn all_zero_header_rejected() {
        assert!(matches!(
            FileHeader::parse(&[0u8; HEADER_LEN]),
            Err(CloakError::HeaderInvalid(_))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut buf = FileHeader::random().pack();
        buf[0] = 0;
        buf[1] = 3;
        assert!(matches!(
            FileHeader::parse(&buf),
            Err(CloakError::HeaderInvalid(_))
        ));
    }

    #[test]
    fn all_zero_id_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&CURRENT_VERSION.to_be_bytes());
        assert!(FileHeader::parse(&buf).is_err());
    }
}
