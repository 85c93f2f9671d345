//! PKCS#7 padding over 16-byte blocks (RFC 5652, section 6.3).
//!
//! A name that is already block-aligned still gets a full block of
//! padding, so the pad length is always in `[1, 16]` and unpadding is
//! unambiguous.

use tracing::debug;

use cloakfs_core::error::{CloakError, CloakResult};

const BLOCK: usize = 16;

/// Pad to a multiple of 16 bytes. The pad byte equals the pad length.
pub fn pad16(orig: &[u8]) -> Vec<u8> {
    assert!(!orig.is_empty(), "padding an empty name makes no sense");
    // Always in [1, 16]: aligned input gets a full extra block.
    let pad_len = BLOCK - orig.len() % BLOCK;
    let mut padded = Vec::with_capacity(orig.len() + pad_len);
    padded.extend_from_slice(orig);
    padded.resize(orig.len() + pad_len, pad_len as u8);
    padded
}

/// Remove and verify padding. All failure modes collapse into the same
/// `PaddingInvalid` so the error cannot act as a padding oracle; the
/// detail is only logged.
pub fn unpad16(padded: &[u8]) -> CloakResult<Vec<u8>> {
    let len = padded.len();
    if len == 0 || len % BLOCK != 0 {
        debug!(len, "unpad16: unaligned input");
        return Err(CloakError::PaddingInvalid);
    }
    let pad_len = padded[len - 1] as usize;
    if pad_len == 0 || pad_len > BLOCK {
        debug!(pad_len, "unpad16: pad length out of range");
        return Err(CloakError::PaddingInvalid);
    }
    if pad_len >= len {
        debug!(pad_len, len, "unpad16: padding swallows the whole name");
        return Err(CloakError::PaddingInvalid);
    }
    if padded[len - pad_len..].iter().any(|&b| b as usize != pad_len) {
        debug!("unpad16: non-uniform padding bytes");
        return Err(CloakError::PaddingInvalid);
    }
    Ok(padded[..len - pad_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn aligned_input_gets_full_extra_block() {
        let padded = pad16(&[7u8; 16]);
        assert_eq!(padded.len(), 32);
        assert!(padded[16..].iter().all(|&b| b == 16));
    }

    #[test]
    fn unpad_rejects_bad_padding() {
        // Unaligned.
        assert!(unpad16(&[1u8; 15]).is_err());
        // Pad length zero.
        let mut buf = vec![1u8; 16];
        buf[15] = 0;
        assert!(unpad16(&buf).is_err());
        // Pad length beyond block size.
        buf[15] = 17;
        assert!(unpad16(&buf).is_err());
        // Padding as long as the input.
        assert!(unpad16(&[16u8; 16]).is_err());
        // Non-uniform padding bytes.
        let mut buf = pad16(b"abc");
        buf[8] ^= 1;
        assert!(unpad16(&buf).is_err());
    }

    proptest! {
        #[test]
        fn pad_unpad_roundtrip(data in proptest::collection::vec(any::<u8>(), 1..=64)) {
            let padded = pad16(&data);
            prop_assert_eq!(padded.len() % 16, 0);
            prop_assert!(padded.len() > data.len());
            prop_assert!(padded.len() <= data.len() + 16);
            prop_assert_eq!(unpad16(&padded).unwrap(), data);
        }
    }
}
