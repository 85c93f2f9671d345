//! Master key handling and HKDF-SHA256 subkey derivation.
//!
//! The master key itself comes from the mount frontend (password-unwrapped
//! from the volume config). All per-purpose keys are derived from it with
//! domain-separation info strings, except on legacy volumes (hkdf=false)
//! where the master key is used directly.

use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

use crate::KEY_SIZE;

const INFO_CONTENT_GCM: &[u8] = b"cloakfs-content-gcm";
const INFO_CONTENT_SIV: &[u8] = b"cloakfs-content-siv";
const INFO_CONTENT_XCHACHA: &[u8] = b"cloakfs-content-xchacha";
const INFO_NAMES_SIV: &[u8] = b"cloakfs-names-siv";

/// The 256-bit volume master key. Held for the lifetime of the mount,
/// zeroized on drop and on explicit [`MasterKey::wipe`].
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Overwrite the key material and consume the key.
    pub fn wipe(mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// HKDF-SHA256 expand with a domain-specific info string.
fn hkdf_derive<const N: usize>(ikm: &[u8; KEY_SIZE], info: &[u8]) -> [u8; N] {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; N];
    // Only fails if N > 255 * hash_len, which our sizes never reach.
    hkdf.expand(info, &mut okm)
        .expect("HKDF output length out of range");
    okm
}

/// Content key for the GCM backend.
pub fn content_key_gcm(master: &MasterKey, use_hkdf: bool) -> [u8; KEY_SIZE] {
    if use_hkdf {
        hkdf_derive(master.as_bytes(), INFO_CONTENT_GCM)
    } else {
        *master.as_bytes()
    }
}

/// Content key for the XChaCha20-Poly1305 backend.
pub fn content_key_xchacha(master: &MasterKey, use_hkdf: bool) -> [u8; KEY_SIZE] {
    if use_hkdf {
        hkdf_derive(master.as_bytes(), INFO_CONTENT_XCHACHA)
    } else {
        *master.as_bytes()
    }
}

/// Content key for the AES-SIV backend. SIV splits its key into an
/// authentication half and an encryption half, so it needs 64 bytes.
/// Legacy volumes derive it as SHA-512 of the master key.
pub fn content_key_siv(master: &MasterKey, use_hkdf: bool) -> [u8; 64] {
    if use_hkdf {
        hkdf_derive(master.as_bytes(), INFO_CONTENT_SIV)
    } else {
        let digest = Sha512::digest(master.as_bytes());
        let mut key = [0u8; 64];
        key.copy_from_slice(&digest);
        key
    }
}

/// Name-encryption key (64 bytes, AES-256-SIV).
pub fn name_key(master: &MasterKey, use_hkdf: bool) -> [u8; 64] {
    if use_hkdf {
        hkdf_derive(master.as_bytes(), INFO_NAMES_SIV)
    } else {
        let digest = Sha512::digest(master.as_bytes());
        let mut key = [0u8; 64];
        key.copy_from_slice(&digest);
        key
    }
}
