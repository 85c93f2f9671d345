//! The cryptographic core: one AEAD backend plus the nonce generator.
//!
//! The backend is picked once at mount time from the volume config and
//! stored as a closed enum; call sites never dispatch on algorithm again.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{aes::Aes256, AesGcm};
use aes_siv::Aes256SivAead;
use chacha20poly1305::XChaCha20Poly1305;
use zeroize::Zeroize;

use cloakfs_core::config::AeadAlgorithm;
use cloakfs_core::error::{CloakError, CloakResult};

use crate::kdf::{self, MasterKey};
use crate::nonce::NonceGenerator;
use crate::TAG_SIZE;

/// AES-256-GCM with 128-bit nonces. The default 96-bit nonce width is too
/// narrow to rely on randomness for uniqueness.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

enum Backend {
    Gcm(Box<Aes256Gcm16>),
    Siv(Box<Aes256SivAead>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// Content-encryption primitives: Seal/Open over the selected backend and
/// a pooled nonce source.
pub struct CryptoCore {
    backend: Backend,
    algorithm: AeadAlgorithm,
    pub nonce_gen: NonceGenerator,
}

impl CryptoCore {
    /// Construct the backend from the master key. Derived subkeys are
    /// zeroized as soon as the cipher object owns a copy.
    pub fn new(master: &MasterKey, algorithm: AeadAlgorithm, use_hkdf: bool) -> Self {
        let backend = match algorithm {
            AeadAlgorithm::Aes256Gcm => {
                let mut key = kdf::content_key_gcm(master, use_hkdf);
                let cipher = Aes256Gcm16::new((&key).into());
                key.zeroize();
                Backend::Gcm(Box::new(cipher))
            }
            AeadAlgorithm::Aes256Siv => {
                let mut key = kdf::content_key_siv(master, use_hkdf);
                let cipher = Aes256SivAead::new((&key).into());
                key.zeroize();
                Backend::Siv(Box::new(cipher))
            }
            AeadAlgorithm::XChaCha20Poly1305 => {
                let mut key = kdf::content_key_xchacha(master, use_hkdf);
                let cipher = XChaCha20Poly1305::new((&key).into());
                key.zeroize();
                Backend::XChaCha(Box::new(cipher))
            }
        };
        Self {
            backend,
            algorithm,
            nonce_gen: NonceGenerator::new(algorithm.nonce_len()),
        }
    }

    /// Construct from a validated mount configuration.
    pub fn from_config(master: &MasterKey, cfg: &cloakfs_core::MountConfig) -> Self {
        Self::new(master, cfg.algorithm, cfg.hkdf)
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    pub fn nonce_len(&self) -> usize {
        self.algorithm.nonce_len()
    }

    /// Ciphertext expansion per sealed message (the authentication tag).
    pub fn overhead(&self) -> usize {
        TAG_SIZE
    }

    /// Encrypt and authenticate `plaintext`, authenticating (but not
    /// encrypting) `aad`, and append the result to `dst`. Deterministic
    /// given identical inputs; the nonce is NOT included in the output.
    pub fn seal(
        &self,
        dst: &mut Vec<u8>,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CloakResult<()> {
        assert_eq!(nonce.len(), self.nonce_len(), "wrong nonce length");
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = match &self.backend {
            Backend::Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            Backend::Siv(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            Backend::XChaCha(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
        }
        .map_err(|_| {
            // The RustCrypto AEADs only fail on length overflow here.
            CloakError::Other(anyhow::anyhow!("seal failed: plaintext too large"))
        })?;
        dst.extend_from_slice(&ciphertext);
        Ok(())
    }

    /// Verify and decrypt `ciphertext`, appending the plaintext to `dst`.
    /// Fails closed: any bit flip in ciphertext, tag, nonce or aad yields
    /// `AuthenticationFailed` and `dst` is left untouched.
    pub fn open(
        &self,
        dst: &mut Vec<u8>,
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> CloakResult<()> {
        assert_eq!(nonce.len(), self.nonce_len(), "wrong nonce length");
        if ciphertext.len() < TAG_SIZE {
            return Err(CloakError::BlockTooShort {
                len: ciphertext.len(),
            });
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let plaintext = match &self.backend {
            Backend::Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            Backend::Siv(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            Backend::XChaCha(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
        }
        .map_err(|_| CloakError::AuthenticationFailed)?;
        dst.extend_from_slice(&plaintext);
        Ok(())
    }
}
