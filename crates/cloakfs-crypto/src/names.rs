//! Filename and path encryption.
//!
//! Names are padded to 16-byte blocks, run through deterministic
//! AES-256-SIV keyed by the derived name key and tweaked by the owning
//! directory's IV, then base64-encoded with a filesystem-safe alphabet.
//! Determinism is required: lookups must be able to recompute the stored
//! name. The per-directory tweak makes equal names in different
//! directories encrypt differently; legacy volumes use a fixed all-zero
//! tweak instead.
//!
//! Names whose encrypted form exceeds the 255-byte filesystem limit are
//! stored as `cloakfs.longname.<sha256>` with the real encrypted name in
//! a `.name` companion file next to it.

use aes_siv::aead::{Aead, KeyInit};
use aes_siv::{Aes256SivAead, Nonce};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};

use cloakfs_core::error::{CloakError, CloakResult};

use crate::kdf::{self, MasterKey};
use crate::pad::{pad16, unpad16};
use crate::DIR_IV_LEN;

/// Maximum name length of the backing filesystem.
pub const NAME_MAX: usize = 255;

/// Directory entries carrying a hashed long name start with this.
pub const LONGNAME_PREFIX: &str = "cloakfs.longname.";
/// Companion file holding the full encrypted name.
pub const LONGNAME_SUFFIX: &str = ".name";

/// Supplies the IV of a directory identified by its plaintext relative
/// path (`""` is the root). Implemented by the storage layer on top of
/// its directory-handle cache; tests use a map.
pub trait DirIvSource {
    fn dir_iv(&self, plain_dir: &str) -> CloakResult<[u8; DIR_IV_LEN]>;
}

/// Classification of an on-disk ciphertext name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongNameKind {
    /// `cloakfs.longname.<hash>`: the actual directory entry.
    Content,
    /// `cloakfs.longname.<hash>.name`: the companion file.
    NameFile,
    /// An ordinary encrypted name.
    None,
}

pub struct NameTransform {
    siv: Box<Aes256SivAead>,
    long_names: bool,
    raw64: bool,
    /// Legacy volumes tweak every name with zeros instead of a DirIV.
    legacy_zero_tweak: bool,
}

impl NameTransform {
    pub fn new(master: &MasterKey, use_hkdf: bool, long_names: bool, raw64: bool) -> Self {
        let mut key = kdf::name_key(master, use_hkdf);
        let siv = Box::new(Aes256SivAead::new((&key).into()));
        use zeroize::Zeroize;
        key.zeroize();
        Self {
            siv,
            long_names,
            raw64,
            legacy_zero_tweak: false,
        }
    }

    /// Construct from a validated mount configuration.
    pub fn from_config(master: &MasterKey, cfg: &cloakfs_core::MountConfig) -> Self {
        let t = Self::new(master, cfg.hkdf, cfg.long_names, cfg.raw64);
        if cfg.legacy_zero_tweak {
            t.with_legacy_zero_tweak()
        } else {
            t
        }
    }

    /// Switch to the fixed all-zero tweak of legacy volumes.
    pub fn with_legacy_zero_tweak(mut self) -> Self {
        self.legacy_zero_tweak = true;
        self
    }

    fn b64_encode(&self, data: &[u8]) -> String {
        if self.raw64 {
            URL_SAFE_NO_PAD.encode(data)
        } else {
            URL_SAFE.encode(data)
        }
    }

    fn b64_decode(&self, name: &str) -> CloakResult<Vec<u8>> {
        let result = if self.raw64 {
            URL_SAFE_NO_PAD.decode(name)
        } else {
            URL_SAFE.decode(name)
        };
        result.map_err(|e| CloakError::NameDecodeInvalid(e.to_string()))
    }

    fn tweak<'a>(&self, iv: &'a [u8; DIR_IV_LEN]) -> &'a [u8; DIR_IV_LEN] {
        const ZERO: [u8; DIR_IV_LEN] = [0u8; DIR_IV_LEN];
        if self.legacy_zero_tweak {
            &ZERO
        } else {
            iv
        }
    }

    /// Encrypt one name under the directory IV. `.` and `..` pass
    /// through so relative symlink targets keep working.
    pub fn encrypt_name(&self, plain: &str, iv: &[u8; DIR_IV_LEN]) -> CloakResult<String> {
        if plain == "." || plain == ".." {
            return Ok(plain.to_string());
        }
        if plain.is_empty() || plain.contains('/') || plain.contains('\0') {
            return Err(CloakError::NameDecodeInvalid(
                "name is empty or contains '/' or NUL".into(),
            ));
        }
        let padded = pad16(plain.as_bytes());
        let ciphertext = self
            .siv
            .encrypt(Nonce::from_slice(self.tweak(iv)), padded.as_ref())
            .map_err(|_| CloakError::Other(anyhow::anyhow!("name encryption failed")))?;
        Ok(self.b64_encode(&ciphertext))
    }

    /// Decrypt one name. Failure modes are ordinary, attacker-observable
    /// corruption signals: bad base64 or length, failed authentication,
    /// bad padding.
    pub fn decrypt_name(&self, cipher_name: &str, iv: &[u8; DIR_IV_LEN]) -> CloakResult<String> {
        if cipher_name == "." || cipher_name == ".." {
            return Ok(cipher_name.to_string());
        }
        let bin = self.b64_decode(cipher_name)?;
        // SIV tag (16) + at least one padded block (16).
        if bin.len() < 32 || bin.len() % 16 != 0 {
            return Err(CloakError::NameDecodeInvalid(format!(
                "decoded length {} is not a multiple of 16",
                bin.len()
            )));
        }
        let padded = self
            .siv
            .decrypt(Nonce::from_slice(self.tweak(iv)), bin.as_ref())
            .map_err(|_| CloakError::AuthenticationFailed)?;
        let plain = unpad16(&padded)?;
        // Never hand a slash or NUL back to the kernel, even from a
        // corrupted or fuzzed ciphertext directory.
        if plain.contains(&0) || plain.contains(&b'/') {
            return Err(CloakError::NameDecodeInvalid(
                "decrypted name contains '/' or NUL".into(),
            ));
        }
        String::from_utf8(plain)
            .map_err(|_| CloakError::NameDecodeInvalid("decrypted name is not UTF-8".into()))
    }

    /// Encrypt a name and substitute the hashed form if the result is too
    /// long for the backing filesystem.
    pub fn encrypt_and_hash_name(
        &self,
        plain: &str,
        iv: &[u8; DIR_IV_LEN],
    ) -> CloakResult<String> {
        let cipher_name = self.encrypt_name(plain, iv)?;
        if self.long_names && cipher_name.len() > NAME_MAX {
            return Ok(hash_long_name(&cipher_name));
        }
        Ok(cipher_name)
    }

    /// Encrypt a relative plaintext path component-wise. Each component
    /// is transformed under its parent directory's IV; a corrupt
    /// component therefore only ever breaks one name, not the whole path.
    /// Empty components (leading, trailing, doubled slashes) pass through.
    pub fn encrypt_path(&self, plain_path: &str, ivs: &dyn DirIvSource) -> CloakResult<String> {
        if plain_path.is_empty() {
            return Ok(String::new());
        }
        let mut parent = String::new();
        let mut out = Vec::new();
        for comp in plain_path.split('/') {
            if comp.is_empty() {
                out.push(String::new());
                continue;
            }
            let iv = ivs.dir_iv(&parent)?;
            out.push(self.encrypt_and_hash_name(comp, &iv)?);
            if parent.is_empty() {
                parent.push_str(comp);
            } else {
                parent.push('/');
                parent.push_str(comp);
            }
        }
        Ok(out.join("/"))
    }

    /// Inverse of [`encrypt_path`](Self::encrypt_path). Hashed long-name
    /// components cannot be reversed without their companion files, so
    /// they are rejected here; the storage layer resolves them first.
    pub fn decrypt_path(&self, cipher_path: &str, ivs: &dyn DirIvSource) -> CloakResult<String> {
        if cipher_path.is_empty() {
            return Ok(String::new());
        }
        let mut parent = String::new();
        let mut out = Vec::new();
        for comp in cipher_path.split('/') {
            if comp.is_empty() {
                out.push(String::new());
                continue;
            }
            if is_long_name(comp) != LongNameKind::None {
                return Err(CloakError::NameDecodeInvalid(
                    "hashed long name needs its companion file".into(),
                ));
            }
            let iv = ivs.dir_iv(&parent)?;
            let plain = self.decrypt_name(comp, &iv)?;
            if parent.is_empty() {
                parent.push_str(&plain);
            } else {
                parent.push('/');
                parent.push_str(&plain);
            }
            out.push(plain);
        }
        Ok(out.join("/"))
    }
}

/// `cloakfs.longname.<base64(sha256(cipher_name))>`
pub fn hash_long_name(cipher_name: &str) -> String {
    let hash = Sha256::digest(cipher_name.as_bytes());
    format!("{}{}", LONGNAME_PREFIX, URL_SAFE.encode(hash))
}

/// Classify an on-disk name.
pub fn is_long_name(cipher_name: &str) -> LongNameKind {
    if !cipher_name.starts_with(LONGNAME_PREFIX) {
        return LongNameKind::None;
    }
    if cipher_name.ends_with(LONGNAME_SUFFIX) {
        return LongNameKind::NameFile;
    }
    LongNameKind::Content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn transform() -> NameTransform {
        let master = MasterKey::from_bytes([5u8; KEY_SIZE]);
        NameTransform::new(&master, true, true, true)
    }

    #[test]
    fn name_roundtrip() {
        let t = transform();
        let iv = [1u8; DIR_IV_LEN];
        let enc = t.encrypt_name("hello.txt", &iv).unwrap();
        assert_ne!(enc, "hello.txt");
        assert_eq!(t.decrypt_name(&enc, &iv).unwrap(), "hello.txt");
    }

    #[test]
    fn encryption_is_deterministic_per_iv() {
        let t = transform();
        let iv_a = [1u8; DIR_IV_LEN];
        let iv_b = [2u8; DIR_IV_LEN];
        let e1 = t.encrypt_name("report.pdf", &iv_a).unwrap();
        let e2 = t.encrypt_name("report.pdf", &iv_a).unwrap();
        let e3 = t.encrypt_name("report.pdf", &iv_b).unwrap();
        assert_eq!(e1, e2);
        assert_ne!(e1, e3, "different directories must yield different names");
    }

    #[test]
    fn wrong_iv_fails_authentication() {
        let t = transform();
        let enc = t.encrypt_name("secret", &[1u8; DIR_IV_LEN]).unwrap();
        assert!(matches!(
            t.decrypt_name(&enc, &[2u8; DIR_IV_LEN]),
            Err(CloakError::AuthenticationFailed)
        ));
    }

    #[test]
    fn dot_names_pass_through() {
        let t = transform();
        let iv = [0u8; DIR_IV_LEN];
        assert_eq!(t.encrypt_name(".", &iv).unwrap(), ".");
        assert_eq!(t.encrypt_name("..", &iv).unwrap(), "..");
        assert_eq!(t.decrypt_name(".", &iv).unwrap(), ".");
        assert_eq!(t.decrypt_name("..", &iv).unwrap(), "..");
    }

    #[test]
    fn invalid_plain_names_rejected() {
        let t = transform();
        let iv = [0u8; DIR_IV_LEN];
        assert!(t.encrypt_name("", &iv).is_err());
        assert!(t.encrypt_name("a/b", &iv).is_err());
        assert!(t.encrypt_name("a\0b", &iv).is_err());
    }

    #[test]
    fn corrupt_cipher_names_give_typed_errors() {
        let t = transform();
        let iv = [1u8; DIR_IV_LEN];
        // Not base64.
        assert!(matches!(
            t.decrypt_name("n@t-base64!", &iv),
            Err(CloakError::NameDecodeInvalid(_))
        ));
        // Misaligned decoded length.
        let short = t.b64_encode(&[0u8; 17]);
        assert!(matches!(
            t.decrypt_name(&short, &iv),
            Err(CloakError::NameDecodeInvalid(_))
        ));
        // Aligned but corrupt ciphertext.
        let garbage = t.b64_encode(&[7u8; 48]);
        assert!(matches!(
            t.decrypt_name(&garbage, &iv),
            Err(CloakError::AuthenticationFailed)
        ));
    }

    #[test]
    fn legacy_zero_tweak_ignores_iv() {
        let master = MasterKey::from_bytes([5u8; KEY_SIZE]);
        let t = NameTransform::new(&master, true, true, true).with_legacy_zero_tweak();
        let e1 = t.encrypt_name("same", &[1u8; DIR_IV_LEN]).unwrap();
        let e2 = t.encrypt_name("same", &[9u8; DIR_IV_LEN]).unwrap();
        assert_eq!(e1, e2);
    }

    #[test]
    fn from_config_honors_legacy_tweak() {
        let master = MasterKey::from_bytes([5u8; KEY_SIZE]);
        let cfg = cloakfs_core::MountConfig {
            legacy_zero_tweak: true,
            ..Default::default()
        };
        let t = NameTransform::from_config(&master, &cfg);
        assert_eq!(
            t.encrypt_name("n", &[1u8; DIR_IV_LEN]).unwrap(),
            t.encrypt_name("n", &[2u8; DIR_IV_LEN]).unwrap()
        );
    }

    #[test]
    fn long_names_are_hashed() {
        let t = transform();
        let iv = [3u8; DIR_IV_LEN];
        let long = "x".repeat(250);
        let stored = t.encrypt_and_hash_name(&long, &iv).unwrap();
        assert!(stored.starts_with(LONGNAME_PREFIX));
        assert!(stored.len() <= NAME_MAX);
        assert_eq!(is_long_name(&stored), LongNameKind::Content);
        assert_eq!(
            is_long_name(&format!("{stored}{LONGNAME_SUFFIX}")),
            LongNameKind::NameFile
        );
        assert_eq!(is_long_name("ordinary"), LongNameKind::None);

        // The hash is stable, so lookups can recompute it.
        assert_eq!(stored, t.encrypt_and_hash_name(&long, &iv).unwrap());

        // Short names stay untouched.
        let short = t.encrypt_and_hash_name("short", &iv).unwrap();
        assert_eq!(is_long_name(&short), LongNameKind::None);
    }

    struct MapIvs(HashMap<String, [u8; DIR_IV_LEN]>);

    impl DirIvSource for MapIvs {
        fn dir_iv(&self, plain_dir: &str) -> CloakResult<[u8; DIR_IV_LEN]> {
            self.0
                .get(plain_dir)
                .copied()
                .ok_or_else(|| CloakError::Other(anyhow::anyhow!("no IV for {plain_dir:?}")))
        }
    }

    #[test]
    fn path_roundtrip_uses_per_directory_ivs() {
        let t = transform();
        let mut ivs = HashMap::new();
        ivs.insert("".to_string(), [1u8; DIR_IV_LEN]);
        ivs.insert("a".to_string(), [2u8; DIR_IV_LEN]);
        ivs.insert("a/b".to_string(), [3u8; DIR_IV_LEN]);
        let ivs = MapIvs(ivs);

        let enc = t.encrypt_path("a/b/c.txt", &ivs).unwrap();
        let comps: Vec<&str> = enc.split('/').collect();
        assert_eq!(comps.len(), 3);
        assert_eq!(t.decrypt_path(&enc, &ivs).unwrap(), "a/b/c.txt");

        // The same leaf name under a different parent encrypts differently.
        let mut ivs2 = HashMap::new();
        ivs2.insert("".to_string(), [1u8; DIR_IV_LEN]);
        let enc_root = t.encrypt_path("c.txt", &MapIvs(ivs2)).unwrap();
        assert_ne!(enc_root, comps[2]);
    }

    #[test]
    fn path_empty_components_pass_through() {
        let t = transform();
        let mut ivs = HashMap::new();
        ivs.insert("".to_string(), [1u8; DIR_IV_LEN]);
        let ivs = MapIvs(ivs);

        assert_eq!(t.encrypt_path("", &ivs).unwrap(), "");
        let enc = t.encrypt_path("a/", &ivs).unwrap();
        assert!(enc.ends_with('/'));
    }

    proptest! {
        #[test]
        fn name_roundtrip_any_printable(
            s in "[a-zA-Z0-9 ._-]{1,300}",
            iv_byte in any::<u8>(),
        ) {
            prop_assume!(s != "." && s != "..");
            let t = transform();
            let iv = [iv_byte; DIR_IV_LEN];
            let enc = t.encrypt_name(&s, &iv).unwrap();
            prop_assert_eq!(t.decrypt_name(&enc, &iv).unwrap(), s.clone());
            // A different IV must not decrypt to the same name.
            let mut other = iv;
            other[0] ^= 1;
            prop_assert!(t.decrypt_name(&enc, &other).is_err());
        }
    }
}
