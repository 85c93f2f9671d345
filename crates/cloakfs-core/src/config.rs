use serde::{Deserialize, Serialize};

use crate::error::{CloakError, CloakResult};

/// AEAD algorithm used for file content.
///
/// Selected once at mount time; the concrete cipher object is constructed
/// from this and never switched afterwards. Reverse-serving mode (content
/// cannot carry a persisted nonce) requires the nonce-misuse-resistant
/// `Aes256Siv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// AES-256-GCM with 128-bit nonces.
    Aes256Gcm,
    /// AES-256-SIV (RFC 5297), deterministic and nonce-misuse-resistant.
    Aes256Siv,
    /// XChaCha20-Poly1305 with 192-bit nonces.
    XChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// Nonce length in bytes.
    pub fn nonce_len(self) -> usize {
        match self {
            AeadAlgorithm::Aes256Gcm => 16,
            AeadAlgorithm::Aes256Siv => 16,
            AeadAlgorithm::XChaCha20Poly1305 => 24,
        }
    }

    /// Authentication tag length in bytes.
    pub fn tag_len(self) -> usize {
        16
    }
}

/// Capabilities a ciphertext volume can declare.
///
/// A config listing a flag this build does not know maps to
/// `CloakError::UnknownFeatureFlag` and the mount is refused: a missing
/// capability would silently mis-decrypt the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// 128-bit content nonces (the only supported width).
    GcmIv128,
    /// Per-directory IV files tweaking name encryption.
    DirIv,
    /// Tweaked deterministic name encryption (vs. legacy zero-tweak).
    TweakedNames,
    /// Hashed storage of over-long encrypted names plus companion files.
    LongNames,
    /// Unpadded base64 for encrypted names.
    Raw64,
    /// Per-purpose subkeys derived from the master key via HKDF.
    HkdfDerivedKeys,
    /// Content encrypted with AES-SIV.
    AesSiv,
    /// Content encrypted with XChaCha20-Poly1305.
    XChaCha20Poly1305,
}

impl FeatureFlag {
    /// Parse a flag name as found in a volume config file.
    pub fn from_name(name: &str) -> CloakResult<Self> {
        match name {
            "GCMIV128" => Ok(FeatureFlag::GcmIv128),
            "DirIV" => Ok(FeatureFlag::DirIv),
            "TweakedNames" => Ok(FeatureFlag::TweakedNames),
            "LongNames" => Ok(FeatureFlag::LongNames),
            "Raw64" => Ok(FeatureFlag::Raw64),
            "HKDF" => Ok(FeatureFlag::HkdfDerivedKeys),
            "AESSIV" => Ok(FeatureFlag::AesSiv),
            "XChaCha20Poly1305" => Ok(FeatureFlag::XChaCha20Poly1305),
            other => Err(CloakError::UnknownFeatureFlag(other.to_string())),
        }
    }
}

/// Everything the engine needs to know at mount time.
///
/// The on-disk volume config file (JSON, password-wrapped master key) is
/// handled by the mount frontend; this is the validated, decoded form it
/// hands to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Content AEAD algorithm.
    pub algorithm: AeadAlgorithm,
    /// Plaintext block size in bytes.
    pub plain_block_size: u64,
    /// Hash encrypted names longer than the filesystem limit.
    pub long_names: bool,
    /// Unpadded base64 names.
    pub raw64: bool,
    /// Derive per-purpose subkeys via HKDF (off only on legacy volumes).
    pub hkdf: bool,
    /// Legacy volumes encrypt all names with a fixed zero tweak instead of
    /// per-directory IVs.
    pub legacy_zero_tweak: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            algorithm: AeadAlgorithm::Aes256Gcm,
            plain_block_size: 4096,
            long_names: true,
            raw64: true,
            hkdf: true,
            legacy_zero_tweak: false,
        }
    }
}

impl MountConfig {
    /// Build a config from the feature-flag list of a volume config file.
    /// Unknown flag names have already been rejected by
    /// [`FeatureFlag::from_name`].
    pub fn from_flags(flags: &[FeatureFlag]) -> CloakResult<Self> {
        let has = |f: FeatureFlag| flags.contains(&f);
        let algorithm = match (has(FeatureFlag::AesSiv), has(FeatureFlag::XChaCha20Poly1305)) {
            (true, true) => {
                return Err(CloakError::ConfigInvalid(
                    "AESSIV and XChaCha20Poly1305 are mutually exclusive".into(),
                ))
            }
            (true, false) => AeadAlgorithm::Aes256Siv,
            (false, true) => AeadAlgorithm::XChaCha20Poly1305,
            (false, false) => AeadAlgorithm::Aes256Gcm,
        };
        if algorithm == AeadAlgorithm::Aes256Gcm && !has(FeatureFlag::GcmIv128) {
            // 96-bit GCM volumes predate this implementation.
            return Err(CloakError::ConfigInvalid(
                "volumes without GCMIV128 are not supported".into(),
            ));
        }
        let cfg = Self {
            algorithm,
            long_names: has(FeatureFlag::LongNames),
            raw64: has(FeatureFlag::Raw64),
            hkdf: has(FeatureFlag::HkdfDerivedKeys),
            legacy_zero_tweak: !has(FeatureFlag::DirIv),
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CloakResult<()> {
        if self.plain_block_size < 1024 || !self.plain_block_size.is_power_of_two() {
            return Err(CloakError::ConfigInvalid(format!(
                "plain_block_size {} must be a power of two >= 1024",
                self.plain_block_size
            )));
        }
        Ok(())
    }
}

/// scrypt cost parameters as declared in a volume config file.
///
/// Key derivation itself happens in the mount frontend, once, before the
/// engine exists. We still validate the parameters here so a downgraded
/// config file cannot silently weaken the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScryptParams {
    /// CPU/memory cost, log2.
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    pub salt_len: usize,
    pub key_len: usize,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            log_n: 16,
            r: 8,
            p: 1,
            salt_len: 32,
            key_len: 32,
        }
    }
}

impl ScryptParams {
    /// Cost floor. Anything below this is rejected at mount time.
    pub const MIN_LOG_N: u8 = 10;

    pub fn validate(&self) -> CloakResult<()> {
        if self.log_n < Self::MIN_LOG_N {
            return Err(CloakError::ScryptParamsTooWeak(format!(
                "log_n={} below minimum {}",
                self.log_n,
                Self::MIN_LOG_N
            )));
        }
        if self.r < 1 || self.p < 1 {
            return Err(CloakError::ScryptParamsTooWeak(format!(
                "r={} p={} must both be >= 1",
                self.r, self.p
            )));
        }
        if self.salt_len < 16 {
            return Err(CloakError::ScryptParamsTooWeak(format!(
                "salt_len={} below minimum 16",
                self.salt_len
            )));
        }
        if self.key_len != 32 {
            return Err(CloakError::ScryptParamsTooWeak(format!(
                "key_len={} must be 32",
                self.key_len
            )));
        }
        Ok(())
    }
}
