use thiserror::Error;

pub type CloakResult<T> = Result<T, CloakError>;

/// Error taxonomy of the encryption engine.
///
/// Propagation policy: per-item corruption (one bad directory entry, one
/// unreadable longname companion file) is logged and the item skipped;
/// corruption of structural state (missing dir IV, bad file header) fails
/// the single operation that needed it; config failures are fatal to the
/// mount attempt only. Corrupted content must surface as an error on the
/// affected range, never as silently wrong bytes.
#[derive(Debug, Error)]
pub enum CloakError {
    /// Ciphertext, tag, nonce or associated data mismatch. Always
    /// fail-closed: no partial plaintext is ever returned alongside this.
    #[error("authentication failed: ciphertext or associated data corrupt")]
    AuthenticationFailed,

    /// Ciphertext block shorter than a nonce, i.e. truncated mid-block.
    #[error("ciphertext block too short: {len} bytes")]
    BlockTooShort { len: usize },

    /// A nonce of all zero bytes is never generated and means the
    /// underlying storage returned bogus data.
    #[error("all-zero nonce in ciphertext block")]
    AllZeroNonce,

    /// File header has the wrong length, an unknown version, or is
    /// all-zero (interrupted create).
    #[error("invalid file header: {0}")]
    HeaderInvalid(String),

    /// Name unpadding failed the range or uniformity checks. Expected
    /// corruption signal, not a panic. Details are deliberately not
    /// included to avoid acting as a padding oracle.
    #[error("invalid padding in encrypted name")]
    PaddingInvalid,

    /// Encrypted name is not valid base64 or has a misaligned decoded
    /// length.
    #[error("undecodable encrypted name: {0}")]
    NameDecodeInvalid(String),

    /// A directory IV file is missing, has the wrong length, or is
    /// all-zero. Name operations inside that directory cannot proceed.
    #[error("invalid directory IV: {0}")]
    DirIvInvalid(String),

    /// The volume config declares a capability this build does not
    /// understand. Refusing to mount is the only safe reaction.
    #[error("unknown feature flag: {0}")]
    UnknownFeatureFlag(String),

    /// The key-derivation parameters are below the accepted cost floor.
    #[error("scrypt parameters too weak: {0}")]
    ScryptParamsTooWeak(String),

    /// Mount configuration is internally inconsistent.
    #[error("invalid mount config: {0}")]
    ConfigInvalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        fn fails() -> CloakResult<()> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(CloakError::Io(_))));
    }

    #[test]
    fn auth_failure_message_is_generic() {
        // The message must not leak which of nonce/tag/aad mismatched.
        let msg = CloakError::AuthenticationFailed.to_string();
        assert!(msg.contains("authentication failed"));
    }
}
