use std::fmt;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptError;

pub(super) const KEY_LEN: usize = 32;
pub(super) const IV_LEN: usize = 16;

/// Standard alphabet tolerating non-zero trailing bits; the platform does not guarantee canonical
/// keys.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// AES-256 key and CBC IV derived from the `EncodingAESKey`.
///
/// The IV is the first 16 bytes of the key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl KeyMaterial {
    /// Derives the key material from the 43 characters long `EncodingAESKey`.
    ///
    /// The configured string is the base64 encoding of the key without the trailing padding
    /// character.
    pub fn from_encoding_aes_key(encoding_aes_key: &str) -> Result<Self, CryptError> {
        let mut decoded = KEY_ENGINE
            .decode(format!("{encoding_aes_key}="))
            .map_err(|e| CryptError::InvalidKeyMaterial(e.to_string()))?;
        let key: Result<[u8; KEY_LEN], _> = decoded.as_slice().try_into();
        let len = decoded.len();
        decoded.zeroize();
        match key {
            Ok(key) => Ok(Self::from_key(key)),
            Err(_) => Err(CryptError::InvalidKeyMaterial(format!(
                "decoded to {len} bytes, expected {KEY_LEN}"
            ))),
        }
    }

    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        let mut iv = [0; IV_LEN];
        iv.copy_from_slice(&key[..IV_LEN]);
        Self { key, iv }
    }

    pub(super) fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub(super) fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}
