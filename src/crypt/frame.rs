//! Plaintext framing and padding
//!
//! A frame is `[16 random bytes][u32 BE message length][message][app id]`, padded to a multiple of
//! [`PAD_BLOCK_SIZE`] bytes before encryption.

use super::CryptError;

/// Padding block size of the platform. Twice the AES block size.
pub(super) const PAD_BLOCK_SIZE: usize = 32;

pub(super) const RANDOM_LEN: usize = 16;
const LENGTH_LEN: usize = 4;
const HEADER_LEN: usize = RANDOM_LEN + LENGTH_LEN;

#[derive(Debug, PartialEq, Eq)]
pub(super) struct Frame<'a> {
    pub(super) message: &'a [u8],
    pub(super) app_id: &'a [u8],
}

/// Builds the unpadded frame.
pub(super) fn pack(
    random: &[u8; RANDOM_LEN],
    message: &[u8],
    app_id: &[u8],
) -> Result<Vec<u8>, CryptError> {
    let len = u32::try_from(message.len()).map_err(|_| CryptError::PayloadTooLarge(message.len()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + message.len() + app_id.len() + PAD_BLOCK_SIZE);
    buf.extend_from_slice(random);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(message);
    buf.extend_from_slice(app_id);
    Ok(buf)
}

/// Splits an unpadded frame into message and app id.
pub(super) fn unpack(buf: &[u8]) -> Result<Frame<'_>, CryptError> {
    let Some(len_bytes) = buf.get(RANDOM_LEN..HEADER_LEN) else {
        return Err(CryptError::FrameLengthMismatch {
            declared: 0,
            available: buf.len().saturating_sub(HEADER_LEN),
        });
    };
    let declared = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    let declared = declared as usize;
    let available = buf.len() - HEADER_LEN;
    if declared > available {
        return Err(CryptError::FrameLengthMismatch {
            declared,
            available,
        });
    }

    let (message, app_id) = buf[HEADER_LEN..].split_at(declared);
    Ok(Frame { message, app_id })
}

/// Appends `p` bytes of value `p`, where `p` is in `1..=32`.
pub(super) fn pad(buf: &mut Vec<u8>) {
    let amount = PAD_BLOCK_SIZE - buf.len() % PAD_BLOCK_SIZE;
    buf.resize(buf.len() + amount, amount as u8);
}

/// Strips the padding named by the last byte.
///
/// A pad length outside of `1..=32` is tolerated and nothing is stripped.
pub(super) fn unpad(buf: &[u8]) -> &[u8] {
    let amount = match buf.last() {
        Some(&p) if (1..=PAD_BLOCK_SIZE).contains(&(p as usize)) => p as usize,
        _ => 0,
    };
    &buf[..buf.len().saturating_sub(amount)]
}
