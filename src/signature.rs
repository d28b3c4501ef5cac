//! Request and ciphertext signatures
//!
//! The platform signs with SHA-1 over the lexicographically sorted, concatenated parts. Sorting
//! makes the signature independent of the order in which the parts are passed.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Computes the lowercase hex SHA-1 signature of the given parts.
pub fn signature(parts: &[&str]) -> String {
    let mut parts = parts.to_vec();
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Checks `candidate` against the signature of token, timestamp, nonce and an optional extra part
///
/// The extra part is the base64 ciphertext when signing an encrypted message.
pub fn verify(
    token: &str,
    timestamp: &str,
    nonce: &str,
    candidate: &str,
    extra: Option<&str>,
) -> bool {
    let expected = match extra {
        Some(extra) => signature(&[token, timestamp, nonce, extra]),
        None => signature(&[token, timestamp, nonce]),
    };
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}
