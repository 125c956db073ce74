//! Key derivation and hashing.
//!
//! `derive_password_key`: PBKDF2-HMAC-SHA256, wraps key backups and the
//!   encrypted file store.
//!
//! `hkdf_expand`: HKDF-SHA256, per-message keys.

use std::num::NonZeroU32;

use hkdf::Hkdf;
use ring::pbkdf2;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::aead::KEY_LEN;
use crate::error::CryptoError;

/// Derive a 256-bit AES-GCM key from a password and salt.
pub fn derive_password_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| CryptoError::InvalidKey("PBKDF2 iteration count must be non-zero".into()))?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key[..],
    );
    Ok(key)
}

/// HKDF-SHA256 extract (zero salt when `None`) then expand into 32 bytes.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand: {e}")))?;
    Ok(okm)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
