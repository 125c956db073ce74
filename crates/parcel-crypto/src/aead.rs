//! AES-256-GCM helpers shared by message encryption, key backups and the
//! encrypted file store.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// AES-256 key size.
pub const KEY_LEN: usize = 32;

/// GCM nonce size (96 bits).
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

fn to_aead_key(key: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Fill an array from the system CSPRNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(out)
}

/// Fresh random 96-bit nonce.
pub fn random_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    random_bytes::<NONCE_LEN>()
}

/// Encrypt `plaintext`, returning ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let aead_key = to_aead_key(key)?;
    let mut in_out = plaintext.to_vec();
    aead_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encryption)?;
    Ok(in_out)
}

/// Decrypt ciphertext-with-tag. Any authentication failure is `Decryption`.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < GCM_TAG_SIZE {
        return Err(CryptoError::Decryption);
    }

    let aead_key = to_aead_key(key)?;
    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = aead_key
        .open_in_place(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            in_out.as_mut_slice(),
        )
        .map_err(|_| CryptoError::Decryption)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}
