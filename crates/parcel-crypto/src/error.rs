use parcel_protocol::ProtocolError;
use thiserror::Error;

use crate::stores::StoreError;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no active identity key pair")]
    KeyUnavailable,

    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    /// Deliberately carries no detail: wrong key, wrong index, corrupted
    /// ciphertext and tampering all look the same to the caller.
    #[error("decryption failed")]
    Decryption,

    #[error("backup restore failed: incorrect password or corrupted backup")]
    BackupPasswordIncorrect,

    #[error("malformed verification payload: {0}")]
    MalformedVerificationPayload(String),

    #[error("key store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encryption,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
