//! Parcel end-to-end encryption core.
//!
//! This crate provides:
//! - Identity key management (X25519, one active pair per device)
//! - Per-peer sessions derived by key agreement, with a sender-side counter
//! - Per-message AES-256-GCM keys derived with HKDF
//! - Password-protected key backup and restore
//! - Fingerprints and QR verification payloads
//! - Encrypted location updates
//! - Repository traits with in-memory and encrypted-file implementations

pub mod aead;
pub mod backup;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod location;
pub mod persistence;
pub mod session;
pub mod stores;
pub mod verification;

// Re-export key types for convenience
pub use backup::BackupManager;
pub use cipher::{DecryptedMessage, MessageCipher, UNDECRYPTABLE_PLACEHOLDER};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CryptoConfig;
pub use engine::Engine;
pub use error::CryptoError;
pub use identity::{generate_identity_key_pair, IdentityKeyManager, IdentityKeyPair};
pub use location::{decrypt_location, decrypt_locations, encrypt_location, LocationEnvelope, LocationReading};
pub use persistence::EncryptedFileStore;
pub use session::{Session, SessionManager};
pub use stores::{KeyRepository, MemoryKeyRepository, MemorySessionRepository, SessionRepository, StoreError};
pub use verification::{
    generate_fingerprint, generate_short_fingerprint, generate_verification_data, verify_qr_code,
    VerificationData, VerificationFailure, VerificationResult,
};
