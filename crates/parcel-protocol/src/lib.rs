//! Wire artifacts exchanged by the parcel end-to-end encryption core.
//!
//! Nothing in this crate performs cryptography. It defines the records that
//! cross the boundary to the relay/storage collaborator, the payload encoded
//! into verification codes, the location payload, and the framing of
//! password-protected key backups.

pub mod codec;
pub mod error;
pub mod types;

pub use error::ProtocolError;
pub use types::{BackupBlob, Coordinates, EncryptedRecord, VerificationPayload};
