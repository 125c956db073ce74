use serde::{Deserialize, Serialize};

use crate::codec::{decode_b64, encode_b64};
use crate::error::ProtocolError;

/// AES-GCM nonce length carried in the `iv` field of a record.
pub const IV_LEN: usize = 12;

/// Salt length at the front of a backup blob.
pub const BACKUP_SALT_LEN: usize = 16;

/// Nonce length following the salt in a backup blob.
pub const BACKUP_IV_LEN: usize = 12;

/// Current version of the verification payload schema.
pub const VERIFICATION_VERSION: u32 = 1;

/// Suffix appended to the application tag to form the verification `type`.
pub const VERIFICATION_TYPE_SUFFIX: &str = "e2e";

/// An encrypted message as handed to the relay/storage collaborator.
///
/// The collaborator stores this verbatim next to its own metadata (sender and
/// recipient ids, timestamps) and never needs to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecord {
    /// Base64 AES-GCM ciphertext with appended tag.
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub iv: String,
    /// Base64 exported public key of the sender.
    pub sender_public_key: String,
    /// Index the message key was derived at.
    pub message_index: u64,
}

impl EncryptedRecord {
    pub fn new(
        ciphertext: &[u8],
        iv: &[u8; IV_LEN],
        sender_public_key: &[u8],
        message_index: u64,
    ) -> Self {
        Self {
            ciphertext: encode_b64(ciphertext),
            iv: encode_b64(iv),
            sender_public_key: encode_b64(sender_public_key),
            message_index,
        }
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("ciphertext", &self.ciphertext)
    }

    /// Decoded nonce; anything other than 12 bytes is rejected.
    pub fn iv_bytes(&self) -> Result<[u8; IV_LEN], ProtocolError> {
        let raw = decode_b64("iv", &self.iv)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidLength {
                field: "iv",
                expected: IV_LEN,
                got: raw.len(),
            })
    }

    pub fn sender_public_key_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("senderPublicKey", &self.sender_public_key)
    }
}

/// Payload encoded into a scannable code for out-of-band identity checks.
///
/// Unknown fields are rejected so that a payload of a different shape never
/// half-parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    /// Base64 exported public key.
    pub public_key: String,
    /// Short fingerprint of `public_key`.
    pub fingerprint: String,
}

impl VerificationPayload {
    /// Build the `type` tag for an application tag, e.g. `parcel_` -> `parcel_e2e`.
    pub fn type_tag(app_tag: &str) -> String {
        format!("{app_tag}{VERIFICATION_TYPE_SUFFIX}")
    }
}

/// A location fix shared between peers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
    /// Horizontal accuracy in meters, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Unix time in milliseconds when the fix was taken.
    pub recorded_at: u64,
}

/// A password-wrapped identity key pair: `salt || iv || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupBlob {
    pub salt: [u8; BACKUP_SALT_LEN],
    pub iv: [u8; BACKUP_IV_LEN],
    /// AES-GCM ciphertext with appended tag.
    pub ciphertext: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_camel_case_wire_names() {
        let record = EncryptedRecord::new(b"ct", &[7u8; IV_LEN], &[1u8; 32], 3);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("senderPublicKey").is_some());
        assert_eq!(json["messageIndex"], 3);
        assert!(json.get("sender_public_key").is_none());
    }

    #[test]
    fn record_accessors_decode_fields() {
        let record = EncryptedRecord::new(b"ciphertext", &[9u8; IV_LEN], &[2u8; 32], 0);
        assert_eq!(record.ciphertext_bytes().unwrap(), b"ciphertext");
        assert_eq!(record.iv_bytes().unwrap(), [9u8; IV_LEN]);
        assert_eq!(record.sender_public_key_bytes().unwrap(), vec![2u8; 32]);
    }

    #[test]
    fn short_iv_rejected() {
        let mut record = EncryptedRecord::new(b"ct", &[0u8; IV_LEN], &[1u8; 32], 0);
        record.iv = encode_b64(&[0u8; 8]);
        assert!(matches!(
            record.iv_bytes(),
            Err(ProtocolError::InvalidLength { field: "iv", expected: 12, got: 8 })
        ));
    }

    #[test]
    fn garbage_iv_rejected() {
        let mut record = EncryptedRecord::new(b"ct", &[0u8; IV_LEN], &[1u8; 32], 0);
        record.iv = "!!not base64!!".into();
        assert!(matches!(
            record.iv_bytes(),
            Err(ProtocolError::Base64 { field: "iv", .. })
        ));
    }

    #[test]
    fn verification_type_tag() {
        assert_eq!(VerificationPayload::type_tag("parcel_"), "parcel_e2e");
    }

    #[test]
    fn verification_payload_wire_shape() {
        let payload = VerificationPayload {
            kind: "parcel_e2e".into(),
            version: VERIFICATION_VERSION,
            public_key: "AAAA".into(),
            fingerprint: "0000 1111 2222 3333".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "parcel_e2e");
        assert_eq!(json["version"], 1);
        assert_eq!(json["publicKey"], "AAAA");
    }

    #[test]
    fn coordinates_omit_missing_accuracy() {
        let coords = Coordinates {
            lat: 52.52,
            lng: 13.405,
            accuracy: None,
            recorded_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&coords).unwrap();
        assert!(!json.contains("accuracy"));
        assert!(json.contains("recordedAt"));
    }
}
