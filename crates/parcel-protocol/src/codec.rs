use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::ProtocolError;
use crate::types::{
    BackupBlob, Coordinates, EncryptedRecord, VerificationPayload, BACKUP_IV_LEN,
    BACKUP_SALT_LEN,
};

/// AES-GCM tag length; the smallest possible backup ciphertext.
const GCM_TAG_LEN: usize = 16;

/// Smallest decodable backup blob: salt + iv + empty ciphertext with tag.
pub const MIN_BACKUP_LEN: usize = BACKUP_SALT_LEN + BACKUP_IV_LEN + GCM_TAG_LEN;

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64, naming the offending field on failure.
pub fn decode_b64(field: &'static str, text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text.trim())
        .map_err(|source| ProtocolError::Base64 { field, source })
}

/// Encode a record as JSON for the relay collaborator.
pub fn encode_record(record: &EncryptedRecord) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(record)?)
}

pub fn decode_record(json: &str) -> Result<EncryptedRecord, ProtocolError> {
    Ok(serde_json::from_str(json)?)
}

pub fn encode_verification_payload(payload: &VerificationPayload) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(payload)?)
}

/// Parse a scanned verification payload. Any shape mismatch fails the whole parse.
pub fn decode_verification_payload(json: &str) -> Result<VerificationPayload, ProtocolError> {
    Ok(serde_json::from_str(json)?)
}

/// Canonical string form of a location fix, the plaintext that gets encrypted.
pub fn encode_coordinates(coords: &Coordinates) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(coords)?)
}

pub fn decode_coordinates(text: &str) -> Result<Coordinates, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Frame a backup as `base64(salt || iv || ciphertext)`.
pub fn encode_backup_blob(blob: &BackupBlob) -> String {
    let mut buf = Vec::with_capacity(BACKUP_SALT_LEN + BACKUP_IV_LEN + blob.ciphertext.len());
    buf.extend_from_slice(&blob.salt);
    buf.extend_from_slice(&blob.iv);
    buf.extend_from_slice(&blob.ciphertext);
    encode_b64(&buf)
}

/// Split a backup into salt, iv and ciphertext by fixed offsets.
pub fn decode_backup_blob(text: &str) -> Result<BackupBlob, ProtocolError> {
    let data = decode_b64("backup", text)?;
    if data.len() < MIN_BACKUP_LEN {
        return Err(ProtocolError::BlobTooShort {
            expected: MIN_BACKUP_LEN,
            got: data.len(),
        });
    }

    let mut salt = [0u8; BACKUP_SALT_LEN];
    salt.copy_from_slice(&data[..BACKUP_SALT_LEN]);

    let mut iv = [0u8; BACKUP_IV_LEN];
    iv.copy_from_slice(&data[BACKUP_SALT_LEN..BACKUP_SALT_LEN + BACKUP_IV_LEN]);

    Ok(BackupBlob {
        salt,
        iv,
        ciphertext: data[BACKUP_SALT_LEN + BACKUP_IV_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IV_LEN;

    #[test]
    fn record_json_roundtrip() {
        let record = EncryptedRecord::new(&[0xDE, 0xAD], &[1u8; IV_LEN], &[5u8; 32], 41);
        let json = encode_record(&record).unwrap();
        assert_eq!(decode_record(&json).unwrap(), record);
    }

    #[test]
    fn record_missing_index_rejected() {
        let json = r#"{"ciphertext":"AA==","iv":"AA==","senderPublicKey":"AA=="}"#;
        assert!(matches!(decode_record(json), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn verification_payload_with_extra_field_rejected() {
        let json = r#"{"type":"parcel_e2e","version":1,"publicKey":"AA==","fingerprint":"x","extra":true}"#;
        assert!(decode_verification_payload(json).is_err());
    }

    #[test]
    fn verification_payload_missing_field_rejected() {
        let json = r#"{"type":"parcel_e2e","version":1,"publicKey":"AA=="}"#;
        assert!(decode_verification_payload(json).is_err());
    }

    #[test]
    fn backup_blob_fixed_offsets() {
        let blob = BackupBlob {
            salt: [0x11; BACKUP_SALT_LEN],
            iv: [0x22; BACKUP_IV_LEN],
            ciphertext: vec![0x33; 40],
        };
        let text = encode_backup_blob(&blob);

        let raw = decode_b64("backup", &text).unwrap();
        assert_eq!(&raw[..16], &[0x11; 16]);
        assert_eq!(&raw[16..28], &[0x22; 12]);
        assert_eq!(raw.len(), 16 + 12 + 40);

        assert_eq!(decode_backup_blob(&text).unwrap(), blob);
    }

    #[test]
    fn backup_blob_too_short() {
        let text = encode_b64(&[0u8; MIN_BACKUP_LEN - 1]);
        assert!(matches!(
            decode_backup_blob(&text),
            Err(ProtocolError::BlobTooShort { .. })
        ));
    }

    #[test]
    fn backup_blob_tolerates_surrounding_whitespace() {
        let blob = BackupBlob {
            salt: [1; BACKUP_SALT_LEN],
            iv: [2; BACKUP_IV_LEN],
            ciphertext: vec![3; GCM_TAG_LEN],
        };
        let text = format!("  {}\n", encode_backup_blob(&blob));
        assert_eq!(decode_backup_blob(&text).unwrap(), blob);
    }

    #[test]
    fn coordinates_canonical_roundtrip() {
        let coords = Coordinates {
            lat: -33.8688,
            lng: 151.2093,
            accuracy: Some(12.5),
            recorded_at: 1_700_000_123_456,
        };
        let text = encode_coordinates(&coords).unwrap();
        assert_eq!(
            text,
            r#"{"lat":-33.8688,"lng":151.2093,"accuracy":12.5,"recordedAt":1700000123456}"#
        );
        assert_eq!(decode_coordinates(&text).unwrap(), coords);
    }
}
