//! Human-comparable fingerprints and scannable verification payloads.

use std::fmt;

use parcel_protocol::codec::{decode_b64, decode_verification_payload, encode_b64, encode_verification_payload};
use parcel_protocol::types::VERIFICATION_VERSION;
use parcel_protocol::VerificationPayload;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::CryptoError;
use crate::kdf::sha256;

/// Hex characters per fingerprint group.
const GROUP_LEN: usize = 4;

/// Groups kept in the short fingerprint.
const SHORT_GROUPS: usize = 4;

/// SHA-256 of the public key as uppercase hex, `XXXX XXXX ...` (16 groups).
pub fn generate_fingerprint(public_key: &[u8]) -> String {
    let hex: String = sha256(public_key)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();
    hex.as_bytes()
        .chunks(GROUP_LEN)
        .map(|group| String::from_utf8_lossy(group).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First four groups of [`generate_fingerprint`].
pub fn generate_short_fingerprint(public_key: &[u8]) -> String {
    generate_fingerprint(public_key)
        .split(' ')
        .take(SHORT_GROUPS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything a UI needs to show or encode for out-of-band verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationData {
    pub fingerprint: String,
    pub short_fingerprint: String,
    pub payload: VerificationPayload,
    /// `payload` serialized, ready for a QR encoder.
    pub payload_json: String,
}

pub fn generate_verification_data(
    public_key: &[u8],
    app_tag: &str,
) -> Result<VerificationData, CryptoError> {
    let fingerprint = generate_fingerprint(public_key);
    let short_fingerprint = generate_short_fingerprint(public_key);
    let payload = VerificationPayload {
        kind: VerificationPayload::type_tag(app_tag),
        version: VERIFICATION_VERSION,
        public_key: encode_b64(public_key),
        fingerprint: short_fingerprint.clone(),
    };
    let payload_json = encode_verification_payload(&payload)?;

    Ok(VerificationData {
        fingerprint,
        short_fingerprint,
        payload,
        payload_json,
    })
}

/// Why a scanned payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    Malformed(String),
    WrongType { found: String },
    UnsupportedVersion(u32),
    PublicKeyMismatch,
    FingerprintMismatch,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed verification payload: {reason}"),
            Self::WrongType { found } => write!(f, "not a verification code (type {found:?})"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported verification version {v}"),
            Self::PublicKeyMismatch => f.write_str("public key does not match"),
            Self::FingerprintMismatch => f.write_str("fingerprint does not match"),
        }
    }
}

impl From<VerificationFailure> for CryptoError {
    fn from(failure: VerificationFailure) -> Self {
        CryptoError::MalformedVerificationPayload(failure.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub error: Option<VerificationFailure>,
}

impl VerificationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn fail(reason: VerificationFailure) -> Self {
        debug!(reason = %reason, "verification payload rejected");
        Self {
            valid: false,
            error: Some(reason),
        }
    }
}

/// Check a scanned payload against the public key we expect for the peer.
///
/// Never fails: scanning untrusted input is routine, so every problem comes
/// back as `valid: false` with a reason.
pub fn verify_qr_code(payload: &str, expected_public_key: &str, app_tag: &str) -> VerificationResult {
    let parsed = match decode_verification_payload(payload) {
        Ok(parsed) => parsed,
        Err(e) => return VerificationResult::fail(VerificationFailure::Malformed(e.to_string())),
    };

    if parsed.kind != VerificationPayload::type_tag(app_tag) {
        return VerificationResult::fail(VerificationFailure::WrongType { found: parsed.kind });
    }
    if parsed.version != VERIFICATION_VERSION {
        return VerificationResult::fail(VerificationFailure::UnsupportedVersion(parsed.version));
    }

    let keys_match: bool = parsed
        .public_key
        .as_bytes()
        .ct_eq(expected_public_key.as_bytes())
        .into();
    if !keys_match {
        return VerificationResult::fail(VerificationFailure::PublicKeyMismatch);
    }

    let expected_raw = match decode_b64("publicKey", expected_public_key) {
        Ok(raw) => raw,
        Err(e) => return VerificationResult::fail(VerificationFailure::Malformed(e.to_string())),
    };
    let expected_short = generate_short_fingerprint(&expected_raw);
    let fingerprints_match: bool = parsed
        .fingerprint
        .as_bytes()
        .ct_eq(expected_short.as_bytes())
        .into();
    if !fingerprints_match {
        return VerificationResult::fail(VerificationFailure::FingerprintMismatch);
    }

    VerificationResult::ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::identity::generate_identity_key_pair;

    const TAG: &str = "parcel_";

    #[test]
    fn fingerprint_shape() {
        let fp = generate_fingerprint(b"some public key");
        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 16);
        for group in groups {
            assert_eq!(group.len(), 4);
            assert!(group
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn fingerprint_of_known_input() {
        // SHA-256("abc")
        assert_eq!(
            generate_fingerprint(b"abc"),
            "BA78 16BF 8F01 CFEA 4141 40DE 5DAE 2223 B003 61A3 9617 7A9C B410 FF61 F200 15AD"
        );
        assert_eq!(generate_short_fingerprint(b"abc"), "BA78 16BF 8F01 CFEA");
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let pair = generate_identity_key_pair(0).unwrap();
            let fp = generate_fingerprint(&pair.public_key);
            assert_eq!(fp, generate_fingerprint(&pair.public_key));
            assert!(generate_fingerprint(&pair.public_key).starts_with(&generate_short_fingerprint(&pair.public_key)));
            assert!(seen.insert(fp));
        }
    }

    #[test]
    fn verification_data_bundles_short_fingerprint() {
        let pair = generate_identity_key_pair(0).unwrap();
        let data = generate_verification_data(&pair.public_key, TAG).unwrap();
        assert_eq!(data.payload.kind, "parcel_e2e");
        assert_eq!(data.payload.version, 1);
        assert_eq!(data.payload.public_key, pair.public_key_b64());
        assert_eq!(data.payload.fingerprint, data.short_fingerprint);
        assert!(data.fingerprint.starts_with(&data.short_fingerprint));
        assert!(data.payload_json.contains(r#""type":"parcel_e2e""#));
    }

    #[test]
    fn own_payload_verifies() {
        let pair = generate_identity_key_pair(0).unwrap();
        let data = generate_verification_data(&pair.public_key, TAG).unwrap();
        let result = verify_qr_code(&data.payload_json, &pair.public_key_b64(), TAG);
        assert_eq!(result, VerificationResult::ok());
    }

    #[test]
    fn each_mutated_field_fails_with_its_reason() {
        let pair = generate_identity_key_pair(0).unwrap();
        let other = generate_identity_key_pair(0).unwrap();
        let expected = pair.public_key_b64();
        let data = generate_verification_data(&pair.public_key, TAG).unwrap();

        let mut wrong_type = data.payload.clone();
        wrong_type.kind = "other_e2e".into();
        let mut wrong_key = data.payload.clone();
        wrong_key.public_key = other.public_key_b64();
        let mut wrong_fp = data.payload.clone();
        wrong_fp.fingerprint = generate_short_fingerprint(&other.public_key);
        let mut wrong_version = data.payload.clone();
        wrong_version.version = 2;

        let check = |payload: &VerificationPayload| {
            let json = encode_verification_payload(payload).unwrap();
            verify_qr_code(&json, &expected, TAG)
        };

        let result = check(&wrong_type);
        assert!(!result.valid);
        assert!(matches!(result.error, Some(VerificationFailure::WrongType { .. })));

        let result = check(&wrong_key);
        assert!(!result.valid);
        assert_eq!(result.error, Some(VerificationFailure::PublicKeyMismatch));

        let result = check(&wrong_fp);
        assert!(!result.valid);
        assert_eq!(result.error, Some(VerificationFailure::FingerprintMismatch));

        let result = check(&wrong_version);
        assert!(!result.valid);
        assert_eq!(result.error, Some(VerificationFailure::UnsupportedVersion(2)));
    }

    #[test]
    fn unparseable_payloads_do_not_panic() {
        let expected = generate_identity_key_pair(0).unwrap().public_key_b64();
        for junk in ["", "not json", "{}", "[1,2,3]", r#"{"type":"parcel_e2e"}"#] {
            let result = verify_qr_code(junk, &expected, TAG);
            assert!(!result.valid);
            assert!(matches!(result.error, Some(VerificationFailure::Malformed(_))));
        }
    }

    #[test]
    fn app_tag_is_part_of_the_type() {
        let pair = generate_identity_key_pair(0).unwrap();
        let data = generate_verification_data(&pair.public_key, "other_").unwrap();
        let result = verify_qr_code(&data.payload_json, &pair.public_key_b64(), TAG);
        assert!(matches!(result.error, Some(VerificationFailure::WrongType { .. })));
    }

    #[test]
    fn failure_converts_to_crypto_error() {
        let err: CryptoError = VerificationFailure::PublicKeyMismatch.into();
        assert!(matches!(err, CryptoError::MalformedVerificationPayload(_)));
    }
}
