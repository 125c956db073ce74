//! Location fixes sent through the message cipher.

use parcel_protocol::codec::{decode_coordinates, encode_coordinates};
use parcel_protocol::{Coordinates, EncryptedRecord};
use tracing::debug;

use crate::cipher::MessageCipher;
use crate::error::CryptoError;

/// A stored location update as the caller has it: maybe an encrypted record,
/// maybe a legacy plaintext fix, or both.
#[derive(Debug, Clone)]
pub struct LocationEnvelope {
    pub record: Option<EncryptedRecord>,
    pub sender_id: String,
    pub fallback: Option<Coordinates>,
}

/// One decoded entry from [`decrypt_locations`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocationReading {
    pub coordinates: Option<Coordinates>,
    /// `false` when the coordinates came from the plaintext fallback.
    pub encrypted: bool,
}

/// Encrypt a fix for `peer_id`. `None` on failure, like `encrypt_message`.
pub async fn encrypt_location(
    cipher: &MessageCipher,
    coordinates: &Coordinates,
    my_private_key: &[u8],
    my_public_key: &[u8],
    peer_public_key: &[u8],
    peer_id: &str,
) -> Option<EncryptedRecord> {
    let text = match encode_coordinates(coordinates) {
        Ok(text) => text,
        Err(e) => {
            debug!(peer_id, error = %e, "coordinates not encodable");
            return None;
        }
    };
    cipher
        .encrypt_message(&text, my_private_key, my_public_key, peer_public_key, peer_id)
        .await
}

pub async fn decrypt_location(
    cipher: &MessageCipher,
    record: &EncryptedRecord,
    my_private_key: &[u8],
    sender_id: &str,
) -> Result<Coordinates, CryptoError> {
    let text = cipher.decrypt_record(record, my_private_key, sender_id).await?;
    decode_coordinates(&text).map_err(|_| CryptoError::Decryption)
}

/// Decrypt a run of location updates, falling back to each entry's plaintext
/// fix when its record is missing or undecryptable.
pub async fn decrypt_locations(
    cipher: &MessageCipher,
    envelopes: &[LocationEnvelope],
    my_private_key: &[u8],
) -> Vec<LocationReading> {
    let mut out = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let decrypted = match &envelope.record {
            Some(record) => {
                match decrypt_location(cipher, record, my_private_key, &envelope.sender_id).await {
                    Ok(coordinates) => Some(coordinates),
                    Err(e) => {
                        debug!(sender_id = %envelope.sender_id, error = %e, "location undecryptable");
                        None
                    }
                }
            }
            None => None,
        };

        out.push(match decrypted {
            Some(coordinates) => LocationReading {
                coordinates: Some(coordinates),
                encrypted: true,
            },
            None => LocationReading {
                coordinates: envelope.fallback,
                encrypted: false,
            },
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{generate_identity_key_pair, IdentityKeyPair};
    use crate::session::SessionManager;
    use crate::stores::{MemorySessionRepository, SessionRepository};

    async fn cipher() -> MessageCipher {
        let repo = Arc::new(MemorySessionRepository::new());
        repo.open().await.unwrap();
        let sessions = SessionManager::new(
            repo,
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(3600),
            1_000,
        );
        MessageCipher::new(Arc::new(sessions))
    }

    fn fix(lat: f64) -> Coordinates {
        Coordinates {
            lat,
            lng: 13.405,
            accuracy: Some(8.0),
            recorded_at: 1_700_000_000_000,
        }
    }

    async fn send(
        cipher: &MessageCipher,
        from: &IdentityKeyPair,
        to: &IdentityKeyPair,
        coordinates: &Coordinates,
    ) -> EncryptedRecord {
        encrypt_location(
            cipher,
            coordinates,
            &from.private_key,
            &from.public_key,
            &to.public_key,
            "courier",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn location_round_trip() {
        let (sender_cipher, receiver_cipher) = (cipher().await, cipher().await);
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();

        let record = send(&sender_cipher, &alice, &bob, &fix(52.52)).await;
        let decoded = decrypt_location(&receiver_cipher, &record, &bob.private_key, "alice")
            .await
            .unwrap();
        assert_eq!(decoded, fix(52.52));
    }

    #[tokio::test]
    async fn batch_falls_back_per_entry() {
        let (sender_cipher, receiver_cipher) = (cipher().await, cipher().await);
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();

        let good = send(&sender_cipher, &alice, &bob, &fix(1.0)).await;
        let mut bad = send(&sender_cipher, &alice, &bob, &fix(2.0)).await;
        bad.message_index += 7;

        let envelopes = vec![
            LocationEnvelope {
                record: Some(good),
                sender_id: "alice".into(),
                fallback: None,
            },
            LocationEnvelope {
                record: Some(bad),
                sender_id: "alice".into(),
                fallback: Some(fix(9.0)),
            },
            LocationEnvelope {
                record: None,
                sender_id: "alice".into(),
                fallback: Some(fix(3.0)),
            },
            LocationEnvelope {
                record: None,
                sender_id: "alice".into(),
                fallback: None,
            },
        ];

        let readings = decrypt_locations(&receiver_cipher, &envelopes, &bob.private_key).await;
        assert_eq!(
            readings,
            vec![
                LocationReading { coordinates: Some(fix(1.0)), encrypted: true },
                LocationReading { coordinates: Some(fix(9.0)), encrypted: false },
                LocationReading { coordinates: Some(fix(3.0)), encrypted: false },
                LocationReading { coordinates: None, encrypted: false },
            ]
        );
    }

    #[tokio::test]
    async fn non_location_plaintext_is_rejected() {
        let (sender_cipher, receiver_cipher) = (cipher().await, cipher().await);
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();

        let record = sender_cipher
            .try_encrypt_message("just text", &alice.private_key, &alice.public_key, &bob.public_key, "bob")
            .await
            .unwrap();
        assert!(matches!(
            decrypt_location(&receiver_cipher, &record, &bob.private_key, "alice").await,
            Err(CryptoError::Decryption)
        ));
    }
}
