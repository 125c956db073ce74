//! Password-protected export and restore of the active identity key pair.
//!
//! Blob: `base64(salt[16] || iv[12] || AES-256-GCM(json))`, wrapping key from
//! PBKDF2-HMAC-SHA256 over the password. The JSON carries the key id and both
//! keys in base64.

use std::sync::Arc;

use parcel_protocol::codec::{decode_b64, decode_backup_blob, encode_b64, encode_backup_blob};
use parcel_protocol::types::{BACKUP_IV_LEN, BACKUP_SALT_LEN};
use parcel_protocol::BackupBlob;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::aead::{open, random_bytes, seal};
use crate::error::CryptoError;
use crate::identity::{key_id, secret_from_bytes, IdentityKeyManager, IdentityKeyPair, KEY_LEN};
use crate::kdf::derive_password_key;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupContents {
    id: String,
    public_key: String,
    private_key: Zeroizing<String>,
}

pub struct BackupManager {
    identity: Arc<IdentityKeyManager>,
    pbkdf2_iterations: u32,
}

impl BackupManager {
    pub fn new(identity: Arc<IdentityKeyManager>, pbkdf2_iterations: u32) -> Self {
        Self {
            identity,
            pbkdf2_iterations,
        }
    }

    /// Wrap the active key pair under `password`. Stored keys are untouched.
    pub async fn export_keys_for_backup(&self, password: &str) -> Result<String, CryptoError> {
        let pair = self.identity.require_active().await?;

        let contents = BackupContents {
            id: pair.id.clone(),
            public_key: encode_b64(&pair.public_key),
            private_key: Zeroizing::new(encode_b64(&pair.private_key)),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&contents).map_err(|_| CryptoError::Encryption)?,
        );

        let salt = random_bytes::<BACKUP_SALT_LEN>()?;
        let iv = random_bytes::<BACKUP_IV_LEN>()?;
        let key = derive_password_key(password, &salt, self.pbkdf2_iterations)?;
        let ciphertext = seal(&key, &iv, &[], &plaintext)?;

        info!(key_id = %pair.id, "identity key pair exported for backup");
        Ok(encode_backup_blob(&BackupBlob {
            salt,
            iv,
            ciphertext,
        }))
    }

    /// Restore a backup and make its pair the only active one.
    ///
    /// The store is touched only after the blob has decrypted and the keys
    /// check out; every earlier failure is `BackupPasswordIncorrect`.
    pub async fn import_keys_from_backup(
        &self,
        backup_data: &str,
        password: &str,
    ) -> Result<IdentityKeyPair, CryptoError> {
        let recovered = self.unwrap_backup(backup_data, password).map_err(|e| {
            warn!(error = %e, "backup restore rejected");
            CryptoError::BackupPasswordIncorrect
        })?;

        let mut pair = match self.identity.key(&recovered.id).await? {
            Some(known) => known,
            None => IdentityKeyPair {
                id: recovered.id.clone(),
                public_key: Vec::new(),
                private_key: Zeroizing::new(Vec::new()),
                created_at: self.identity.now_millis(),
                is_active: true,
                device_label: None,
                last_used_at: None,
            },
        };
        pair.public_key = recovered.public_key;
        pair.private_key = recovered.private_key;

        let installed = self.identity.install(&pair).await?;
        info!(key_id = %installed.id, "identity key pair restored from backup");
        Ok(installed)
    }

    fn unwrap_backup(&self, backup_data: &str, password: &str) -> Result<Recovered, CryptoError> {
        let blob = decode_backup_blob(backup_data)?;
        let key = derive_password_key(password, &blob.salt, self.pbkdf2_iterations)?;
        let plaintext = open(&key, &blob.iv, &[], &blob.ciphertext)?;

        let contents: BackupContents = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::InvalidKey(format!("backup contents: {e}")))?;
        let public_key = decode_b64("publicKey", &contents.public_key)?;
        let private_key = Zeroizing::new(decode_b64("privateKey", &contents.private_key)?);

        let secret = secret_from_bytes(&private_key)?;
        if PublicKey::from(&secret).as_bytes().as_slice() != public_key.as_slice() {
            return Err(CryptoError::InvalidKey(
                "backup public key does not match private key".into(),
            ));
        }
        if public_key.len() != KEY_LEN || contents.id != key_id(&public_key) {
            return Err(CryptoError::InvalidKey("backup key id mismatch".into()));
        }

        Ok(Recovered {
            id: contents.id,
            public_key,
            private_key,
        })
    }
}

struct Recovered {
    id: String,
    public_key: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
}
