//! Per-message encryption.
//!
//! Every message gets its own AES-256-GCM key, derived with HKDF-SHA256 from
//! the session's shared secret, the message index, and the sender's public
//! key. The sender's counter advances after each successful encryption; the
//! receiver derives at whatever index the record carries.

use std::sync::Arc;

use parcel_protocol::codec::decode_b64;
use parcel_protocol::EncryptedRecord;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::aead::{open, random_nonce, seal, KEY_LEN};
use crate::error::CryptoError;
use crate::kdf::hkdf_expand;
use crate::session::SessionManager;

/// HKDF info prefix for message keys.
const MESSAGE_KEY_LABEL: &[u8] = b"parcel-msg-v1";

/// Shown in place of a message that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Derive the single-use key for `message_index` sent by `sender_public_key`.
///
/// info = label || index (u64 BE) || sender public key; salt is empty.
pub fn derive_message_key(
    shared_secret: &[u8],
    message_index: u64,
    sender_public_key: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut info = Vec::with_capacity(MESSAGE_KEY_LABEL.len() + 8 + sender_public_key.len());
    info.extend_from_slice(MESSAGE_KEY_LABEL);
    info.extend_from_slice(&message_index.to_be_bytes());
    info.extend_from_slice(sender_public_key);
    hkdf_expand(shared_secret, None, &info)
}

/// AAD binding the wire fields that are not themselves encrypted.
fn message_aad(message_index: u64, sender_public_key: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + sender_public_key.len());
    aad.extend_from_slice(&message_index.to_be_bytes());
    aad.extend_from_slice(sender_public_key);
    aad
}

/// Result of decrypting one record in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptedMessage {
    Plaintext(String),
    Undecryptable,
}

impl DecryptedMessage {
    /// Text to render: the plaintext, or the placeholder.
    pub fn text(&self) -> &str {
        match self {
            Self::Plaintext(text) => text,
            Self::Undecryptable => UNDECRYPTABLE_PLACEHOLDER,
        }
    }
}

pub struct MessageCipher {
    sessions: Arc<SessionManager>,
}

impl MessageCipher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Encrypt `plaintext` for `peer_id`, advancing the session counter.
    ///
    /// The peer lock is held from session lookup to counter write-back, so
    /// concurrent sends to one peer never share an index.
    pub async fn try_encrypt_message(
        &self,
        plaintext: &str,
        my_private_key: &[u8],
        my_public_key: &[u8],
        peer_public_key: &[u8],
        peer_id: &str,
    ) -> Result<EncryptedRecord, CryptoError> {
        let lock = self.sessions.peer_lock(peer_id);
        let _guard = lock.lock().await;

        let session = self
            .sessions
            .get_or_create_locked(my_private_key, peer_public_key, peer_id)
            .await?;
        let index = session.message_index;

        let key = derive_message_key(session.shared_secret.as_slice(), index, my_public_key)?;
        let iv = random_nonce()?;
        let ciphertext = seal(
            &key,
            &iv,
            &message_aad(index, my_public_key),
            plaintext.as_bytes(),
        )?;

        let next = index.checked_add(1).ok_or(CryptoError::Encryption)?;
        self.sessions.update_session_index(&session.id, next).await?;
        if next == self.sessions.rotation_threshold() {
            warn!(
                peer_id,
                session_id = %session.id,
                message_index = next,
                "session reached rotation threshold, identity keys should be rotated"
            );
        }

        debug!(peer_id, message_index = index, "message encrypted");
        Ok(EncryptedRecord::new(&ciphertext, &iv, my_public_key, index))
    }

    /// Like [`try_encrypt_message`](Self::try_encrypt_message), but reports
    /// failure as `None` so a chat view can fall back instead of erroring.
    pub async fn encrypt_message(
        &self,
        plaintext: &str,
        my_private_key: &[u8],
        my_public_key: &[u8],
        peer_public_key: &[u8],
        peer_id: &str,
    ) -> Option<EncryptedRecord> {
        match self
            .try_encrypt_message(plaintext, my_private_key, my_public_key, peer_public_key, peer_id)
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(peer_id, error = %e, "message encryption failed");
                None
            }
        }
    }

    /// Decrypt one message from its wire fields.
    ///
    /// The key is derived at the index carried on the wire, not a local
    /// counter. Any failure to authenticate is `CryptoError::Decryption`.
    pub async fn decrypt_message(
        &self,
        ciphertext: &str,
        iv: &str,
        sender_public_key: &str,
        message_index: u64,
        my_private_key: &[u8],
        sender_id: &str,
    ) -> Result<String, CryptoError> {
        let sender_public_key = decode_b64("senderPublicKey", sender_public_key)
            .map_err(|e| CryptoError::KeyAgreement(e.to_string()))?;
        let ciphertext = decode_b64("ciphertext", ciphertext).map_err(|_| CryptoError::Decryption)?;
        let iv: [u8; 12] = decode_b64("iv", iv)
            .ok()
            .and_then(|raw| raw.as_slice().try_into().ok())
            .ok_or(CryptoError::Decryption)?;

        let secret = self
            .sessions
            .decryption_secret(my_private_key, &sender_public_key, sender_id)
            .await?;
        let key = derive_message_key(secret.as_slice(), message_index, &sender_public_key)?;
        let plaintext = open(
            &key,
            &iv,
            &message_aad(message_index, &sender_public_key),
            &ciphertext,
        )?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Decryption)
    }

    pub async fn decrypt_record(
        &self,
        record: &EncryptedRecord,
        my_private_key: &[u8],
        sender_id: &str,
    ) -> Result<String, CryptoError> {
        self.decrypt_message(
            &record.ciphertext,
            &record.iv,
            &record.sender_public_key,
            record.message_index,
            my_private_key,
            sender_id,
        )
        .await
    }

    /// Decrypt a conversation, one item at a time.
    ///
    /// `resolve` yields the record and sender id for an item, or `None` when
    /// the item cannot be attributed. A failing item becomes `Undecryptable`
    /// and the rest carry on. Output order follows `items`.
    pub async fn decrypt_batch<'a, T, F>(
        &self,
        items: &'a [T],
        my_private_key: &[u8],
        resolve: F,
    ) -> Vec<DecryptedMessage>
    where
        F: Fn(&'a T) -> Option<(&'a EncryptedRecord, &'a str)>,
    {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let Some((record, sender_id)) = resolve(item) else {
                out.push(DecryptedMessage::Undecryptable);
                continue;
            };
            match self.decrypt_record(record, my_private_key, sender_id).await {
                Ok(text) => out.push(DecryptedMessage::Plaintext(text)),
                Err(e) => {
                    debug!(sender_id, message_index = record.message_index, error = %e, "batch item undecryptable");
                    out.push(DecryptedMessage::Undecryptable);
                }
            }
        }
        out
    }
}
