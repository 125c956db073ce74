//! Identity key generation and lifecycle.
//!
//! Each device holds one active long-term X25519 key pair, generated on first
//! use. Older pairs are deactivated rather than deleted so history survives
//! rotation and backup restores.

use std::fmt;
use std::sync::Arc;

use parcel_protocol::codec::encode_b64;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::aead::random_bytes;
use crate::clock::Clock;
use crate::error::CryptoError;
use crate::kdf::sha256;
use crate::stores::{KeyRepository, SessionRepository};

/// Exported X25519 key length, public and private.
pub const KEY_LEN: usize = 32;

/// Bytes of the public key hash used for the key id.
const KEY_ID_LEN: usize = 8;

/// A device's long-term key pair as stored locally.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// Hex of the first 8 bytes of SHA-256(public key).
    pub id: String,
    /// 32-byte X25519 public key.
    pub public_key: Vec<u8>,
    /// 32-byte X25519 private key.
    pub private_key: Zeroizing<Vec<u8>>,
    /// Unix millis.
    pub created_at: u64,
    pub is_active: bool,
    pub device_label: Option<String>,
    pub last_used_at: Option<u64>,
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("id", &self.id)
            .field("public_key", &encode_b64(&self.public_key))
            .field("private_key", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("is_active", &self.is_active)
            .field("device_label", &self.device_label)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl IdentityKeyPair {
    /// Public key in the base64 form carried on the wire.
    pub fn public_key_b64(&self) -> String {
        encode_b64(&self.public_key)
    }
}

/// Stable short id for a public key.
pub fn key_id(public_key: &[u8]) -> String {
    sha256(public_key)[..KEY_ID_LEN]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Generate a fresh key pair. Touches nothing but the RNG.
pub fn generate_identity_key_pair(created_at: u64) -> Result<IdentityKeyPair, CryptoError> {
    let private_bytes = Zeroizing::new(random_bytes::<KEY_LEN>()?);
    let secret = StaticSecret::from(*private_bytes);
    let public = PublicKey::from(&secret);
    let public_key = public.as_bytes().to_vec();

    Ok(IdentityKeyPair {
        id: key_id(&public_key),
        public_key,
        private_key: Zeroizing::new(secret.to_bytes().to_vec()),
        created_at,
        is_active: true,
        device_label: None,
        last_used_at: None,
    })
}

/// Parse an exported private key.
pub fn secret_from_bytes(bytes: &[u8]) -> Result<StaticSecret, CryptoError> {
    let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "private key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(StaticSecret::from(raw))
}

/// Parse a peer's exported public key.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
        CryptoError::KeyAgreement(format!(
            "public key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(raw))
}

/// Owns the active identity key pair.
///
/// Every path that changes which pair is active goes through `writer`, so
/// readers never observe two active pairs.
pub struct IdentityKeyManager {
    keys: Arc<dyn KeyRepository>,
    sessions: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    writer: Mutex<()>,
}

impl IdentityKeyManager {
    pub fn new(
        keys: Arc<dyn KeyRepository>,
        sessions: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys,
            sessions,
            clock,
            writer: Mutex::new(()),
        }
    }

    /// Purge expired sessions, then return the active pair, creating one if
    /// none exists.
    pub async fn initialize_identity_keys(&self) -> Result<IdentityKeyPair, CryptoError> {
        let now = self.clock.now_millis();
        let swept = self.sessions.delete_expired(now).await?;
        if swept > 0 {
            debug!(swept, "expired sessions removed");
        }

        let _guard = self.writer.lock().await;
        if let Some(active) = self.keys.get_active().await? {
            return Ok(active);
        }

        let pair = generate_identity_key_pair(now)?;
        self.keys.replace_active(&pair).await?;
        info!(key_id = %pair.id, "generated identity key pair");
        Ok(pair)
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub async fn key(&self, id: &str) -> Result<Option<IdentityKeyPair>, CryptoError> {
        Ok(self.keys.get(id).await?)
    }

    pub async fn active_key_pair(&self) -> Result<Option<IdentityKeyPair>, CryptoError> {
        Ok(self.keys.get_active().await?)
    }

    /// The active pair, or `KeyUnavailable`.
    pub async fn require_active(&self) -> Result<IdentityKeyPair, CryptoError> {
        self.keys
            .get_active()
            .await?
            .ok_or(CryptoError::KeyUnavailable)
    }

    /// Replace the active pair with a freshly generated one.
    ///
    /// Sessions derived from the old key are dropped, so the next message to
    /// each peer runs a new key agreement.
    pub async fn rotate_identity_keys(&self) -> Result<IdentityKeyPair, CryptoError> {
        let pair = generate_identity_key_pair(self.clock.now_millis())?;
        self.install(&pair).await?;
        info!(key_id = %pair.id, "identity key pair rotated");
        Ok(pair)
    }

    /// Make `pair` the only active pair and forget sessions bound to the
    /// previous one.
    pub(crate) async fn install(&self, pair: &IdentityKeyPair) -> Result<IdentityKeyPair, CryptoError> {
        let _guard = self.writer.lock().await;
        let mut active = pair.clone();
        active.is_active = true;
        self.keys.replace_active(&active).await?;
        let cleared = self.sessions.clear().await?;
        debug!(key_id = %active.id, cleared, "installed active identity key");
        Ok(active)
    }

    /// Metadata writes rewrite the whole record, so they take `writer` too;
    /// otherwise a stale `is_active` could land after a rotation.
    pub async fn set_device_label(&self, id: &str, label: Option<String>) -> Result<(), CryptoError> {
        let _guard = self.writer.lock().await;
        let mut pair = self
            .keys
            .get(id)
            .await?
            .ok_or(CryptoError::KeyUnavailable)?;
        pair.device_label = label;
        self.keys.update(&pair).await?;
        Ok(())
    }

    /// Stamp the active pair's `last_used_at` with the current time.
    pub async fn touch_active(&self) -> Result<(), CryptoError> {
        let _guard = self.writer.lock().await;
        let mut pair = self.require_active().await?;
        pair.last_used_at = Some(self.clock.now_millis());
        self.keys.update(&pair).await?;
        Ok(())
    }

    /// Every stored pair, oldest first.
    pub async fn key_history(&self) -> Result<Vec<IdentityKeyPair>, CryptoError> {
        Ok(self.keys.list().await?)
    }
}
