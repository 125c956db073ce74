use std::sync::Arc;

use parcel_protocol::EncryptedRecord;
use tracing::{info, warn};

use crate::backup::BackupManager;
use crate::cipher::MessageCipher;
use crate::clock::Clock;
use crate::config::CryptoConfig;
use crate::error::CryptoError;
use crate::identity::{IdentityKeyManager, IdentityKeyPair};
use crate::session::SessionManager;
use crate::stores::{KeyRepository, SessionRepository};
use crate::verification::{generate_verification_data, verify_qr_code, VerificationData, VerificationResult};

/// All components wired over one pair of repositories.
///
/// The `*_as_active` helpers use the stored active key pair so callers do not
/// have to carry private key bytes around.
pub struct Engine {
    keys: Arc<dyn KeyRepository>,
    sessions: Arc<dyn SessionRepository>,
    config: CryptoConfig,
    identity: Arc<IdentityKeyManager>,
    session_manager: Arc<SessionManager>,
    cipher: MessageCipher,
    backup: BackupManager,
}

impl Engine {
    pub fn new(
        keys: Arc<dyn KeyRepository>,
        sessions: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
        config: CryptoConfig,
    ) -> Self {
        let identity = Arc::new(IdentityKeyManager::new(
            keys.clone(),
            sessions.clone(),
            clock.clone(),
        ));
        let session_manager = Arc::new(SessionManager::new(
            sessions.clone(),
            clock,
            config.session_ttl(),
            config.rotation_threshold,
        ));
        let cipher = MessageCipher::new(session_manager.clone());
        let backup = BackupManager::new(identity.clone(), config.pbkdf2_iterations);

        Self {
            keys,
            sessions,
            config,
            identity,
            session_manager,
            cipher,
            backup,
        }
    }

    /// Open both repositories and make sure an active key pair exists.
    pub async fn start(&self) -> Result<IdentityKeyPair, CryptoError> {
        self.keys.open().await?;
        self.sessions.open().await?;
        let pair = self.identity.initialize_identity_keys().await?;
        info!(key_id = %pair.id, "encryption engine ready");
        Ok(pair)
    }

    pub async fn shutdown(&self) -> Result<(), CryptoError> {
        self.sessions.close().await?;
        self.keys.close().await?;
        Ok(())
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<IdentityKeyManager> {
        &self.identity
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    pub fn cipher(&self) -> &MessageCipher {
        &self.cipher
    }

    pub fn backup(&self) -> &BackupManager {
        &self.backup
    }

    pub async fn encrypt_as_active(
        &self,
        plaintext: &str,
        peer_public_key: &[u8],
        peer_id: &str,
    ) -> Result<EncryptedRecord, CryptoError> {
        let me = self.identity.require_active().await?;
        let record = self
            .cipher
            .try_encrypt_message(plaintext, &me.private_key, &me.public_key, peer_public_key, peer_id)
            .await?;
        // The counter has already advanced, so the record must reach the caller.
        if let Err(e) = self.identity.touch_active().await {
            warn!(peer_id, error = %e, "failed to stamp identity key usage");
        }
        Ok(record)
    }

    pub async fn decrypt_as_active(
        &self,
        record: &EncryptedRecord,
        sender_id: &str,
    ) -> Result<String, CryptoError> {
        let me = self.identity.require_active().await?;
        self.cipher.decrypt_record(record, &me.private_key, sender_id).await
    }

    /// Fingerprints and QR payload for the active public key.
    pub async fn own_verification_data(&self) -> Result<VerificationData, CryptoError> {
        let me = self.identity.require_active().await?;
        generate_verification_data(&me.public_key, &self.config.app_tag)
    }

    pub fn verify_qr_code(&self, payload: &str, expected_public_key: &str) -> VerificationResult {
        verify_qr_code(payload, expected_public_key, &self.config.app_tag)
    }
}
