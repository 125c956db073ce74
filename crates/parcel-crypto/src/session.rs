//! Per-peer sessions: the X25519 shared secret with one peer plus the
//! sender-side message counter.
//!
//! A session is derived lazily on first use, looked up by peer id on every
//! call, and treated as absent once `expires_at` has passed. The shared
//! secret depends only on the two long-term keys, so a session derived after
//! expiry carries the same secret with the counter back at 0.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::CryptoError;
use crate::identity::{public_key_from_bytes, secret_from_bytes, KEY_LEN};
use crate::stores::SessionRepository;

#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub peer_id: String,
    /// Peer public key the secret was agreed with.
    #[serde(default)]
    pub peer_public_key: Vec<u8>,
    pub shared_secret: Zeroizing<[u8; KEY_LEN]>,
    /// Index the next outgoing message will use.
    pub message_index: u64,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis.
    pub expires_at: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("shared_secret", &"<redacted>")
            .field("message_index", &self.message_index)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Session {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Whether this session has sent enough messages that the identity keys
    /// should be rotated.
    pub fn rotation_due(&self, threshold: u64) -> bool {
        self.message_index >= threshold
    }
}

/// X25519 agreement between our private key and a peer public key.
///
/// Symmetric: both sides arrive at the same 32 bytes. Low-order peer keys,
/// which would force an all-zero secret, are refused.
pub fn agree(
    my_private_key: &[u8],
    peer_public_key: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let secret = secret_from_bytes(my_private_key)?;
    let public = public_key_from_bytes(peer_public_key)?;
    let shared = secret.diffie_hellman(&public);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement(
            "peer public key is a low-order point".into(),
        ));
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

pub struct SessionManager {
    sessions: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    rotation_threshold: u64,
    /// peer id -> lock held across read/create/write-back for that peer
    peer_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        rotation_threshold: u64,
    ) -> Self {
        Self {
            sessions,
            clock,
            ttl,
            rotation_threshold,
            peer_locks: DashMap::new(),
        }
    }

    pub fn rotation_threshold(&self) -> u64 {
        self.rotation_threshold
    }

    pub(crate) fn peer_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        self.peer_locks
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the live session for `peer_id`, deriving a new one when absent,
    /// expired, or agreed with a different peer key.
    pub async fn get_or_create_session(
        &self,
        my_private_key: &[u8],
        peer_public_key: &[u8],
        peer_id: &str,
    ) -> Result<Session, CryptoError> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        self.get_or_create_locked(my_private_key, peer_public_key, peer_id)
            .await
    }

    /// Caller must hold `peer_lock(peer_id)`.
    pub(crate) async fn get_or_create_locked(
        &self,
        my_private_key: &[u8],
        peer_public_key: &[u8],
        peer_id: &str,
    ) -> Result<Session, CryptoError> {
        let now = self.clock.now_millis();
        if let Some(existing) = self.lookup_live(peer_id, now).await? {
            if existing.peer_public_key == peer_public_key {
                return Ok(existing);
            }
            debug!(peer_id, session_id = %existing.id, "peer key changed, replacing session");
            self.sessions.delete(&existing.id).await?;
        }
        self.create_locked(my_private_key, peer_public_key, peer_id, now)
            .await
    }

    /// Shared secret for decrypting a message from `sender_id`.
    ///
    /// Creates the session when none exists. A live session agreed with a
    /// different key (e.g. history from before the sender rotated) is left
    /// untouched and the secret is derived on the spot.
    pub async fn decryption_secret(
        &self,
        my_private_key: &[u8],
        sender_public_key: &[u8],
        sender_id: &str,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        let lock = self.peer_lock(sender_id);
        let _guard = lock.lock().await;

        let now = self.clock.now_millis();
        match self.lookup_live(sender_id, now).await? {
            Some(session) if session.peer_public_key == sender_public_key => {
                Ok(session.shared_secret)
            }
            Some(_) => agree(my_private_key, sender_public_key),
            None => Ok(self
                .create_locked(my_private_key, sender_public_key, sender_id, now)
                .await?
                .shared_secret),
        }
    }

    /// Persist a new counter value. `false` if the session is already gone.
    pub async fn update_session_index(
        &self,
        session_id: &str,
        new_index: u64,
    ) -> Result<bool, CryptoError> {
        let updated = self.sessions.update_index(session_id, new_index).await?;
        if !updated {
            debug!(session_id, "session vanished before counter update");
        }
        Ok(updated)
    }

    pub async fn delete_expired_sessions(&self) -> Result<usize, CryptoError> {
        let now = self.clock.now_millis();
        let removed = self.sessions.delete_expired(now).await?;
        // Drop locks nobody is holding or waiting on.
        self.peer_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(removed)
    }

    /// Peers whose live session has reached the rotation threshold.
    pub async fn sessions_due_for_rotation(&self) -> Result<Vec<String>, CryptoError> {
        let now = self.clock.now_millis();
        let mut peers: Vec<String> = self
            .sessions
            .list()
            .await?
            .into_iter()
            .filter(|s| !s.is_expired(now) && s.rotation_due(self.rotation_threshold))
            .map(|s| s.peer_id)
            .collect();
        peers.sort();
        Ok(peers)
    }

    /// Stored session for `peer_id` if it is still live; an expired one is
    /// deleted on the way.
    async fn lookup_live(&self, peer_id: &str, now: u64) -> Result<Option<Session>, CryptoError> {
        match self.sessions.get_by_peer(peer_id).await? {
            Some(session) if session.is_expired(now) => {
                debug!(peer_id, session_id = %session.id, "session expired");
                self.sessions.delete(&session.id).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn create_locked(
        &self,
        my_private_key: &[u8],
        peer_public_key: &[u8],
        peer_id: &str,
        now: u64,
    ) -> Result<Session, CryptoError> {
        let shared_secret = agree(my_private_key, peer_public_key)?;
        let candidate = Session {
            id: Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            peer_public_key: peer_public_key.to_vec(),
            shared_secret,
            message_index: 0,
            created_at: now,
            expires_at: now.saturating_add(self.ttl.as_millis() as u64),
        };

        let session = self.sessions.insert_if_absent(&candidate, now).await?;
        if session.id == candidate.id {
            debug!(peer_id, session_id = %session.id, "session created");
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::generate_identity_key_pair;
    use crate::stores::MemorySessionRepository;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    async fn manager() -> (SessionManager, Arc<ManualClock>) {
        let repo = Arc::new(MemorySessionRepository::new());
        repo.open().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        (SessionManager::new(repo, clock.clone(), DAY, 3), clock)
    }

    #[test]
    fn key_agreement_is_symmetric() {
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();
        let ab = agree(&alice.private_key, &bob.public_key).unwrap();
        let ba = agree(&bob.private_key, &alice.public_key).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn low_order_peer_key_rejected() {
        let alice = generate_identity_key_pair(0).unwrap();
        assert!(matches!(
            agree(&alice.private_key, &[0u8; 32]),
            Err(CryptoError::KeyAgreement(_))
        ));
    }

    #[test]
    fn truncated_peer_key_rejected() {
        let alice = generate_identity_key_pair(0).unwrap();
        assert!(matches!(
            agree(&alice.private_key, &[5u8; 16]),
            Err(CryptoError::KeyAgreement(_))
        ));
    }

    #[tokio::test]
    async fn session_is_reused_until_expiry() {
        let (manager, clock) = manager().await;
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();

        let first = manager
            .get_or_create_session(&alice.private_key, &bob.public_key, "bob")
            .await
            .unwrap();
        assert_eq!(first.message_index, 0);
        assert_eq!(first.expires_at, 1_000_000 + DAY.as_millis() as u64);

        manager.update_session_index(&first.id, 1).await.unwrap();
        let second = manager
            .get_or_create_session(&alice.private_key, &bob.public_key, "bob")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.message_index, 1);
        assert_eq!(*second.shared_secret, *first.shared_secret);

        clock.advance(DAY);
        let third = manager
            .get_or_create_session(&alice.private_key, &bob.public_key, "bob")
            .await
            .unwrap();
        assert_ne!(third.id, first.id);
        assert_eq!(third.message_index, 0);
        assert_eq!(*third.shared_secret, *first.shared_secret);
        assert!(third.created_at > first.created_at);
    }

    #[tokio::test]
    async fn peer_key_change_replaces_session() {
        let (manager, _) = manager().await;
        let alice = generate_identity_key_pair(0).unwrap();
        let bob_old = generate_identity_key_pair(0).unwrap();
        let bob_new = generate_identity_key_pair(0).unwrap();

        let old = manager
            .get_or_create_session(&alice.private_key, &bob_old.public_key, "bob")
            .await
            .unwrap();
        let new = manager
            .get_or_create_session(&alice.private_key, &bob_new.public_key, "bob")
            .await
            .unwrap();
        assert_ne!(old.id, new.id);
        assert_ne!(*old.shared_secret, *new.shared_secret);
    }

    #[tokio::test]
    async fn stale_sender_key_does_not_touch_stored_session() {
        let (manager, _) = manager().await;
        let alice = generate_identity_key_pair(0).unwrap();
        let bob_old = generate_identity_key_pair(0).unwrap();
        let bob_new = generate_identity_key_pair(0).unwrap();

        let current = manager
            .get_or_create_session(&alice.private_key, &bob_new.public_key, "bob")
            .await
            .unwrap();
        manager.update_session_index(&current.id, 2).await.unwrap();

        let secret = manager
            .decryption_secret(&alice.private_key, &bob_old.public_key, "bob")
            .await
            .unwrap();
        assert_eq!(*secret, *agree(&alice.private_key, &bob_old.public_key).unwrap());

        let still = manager
            .get_or_create_session(&alice.private_key, &bob_new.public_key, "bob")
            .await
            .unwrap();
        assert_eq!(still.id, current.id);
        assert_eq!(still.message_index, 2);
    }

    #[tokio::test]
    async fn update_index_after_expiry_sweep_is_noop() {
        let (manager, clock) = manager().await;
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();
        let session = manager
            .get_or_create_session(&alice.private_key, &bob.public_key, "bob")
            .await
            .unwrap();

        clock.advance(DAY + Duration::from_secs(1));
        assert_eq!(manager.delete_expired_sessions().await.unwrap(), 1);
        assert!(!manager.update_session_index(&session.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn rotation_report_lists_busy_peers() {
        let (manager, _) = manager().await;
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();
        let carol = generate_identity_key_pair(0).unwrap();

        let to_bob = manager
            .get_or_create_session(&alice.private_key, &bob.public_key, "bob")
            .await
            .unwrap();
        manager
            .get_or_create_session(&alice.private_key, &carol.public_key, "carol")
            .await
            .unwrap();
        manager.update_session_index(&to_bob.id, 3).await.unwrap();

        assert_eq!(manager.sessions_due_for_rotation().await.unwrap(), vec!["bob"]);
    }

    #[test]
    fn debug_redacts_secret() {
        let session = Session {
            id: "s".into(),
            peer_id: "p".into(),
            peer_public_key: vec![],
            shared_secret: Zeroizing::new([0xAB; KEY_LEN]),
            message_index: 0,
            created_at: 0,
            expires_at: 0,
        };
        assert!(format!("{session:?}").contains("<redacted>"));
    }

    #[tokio::test]
    async fn sweep_prunes_idle_peer_locks() {
        let (manager, _) = manager().await;
        let alice = generate_identity_key_pair(0).unwrap();
        let bob = generate_identity_key_pair(0).unwrap();
        manager
            .get_or_create_session(&alice.private_key, &bob.public_key, "bob")
            .await
            .unwrap();
        assert_eq!(manager.peer_locks.len(), 1);

        let held = manager.peer_lock("carol");
        manager.delete_expired_sessions().await.unwrap();
        assert_eq!(manager.peer_locks.len(), 1);
        assert!(manager.peer_locks.contains_key("carol"));

        drop(held);
        manager.delete_expired_sessions().await.unwrap();
        assert!(manager.peer_locks.is_empty());
    }
}
