//! Repository traits for identity keys and sessions, plus in-memory
//! implementations.
//!
//! The tables here are plain serializable data; the in-memory repositories
//! wrap them in a lock, and the encrypted file store persists them via the
//! persistence module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::identity::IdentityKeyPair;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not open")]
    Closed,

    #[error("no identity key with id {0}")]
    NotFound(String),

    #[error("store file corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Long-term identity key pairs, keyed by id.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    async fn open(&self) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;

    /// Insert or overwrite a key pair by id.
    async fn create(&self, pair: &IdentityKeyPair) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<IdentityKeyPair>, StoreError>;
    async fn get_active(&self) -> Result<Option<IdentityKeyPair>, StoreError>;
    /// All pairs, oldest first.
    async fn list(&self) -> Result<Vec<IdentityKeyPair>, StoreError>;
    async fn deactivate_all(&self) -> Result<(), StoreError>;
    /// Overwrite an existing pair; `NotFound` if the id is unknown.
    async fn update(&self, pair: &IdentityKeyPair) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Deactivate every stored pair and store `pair` as the only active one,
    /// without a window where readers see zero or two active pairs.
    async fn replace_active(&self, pair: &IdentityKeyPair) -> Result<(), StoreError>;
}

/// Per-peer sessions, keyed by session id with a secondary index on peer id.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn open(&self) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;

    /// The stored session for a peer, expired or not.
    async fn get_by_peer(&self, peer_id: &str) -> Result<Option<Session>, StoreError>;
    /// Store a session, replacing any previous session for the same peer.
    async fn put(&self, session: &Session) -> Result<(), StoreError>;
    /// Store `session` unless the peer already has one that is live at `now`;
    /// returns whichever session is live afterwards.
    async fn insert_if_absent(&self, session: &Session, now: u64) -> Result<Session, StoreError>;
    /// Returns `false` (and does nothing) if the session no longer exists.
    async fn update_index(&self, session_id: &str, new_index: u64) -> Result<bool, StoreError>;
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
    /// Remove sessions whose expiry is at or before `now`; returns how many.
    async fn delete_expired(&self, now: u64) -> Result<usize, StoreError>;
    /// Remove every session; returns how many.
    async fn clear(&self) -> Result<usize, StoreError>;
    async fn list(&self) -> Result<Vec<Session>, StoreError>;
}

// ── Tables ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct KeyTable {
    /// id -> key pair
    pub keys: HashMap<String, IdentityKeyPair>,
}

impl KeyTable {
    pub fn upsert(&mut self, pair: &IdentityKeyPair) {
        self.keys.insert(pair.id.clone(), pair.clone());
    }

    pub fn get(&self, id: &str) -> Option<IdentityKeyPair> {
        self.keys.get(id).cloned()
    }

    /// Newest active pair; there should only ever be one.
    pub fn active(&self) -> Option<IdentityKeyPair> {
        self.keys
            .values()
            .filter(|pair| pair.is_active)
            .max_by_key(|pair| pair.created_at)
            .cloned()
    }

    pub fn list(&self) -> Vec<IdentityKeyPair> {
        let mut pairs: Vec<_> = self.keys.values().cloned().collect();
        pairs.sort_by_key(|pair| pair.created_at);
        pairs
    }

    pub fn deactivate_all(&mut self) {
        for pair in self.keys.values_mut() {
            pair.is_active = false;
        }
    }

    pub fn update(&mut self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        match self.keys.get_mut(&pair.id) {
            Some(existing) => {
                *existing = pair.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(pair.id.clone())),
        }
    }

    pub fn delete(&mut self, id: &str) {
        self.keys.remove(id);
    }

    pub fn replace_active(&mut self, pair: &IdentityKeyPair) {
        self.deactivate_all();
        let mut active = pair.clone();
        active.is_active = true;
        self.upsert(&active);
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SessionTable {
    /// session id -> session
    pub sessions: HashMap<String, Session>,
    /// peer id -> session id
    pub by_peer: HashMap<String, String>,
}

impl SessionTable {
    pub fn get_by_peer(&self, peer_id: &str) -> Option<Session> {
        self.by_peer
            .get(peer_id)
            .and_then(|id| self.sessions.get(id))
            .cloned()
    }

    pub fn put(&mut self, session: &Session) {
        if let Some(old_id) = self
            .by_peer
            .insert(session.peer_id.clone(), session.id.clone())
        {
            if old_id != session.id {
                self.sessions.remove(&old_id);
            }
        }
        self.sessions.insert(session.id.clone(), session.clone());
    }

    pub fn insert_if_absent(&mut self, session: &Session, now: u64) -> Session {
        match self.get_by_peer(&session.peer_id) {
            Some(existing) if !existing.is_expired(now) => existing,
            _ => {
                self.put(session);
                session.clone()
            }
        }
    }

    pub fn update_index(&mut self, session_id: &str, new_index: u64) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.message_index = new_index;
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            if self.by_peer.get(&session.peer_id) == Some(&session.id) {
                self.by_peer.remove(&session.peer_id);
            }
        }
    }

    pub fn delete_expired(&mut self, now: u64) -> usize {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.id.clone())
            .collect();
        for id in &expired {
            self.delete(id);
        }
        expired.len()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        self.by_peer.clear();
        count
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }
}

// ── In-memory repositories ──────────────────────────────────────────────

/// Identity keys held in process memory. Starts closed.
#[derive(Default)]
pub struct MemoryKeyRepository {
    open: AtomicBool,
    table: RwLock<KeyTable>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }
}

#[async_trait]
impl KeyRepository for MemoryKeyRepository {
    async fn open(&self) -> Result<(), StoreError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.upsert(pair);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.ensure_open()?;
        Ok(self.table.read().await.get(id))
    }

    async fn get_active(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.ensure_open()?;
        Ok(self.table.read().await.active())
    }

    async fn list(&self) -> Result<Vec<IdentityKeyPair>, StoreError> {
        self.ensure_open()?;
        Ok(self.table.read().await.list())
    }

    async fn deactivate_all(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.deactivate_all();
        Ok(())
    }

    async fn update(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.update(pair)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.delete(id);
        Ok(())
    }

    async fn replace_active(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.replace_active(pair);
        Ok(())
    }
}

/// Sessions held in process memory. Starts closed.
#[derive(Default)]
pub struct MemorySessionRepository {
    open: AtomicBool,
    table: RwLock<SessionTable>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn open(&self) -> Result<(), StoreError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_by_peer(&self, peer_id: &str) -> Result<Option<Session>, StoreError> {
        self.ensure_open()?;
        Ok(self.table.read().await.get_by_peer(peer_id))
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.put(session);
        Ok(())
    }

    async fn insert_if_absent(&self, session: &Session, now: u64) -> Result<Session, StoreError> {
        self.ensure_open()?;
        Ok(self.table.write().await.insert_if_absent(session, now))
    }

    async fn update_index(&self, session_id: &str, new_index: u64) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.table.write().await.update_index(session_id, new_index))
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.table.write().await.delete(session_id);
        Ok(())
    }

    async fn delete_expired(&self, now: u64) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.table.write().await.delete_expired(now))
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.table.write().await.clear())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        self.ensure_open()?;
        Ok(self.table.read().await.list())
    }
}
