//! Encrypted on-disk store for identity keys and sessions.
//!
//! One file holds both tables. The passphrase is stretched with PBKDF2 once
//! per open; every mutation re-seals the whole state under a fresh nonce and
//! replaces the file atomically (write to `.tmp`, then rename).
//!
//! File format: [PRCL magic(4)] [version(1)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::aead::{open, random_bytes, random_nonce, seal, KEY_LEN, NONCE_LEN};
use crate::identity::IdentityKeyPair;
use crate::kdf::derive_password_key;
use crate::session::Session;
use crate::stores::{KeyRepository, KeyTable, SessionRepository, SessionTable, StoreError};

const MAGIC: &[u8; 4] = b"PRCL";
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes

/// Everything the store persists.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub keys: KeyTable,
    pub sessions: SessionTable,
}

struct OpenState {
    data: StoreState,
    salt: [u8; SALT_LEN],
    key: Zeroizing<[u8; KEY_LEN]>,
}

/// File-backed [`KeyRepository`] and [`SessionRepository`].
///
/// Both traits share one open/close state: closing through either closes the
/// store for both.
pub struct EncryptedFileStore {
    path: PathBuf,
    passphrase: Zeroizing<String>,
    pbkdf2_iterations: u32,
    state: RwLock<Option<OpenState>>,
}

fn aad() -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(MAGIC);
    aad[4] = VERSION;
    aad
}

/// Serialize and seal `data` into the on-disk format.
fn encode_file(
    data: &StoreState,
    salt: &[u8; SALT_LEN],
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, StoreError> {
    let plaintext = Zeroizing::new(postcard::to_allocvec(data)?);
    let nonce = random_nonce().map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let sealed =
        seal(key, &nonce, &aad(), &plaintext).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let payload_len = u32::try_from(sealed.len())
        .map_err(|_| StoreError::Corrupt("state too large".into()))?;
    let mut file_data = Vec::with_capacity(HEADER_LEN + sealed.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(salt);
    file_data.extend_from_slice(&nonce);
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&sealed);
    Ok(file_data)
}

/// Parse and open a store file, deriving the key from `passphrase`.
fn decode_file(
    file_data: &[u8],
    passphrase: &str,
    iterations: u32,
) -> Result<OpenState, StoreError> {
    if !has_valid_header(file_data) {
        return Err(StoreError::Corrupt(
            "invalid file format (expected PRCL header)".into(),
        ));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&file_data[5..5 + SALT_LEN]);

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&file_data[37..37 + NONCE_LEN]);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[49..HEADER_LEN]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        return Err(StoreError::Corrupt("file truncated".into()));
    }

    let key = derive_password_key(passphrase, &salt, iterations)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let plaintext = open(
        &key,
        &nonce,
        &aad(),
        &file_data[HEADER_LEN..HEADER_LEN + payload_len],
    )
    .map_err(|_| StoreError::Corrupt("incorrect passphrase or corrupted file".into()))?;

    let data: StoreState = postcard::from_bytes(&plaintext)?;
    Ok(OpenState { data, salt, key })
}

/// Whether `file_data` starts with a PRCL header this version understands.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

impl EncryptedFileStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: &str, pbkdf2_iterations: u32) -> Self {
        Self {
            path: path.into(),
            passphrase: Zeroizing::new(passphrase.to_string()),
            pbkdf2_iterations,
            state: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, or start an empty store if it does not exist yet.
    /// Opening an already open store is a no-op.
    pub async fn open_store(&self) -> Result<(), StoreError> {
        let mut guard = self.state.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let opened = match tokio::fs::read(&self.path).await {
            Ok(file_data) => {
                let opened = decode_file(&file_data, &self.passphrase, self.pbkdf2_iterations)?;
                info!(path = %self.path.display(), "store opened");
                opened
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let salt = random_bytes::<SALT_LEN>().map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let key = derive_password_key(&self.passphrase, &salt, self.pbkdf2_iterations)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let opened = OpenState {
                    data: StoreState::default(),
                    salt,
                    key,
                };
                self.write_file(&opened).await?;
                info!(path = %self.path.display(), "new store created");
                opened
            }
            Err(e) => return Err(e.into()),
        };

        *guard = Some(opened);
        Ok(())
    }

    /// Flush and drop the in-memory state.
    pub async fn close_store(&self) -> Result<(), StoreError> {
        let mut guard = self.state.write().await;
        if let Some(opened) = guard.take() {
            self.write_file(&opened).await?;
            debug!(path = %self.path.display(), "store closed");
        }
        Ok(())
    }

    async fn write_file(&self, opened: &OpenState) -> Result<(), StoreError> {
        let file_data = encode_file(&opened.data, &opened.salt, &opened.key)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &file_data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreState) -> T + Send,
    {
        let guard = self.state.read().await;
        let opened = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(f(&opened.data))
    }

    /// Apply `f` and persist the result. The write lock is held through the
    /// file write so the file never lags behind a later mutation.
    async fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut StoreState) -> Result<T, StoreError> + Send,
    {
        let mut guard = self.state.write().await;
        let opened = guard.as_mut().ok_or(StoreError::Closed)?;
        let out = f(&mut opened.data)?;
        self.write_file(opened).await?;
        Ok(out)
    }
}

#[async_trait]
impl KeyRepository for EncryptedFileStore {
    async fn open(&self) -> Result<(), StoreError> {
        self.open_store().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.close_store().await
    }

    async fn create(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.keys.upsert(pair);
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.read(|s| s.keys.get(id)).await
    }

    async fn get_active(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.read(|s| s.keys.active()).await
    }

    async fn list(&self) -> Result<Vec<IdentityKeyPair>, StoreError> {
        self.read(|s| s.keys.list()).await
    }

    async fn deactivate_all(&self) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.keys.deactivate_all();
            Ok(())
        })
        .await
    }

    async fn update(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.mutate(|s| s.keys.update(pair)).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.keys.delete(id);
            Ok(())
        })
        .await
    }

    async fn replace_active(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.keys.replace_active(pair);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionRepository for EncryptedFileStore {
    async fn open(&self) -> Result<(), StoreError> {
        self.open_store().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.close_store().await
    }

    async fn get_by_peer(&self, peer_id: &str) -> Result<Option<Session>, StoreError> {
        self.read(|s| s.sessions.get_by_peer(peer_id)).await
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.sessions.put(session);
            Ok(())
        })
        .await
    }

    async fn insert_if_absent(&self, session: &Session, now: u64) -> Result<Session, StoreError> {
        self.mutate(|s| Ok(s.sessions.insert_if_absent(session, now)))
            .await
    }

    async fn update_index(&self, session_id: &str, new_index: u64) -> Result<bool, StoreError> {
        self.mutate(|s| Ok(s.sessions.update_index(session_id, new_index)))
            .await
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.sessions.delete(session_id);
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, now: u64) -> Result<usize, StoreError> {
        self.mutate(|s| Ok(s.sessions.delete_expired(now))).await
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        self.mutate(|s| Ok(s.sessions.clear())).await
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        self.read(|s| s.sessions.list()).await
    }
}
