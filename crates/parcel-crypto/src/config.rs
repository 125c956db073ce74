use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the encryption core, loadable from a TOML table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Lifetime of a derived session before it is treated as absent.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// PBKDF2-HMAC-SHA256 rounds used to wrap key backups.
    /// A backup can only be restored with the count it was made with.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// Messages sent on one session before rotation is reported as due.
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: u64,

    /// Application tag; the verification payload type is `<app_tag>e2e`.
    #[serde(default = "default_app_tag")]
    pub app_tag: String,
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_pbkdf2_iterations() -> u32 {
    100_000
}

fn default_rotation_threshold() -> u64 {
    1_000
}

fn default_app_tag() -> String {
    "parcel_".into()
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            rotation_threshold: default_rotation_threshold(),
            app_tag: default_app_tag(),
        }
    }
}

impl CryptoConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
