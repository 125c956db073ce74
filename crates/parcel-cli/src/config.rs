use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parcel_crypto::CryptoConfig;
use serde::Deserialize;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Directory holding the encrypted key store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Store file name inside `data_dir`.
    #[serde(default = "default_store_file")]
    pub store_file: String,

    #[serde(default)]
    pub crypto: CryptoConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".parcel")
}

fn default_store_file() -> String {
    "keys.store".into()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store_file: default_store_file(),
            crypto: CryptoConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CliConfig::default();
        assert_eq!(config.store_path(), PathBuf::from(".parcel/keys.store"));
        assert_eq!(config.crypto.pbkdf2_iterations, 100_000);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            data_dir = "/var/lib/parcel"

            [crypto]
            session_ttl_secs = 3600
            app_tag = "acme_"
        "#;
        let config: CliConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/parcel/keys.store"));
        assert_eq!(config.crypto.session_ttl_secs, 3600);
        assert_eq!(config.crypto.app_tag, "acme_");
        assert_eq!(config.crypto.rotation_threshold, 1_000);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CliConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcel.toml");
        std::fs::write(&path, "store_file = \"alt.store\"\n").unwrap();
        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.store_file, "alt.store");
    }
}
