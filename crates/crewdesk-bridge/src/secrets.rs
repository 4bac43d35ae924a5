// Provider API keys, kept out of every config value that crosses the bridge.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{BridgeError, Result};

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn store(&self, provider: &str, key: &str) -> Result<()>;
    async fn get(&self, provider: &str) -> Result<Option<String>>;
    /// Returns whether a key was present.
    async fn delete(&self, provider: &str) -> Result<bool>;
    /// Providers that currently have a key, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

pub fn normalize_provider(provider: &str) -> Result<String> {
    let normalized = provider.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(BridgeError::Secret(
            "provider name cannot be empty".to_string(),
        ));
    }
    Ok(normalized)
}

pub fn validate_api_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BridgeError::Secret("API key cannot be empty".to_string()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(BridgeError::Secret(
            "API key must not contain whitespace".to_string(),
        ));
    }
    Ok(())
}

/// In-process store for tests and sessions that should not touch disk.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: parking_lot::RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store(&self, provider: &str, key: &str) -> Result<()> {
        let provider = normalize_provider(provider)?;
        validate_api_key(key)?;
        self.entries.write().insert(provider, key.to_string());
        Ok(())
    }

    async fn get(&self, provider: &str) -> Result<Option<String>> {
        let provider = normalize_provider(provider)?;
        Ok(self.entries.read().get(&provider).cloned())
    }

    async fn delete(&self, provider: &str) -> Result<bool> {
        let provider = normalize_provider(provider)?;
        Ok(self.entries.write().remove(&provider).is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut providers: Vec<String> = self.entries.read().keys().cloned().collect();
        providers.sort();
        Ok(providers)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedEntry {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SealedFile {
    /// provider -> AES-256-GCM sealed key, one random nonce per entry
    entries: BTreeMap<String, SealedEntry>,
}

/// AES-256-GCM encrypted JSON file of provider keys.
pub struct EncryptedFileSecretStore {
    path: PathBuf,
    cipher: Aes256Gcm,
    file: RwLock<SealedFile>,
}

impl EncryptedFileSecretStore {
    pub async fn open(path: impl AsRef<Path>, master_key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(master_key)
            .map_err(|e| BridgeError::Secret(format!("Invalid master key: {}", e)))?;
        let path = path.as_ref().to_path_buf();

        let file = if path.exists() {
            let data = fs::read(&path).await?;
            serde_json::from_slice(&data).map_err(|e| {
                BridgeError::Secret(format!("Failed to parse secret store: {}", e))
            })?
        } else {
            SealedFile::default()
        };

        Ok(Self {
            path,
            cipher,
            file: RwLock::new(file),
        })
    }

    /// Opens the store with a master key kept next to it, creating the key
    /// on first use.
    pub async fn open_with_key_file(
        path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let master_key = load_or_create_master_key(key_path.as_ref()).await?;
        Self::open(path, &master_key).await
    }

    fn seal(&self, value: &str) -> Result<SealedEntry> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|e| BridgeError::Secret(format!("Encryption failed: {}", e)))?;
        Ok(SealedEntry {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    fn open_entry(&self, entry: &SealedEntry) -> Result<String> {
        if entry.nonce.len() != NONCE_LEN {
            return Err(BridgeError::Secret("Corrupt secret entry".to_string()));
        }
        let nonce = Nonce::from_slice(&entry.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, entry.ciphertext.as_ref())
            .map_err(|e| BridgeError::Secret(format!("Decryption failed: {}", e)))?;
        String::from_utf8(plaintext)
            .map_err(|e| BridgeError::Secret(format!("Invalid UTF-8: {}", e)))
    }

    async fn persist(&self, file: &SealedFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|e| BridgeError::Secret(format!("Failed to serialize store: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for EncryptedFileSecretStore {
    async fn store(&self, provider: &str, key: &str) -> Result<()> {
        let provider = normalize_provider(provider)?;
        validate_api_key(key)?;
        let sealed = self.seal(key)?;
        let mut file = self.file.write().await;
        file.entries.insert(provider, sealed);
        self.persist(&file).await
    }

    async fn get(&self, provider: &str) -> Result<Option<String>> {
        let provider = normalize_provider(provider)?;
        let file = self.file.read().await;
        match file.entries.get(&provider) {
            Some(entry) => self.open_entry(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, provider: &str) -> Result<bool> {
        let provider = normalize_provider(provider)?;
        let mut file = self.file.write().await;
        if file.entries.remove(&provider).is_none() {
            return Ok(false);
        }
        self.persist(&file).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.file.read().await.entries.keys().cloned().collect())
    }
}

pub async fn load_or_create_master_key(key_path: &Path) -> Result<Vec<u8>> {
    if key_path.exists() {
        let key = fs::read(key_path).await?;
        if key.len() != MASTER_KEY_LEN {
            return Err(BridgeError::Secret(format!(
                "master key at {} has {} bytes, expected {}",
                key_path.display(),
                key.len(),
                MASTER_KEY_LEN
            )));
        }
        return Ok(key);
    }

    let mut key = vec![0u8; MASTER_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(key_path, &key).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tracing::info!(path = %key_path.display(), "created secret store master key");
    Ok(key)
}
