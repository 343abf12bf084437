//! Key-value persistence for account entries.
//!
//! Entries are JSON objects addressed by a checksum-cased address (or an
//! `xpub` for the HD key record). The store does not interpret them.

use crate::core::errors::WalletError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, address: &str) -> Result<Option<Value>, WalletError>;

    /// Inserts or replaces the entry for `address`.
    async fn set_account(&self, address: &str, entry: Value) -> Result<(), WalletError>;

    async fn remove_account(&self, address: &str) -> Result<(), WalletError>;

    /// Every entry, ordered by address.
    async fn list_accounts(&self) -> Result<Vec<(String, Value)>, WalletError>;
}

/// Volatile store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, address: &str) -> Result<Option<Value>, WalletError> {
        Ok(self.entries.lock().await.get(address).cloned())
    }

    async fn set_account(&self, address: &str, entry: Value) -> Result<(), WalletError> {
        self.entries.lock().await.insert(address.to_string(), entry);
        Ok(())
    }

    async fn remove_account(&self, address: &str) -> Result<(), WalletError> {
        self.entries
            .lock()
            .await
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| WalletError::NotFound(format!("account {}", address)))
    }

    async fn list_accounts(&self) -> Result<Vec<(String, Value)>, WalletError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// A single JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, WalletError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| WalletError::Storage(format!("{} is not a store file: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("store {} does not exist yet", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!("Opened account store {} ({} entries)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Flushed {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl AccountStore for JsonFileStore {
    async fn get_account(&self, address: &str) -> Result<Option<Value>, WalletError> {
        Ok(self.entries.lock().await.get(address).cloned())
    }

    async fn set_account(&self, address: &str, entry: Value) -> Result<(), WalletError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(address.to_string(), entry);
        if let Err(e) = self.flush(&entries).await {
            // keep memory and disk in step
            match previous {
                Some(old) => entries.insert(address.to_string(), old),
                None => entries.remove(address),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove_account(&self, address: &str) -> Result<(), WalletError> {
        let mut entries = self.entries.lock().await;
        let removed = entries
            .remove(address)
            .ok_or_else(|| WalletError::NotFound(format!("account {}", address)))?;
        if let Err(e) = self.flush(&entries).await {
            entries.insert(address.to_string(), removed);
            return Err(e);
        }
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<(String, Value)>, WalletError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
