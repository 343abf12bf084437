//! The wallet set: every account the user holds, keyed by checksum address,
//! plus the optional encrypted HD key that new accounts are derived from.
//!
//! Stored entries are classified once, when the vault loads:
//! - `address` is an `xpub` → the HD key record;
//! - well-formed v3 keystore → [`Account::Keystore`];
//! - `hardware` marker → [`Account::Hardware`];
//! - anything else → [`Account::WatchOnly`].

use crate::core::account::{Account, SigningContext, WalletAccount};
use crate::core::address::to_checksum_address;
use crate::core::bip44::HdWallet;
use crate::core::config::VaultConfig;
use crate::core::errors::WalletError;
use crate::core::tx::{SignedMessage, TransactionFields};
use crate::crypto::keystore::{self, KeystoreCodec, KeystoreRecord};
use crate::hardware::signer::HardwareSigner;
use crate::storage::AccountStore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const NEXT_INDEX_FIELD: &str = "nextIndex";
const PATH_FIELD: &str = "path";
const HARDWARE_FIELD: &str = "hardware";

/// The encrypted HD key and the first child index not yet handed out.
#[derive(Debug, Clone)]
struct HdKeyRecord {
    record: KeystoreRecord,
    path: String,
    next_index: u32,
}

impl HdKeyRecord {
    fn to_entry(&self) -> Result<Value, WalletError> {
        let mut entry = serde_json::to_value(&self.record)?;
        if let Value::Object(map) = &mut entry {
            map.insert(NEXT_INDEX_FIELD.to_string(), json!(self.next_index));
            map.insert(PATH_FIELD.to_string(), json!(self.path));
        }
        Ok(entry)
    }
}

enum Entry {
    HdKey(HdKeyRecord),
    Account(Account),
}

fn classify(key: &str, value: &Value, codec: &KeystoreCodec, default_path: &str) -> Result<Entry, WalletError> {
    let address = value
        .get("address")
        .and_then(Value::as_str)
        .unwrap_or(key)
        .to_string();

    if keystore::is_extended_key_address(&address) {
        let record = KeystoreRecord::deserialize(value)
            .map_err(|e| WalletError::Decryption(format!("HD key record is damaged: {}", e)))?;
        let next_index = value
            .get(NEXT_INDEX_FIELD)
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or(0);
        let path = value
            .get(PATH_FIELD)
            .and_then(Value::as_str)
            .unwrap_or(default_path)
            .to_string();
        return Ok(Entry::HdKey(HdKeyRecord { record, path, next_index }));
    }

    if keystore::is_well_formed(value) {
        let record = KeystoreRecord::deserialize(value)?;
        return Ok(Entry::Account(Account::Keystore(WalletAccount::new(record, codec.clone())?)));
    }

    let address = to_checksum_address(&address)?;
    if let Some(marker) = value.get(HARDWARE_FIELD) {
        let index = marker
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| WalletError::InvalidInput(format!("hardware entry {} has no index", address)))?;
        return Ok(Entry::Account(Account::Hardware { address, index }));
    }
    Ok(Entry::Account(Account::WatchOnly { address }))
}

fn password_bytes(password: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(password.as_bytes().to_vec())
}

pub struct Vault<S: AccountStore> {
    store: S,
    codec: KeystoreCodec,
    hd_path: String,
    signing: SigningContext,
    accounts: BTreeMap<String, Account>,
    hd_key: Option<HdKeyRecord>,
}

impl<S: AccountStore> Vault<S> {
    /// An empty vault over `store`; call [`Vault::reload`] to read it.
    pub fn new(store: S, config: &VaultConfig) -> Self {
        Self {
            store,
            codec: KeystoreCodec::new(config.kdf.clone()),
            hd_path: config.derivation.hd_path.clone(),
            signing: SigningContext::new(config.chain.chain_id),
            accounts: BTreeMap::new(),
            hd_key: None,
        }
    }

    pub async fn load(store: S, config: &VaultConfig) -> Result<Self, WalletError> {
        let mut vault = Self::new(store, config);
        vault.reload().await?;
        Ok(vault)
    }

    /// Connects a hardware signer for `Hardware` accounts.
    pub fn with_hardware(mut self, signer: Arc<HardwareSigner>) -> Self {
        self.signing = self.signing.with_hardware(signer);
        self
    }

    /// Re-reads and classifies every stored entry. Entries that cannot be
    /// classified are skipped with a warning.
    pub async fn reload(&mut self) -> Result<(), WalletError> {
        self.accounts.clear();
        self.hd_key = None;
        for (key, value) in self.store.list_accounts().await? {
            match classify(&key, &value, &self.codec, &self.hd_path) {
                Ok(Entry::HdKey(hd)) => {
                    if self.hd_key.is_some() {
                        warn!("Multiple HD key records stored; using the last one");
                    }
                    self.hd_key = Some(hd);
                }
                Ok(Entry::Account(account)) => {
                    self.accounts.insert(account.address().to_string(), account);
                }
                Err(e) => warn!("Skipping stored entry {}: {}", key, e),
            }
        }
        info!(
            "Vault loaded: {} accounts, HD key {}",
            self.accounts.len(),
            if self.hd_key.is_some() { "present" } else { "absent" }
        );
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn signing_context(&self) -> &SigningContext {
        &self.signing
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn account(&self, address: &str) -> Result<&Account, WalletError> {
        let address = to_checksum_address(address)?;
        self.accounts
            .get(&address)
            .ok_or_else(|| WalletError::NotFound(format!("account {}", address)))
    }

    pub fn has_hd_key(&self) -> bool {
        self.hd_key.is_some()
    }

    /// Index the next generated account will use.
    pub fn hd_next_index(&self) -> Option<u32> {
        self.hd_key.as_ref().map(|hd| hd.next_index)
    }

    /// Registers a keystore record; its address is stored checksum-cased.
    pub async fn add_keystore(&mut self, record: KeystoreRecord) -> Result<String, WalletError> {
        let account = WalletAccount::new(record, self.codec.clone())?;
        let address = account.address().to_string();
        self.store
            .set_account(&address, serde_json::to_value(account.record())?)
            .await?;
        self.accounts.insert(address.clone(), Account::Keystore(account));
        info!("Keystore account added: {}", address);
        Ok(address)
    }

    /// Decrypts a foreign keystore and re-encrypts its key under the wallet
    /// password.
    pub async fn import_keystore(
        &mut self,
        json: &str,
        json_password: &str,
        wallet_password: &str,
    ) -> Result<String, WalletError> {
        let record = KeystoreRecord::from_json(json)?;
        if record.is_extended_key_record() {
            return Err(WalletError::InvalidInput("cannot import an HD key record as an account".to_string()));
        }
        let codec = self.codec.clone();
        let password = password_bytes(json_password);
        let secret = tokio::task::spawn_blocking(move || codec.decrypt(&password, &record)).await??;
        self.add_raw_key(secret, wallet_password).await
    }

    /// Encrypts a `0x` hex private key under `password`.
    pub async fn add_private_key(&mut self, private_key: &str, password: &str) -> Result<String, WalletError> {
        let raw = private_key.trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let secret = Zeroizing::new(
            hex::decode(raw).map_err(|_| WalletError::InvalidInput("private key is not hex".to_string()))?,
        );
        self.add_raw_key(secret, password).await
    }

    async fn add_raw_key(&mut self, secret: Zeroizing<Vec<u8>>, password: &str) -> Result<String, WalletError> {
        let codec = self.codec.clone();
        let password = password_bytes(password);
        let record = tokio::task::spawn_blocking(move || codec.encrypt(&password, &secret)).await??;
        self.add_keystore(record).await
    }

    /// Adds an address without a key. An address that already holds an
    /// account is left as it is.
    pub async fn add_watch_only(&mut self, address: &str) -> Result<String, WalletError> {
        let address = to_checksum_address(address)?;
        if self.accounts.contains_key(&address) {
            debug!("{} is already in the vault", address);
            return Ok(address);
        }
        self.store.set_account(&address, json!({ "address": address })).await?;
        self.accounts.insert(
            address.clone(),
            Account::WatchOnly { address: address.clone() },
        );
        info!("Watch-only account added: {}", address);
        Ok(address)
    }

    /// Stores the encrypted HD key for `mnemonic` and generates its first
    /// account. A previously stored HD key is replaced.
    pub async fn add_hd_wallet(&mut self, mnemonic: &str, password: &str) -> Result<String, WalletError> {
        let codec = self.codec.clone();
        let phrase = Zeroizing::new(mnemonic.to_string());
        let password = password_bytes(password);
        let path = self.hd_path.clone();

        let (hd, first) = tokio::task::spawn_blocking(move || {
            let mut wallet = HdWallet::from_mnemonic(&phrase, "", &path)?;
            let record = codec.encrypt_extended_key(&password, wallet.extended_key()?)?;
            let pair = wallet.next_account()?;
            let first = codec.encrypt(&password, pair.private_key())?;
            let hd = HdKeyRecord {
                record,
                path: wallet.path().to_string(),
                next_index: wallet.next_index(),
            };
            Ok::<_, WalletError>((hd, first))
        })
        .await??;

        if let Some(previous) = self.hd_key.take() {
            if previous.record.address != hd.record.address {
                self.store.remove_account(&previous.record.address).await?;
                warn!("Replaced the stored HD key");
            }
        }
        self.store.set_account(&hd.record.address, hd.to_entry()?).await?;
        self.hd_key = Some(hd);
        info!("HD key stored");
        self.add_keystore(first).await
    }

    /// Derives, encrypts and registers the next HD account.
    pub async fn generate_account(&mut self, password: &str) -> Result<String, WalletError> {
        let mut hd = self
            .hd_key
            .clone()
            .ok_or_else(|| WalletError::NotFound("no HD key in the vault".to_string()))?;
        let codec = self.codec.clone();
        let password = password_bytes(password);
        let record = hd.record.clone();
        let (path, index) = (hd.path.clone(), hd.next_index);

        let (child, next_index) = tokio::task::spawn_blocking(move || {
            let key = codec.decrypt_extended_key(&password, &record)?;
            let mut wallet = HdWallet::new(key, path, index);
            let pair = wallet.next_account()?;
            let child = codec.encrypt(&password, pair.private_key())?;
            Ok::<_, WalletError>((child, wallet.next_index()))
        })
        .await??;

        // the counter is persisted first so a failed insert never reuses the index
        hd.next_index = next_index;
        self.store.set_account(&hd.record.address, hd.to_entry()?).await?;
        self.hd_key = Some(hd);
        debug!("HD account {} derived", index);
        self.add_keystore(child).await
    }

    /// Registers device accounts `offset..offset + limit` and returns the
    /// addresses registered. Addresses already held as keystore accounts
    /// are skipped.
    pub async fn add_hardware_accounts(&mut self, offset: u32, limit: u32) -> Result<Vec<String>, WalletError> {
        let signer = self
            .signing
            .hardware
            .clone()
            .ok_or_else(|| WalletError::AccessDenied("no hardware signer is connected".to_string()))?;
        let addresses = signer.list_addresses(offset, limit).await?;

        let mut added = Vec::with_capacity(addresses.len());
        for (index, address) in (offset..).zip(addresses) {
            if let Some(Account::Keystore(_)) = self.accounts.get(&address) {
                debug!("{} is already a keystore account, skipping device index {}", address, index);
                continue;
            }
            self.store
                .set_account(&address, json!({ "address": address, HARDWARE_FIELD: { "index": index } }))
                .await?;
            self.accounts.insert(
                address.clone(),
                Account::Hardware { address: address.clone(), index },
            );
            added.push(address);
        }
        info!("Added {} hardware accounts", added.len());
        Ok(added)
    }

    pub async fn remove_account(&mut self, address: &str) -> Result<(), WalletError> {
        let address = to_checksum_address(address)?;
        self.store.remove_account(&address).await?;
        self.accounts.remove(&address);
        info!("Account removed: {}", address);
        Ok(())
    }

    /// The encrypted keystore JSON of a keystore account.
    pub fn export_keystore(&self, address: &str) -> Result<String, WalletError> {
        match self.account(address)? {
            Account::Keystore(account) => account.export_to_json(),
            other => Err(WalletError::AccessDenied(format!("{} has no keystore", other.address()))),
        }
    }

    pub async fn sign_message(&self, address: &str, message: &str, password: &str) -> Result<SignedMessage, WalletError> {
        self.account(address)?
            .sign_message(message, password, &self.signing)
            .await
    }

    pub async fn sign_transaction(
        &self,
        address: &str,
        fields: &TransactionFields,
        password: &str,
    ) -> Result<String, WalletError> {
        self.account(address)?
            .sign_transaction(fields, password, &self.signing)
            .await
    }

    /// Checks `password` against the account's keystore. Accounts without
    /// one are checked against the HD key record when the vault has one.
    pub async fn validate_password(&self, address: &str, password: &str) -> Result<bool, WalletError> {
        let account = self.account(address)?;
        match (account, &self.hd_key) {
            (Account::Keystore(_), _) | (_, None) => account.validate_password(password).await,
            (_, Some(hd)) => {
                let codec = self.codec.clone();
                let record = hd.record.clone();
                let password = password_bytes(password);
                let result = tokio::task::spawn_blocking(move || codec.decrypt_extended_key(&password, &record)).await?;
                match result {
                    Ok(_) => Ok(true),
                    Err(WalletError::InvalidPassword) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::account::AccountKind;
    use crate::core::config::KdfConfig;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const FIRST: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";
    const KEY: &str = "0x4646464646464646464646464646464646464646464646464646464646464646";

    fn config() -> VaultConfig {
        VaultConfig {
            kdf: KdfConfig::scrypt(1024, 8, 1),
            ..VaultConfig::default()
        }
    }

    #[tokio::test]
    async fn test_hd_wallet_and_generation() {
        let store = MemoryStore::new();
        let mut vault = Vault::new(store.clone(), &config());

        assert_eq!(vault.add_hd_wallet(PHRASE, "pw").await.unwrap(), FIRST);
        assert_eq!(vault.hd_next_index(), Some(1));

        let second = vault.generate_account("pw").await.unwrap();
        let expected = HdWallet::from_mnemonic(PHRASE, "", "m/44'/60'/0'/0").unwrap().account(1).unwrap();
        assert_eq!(second, expected.address);
        assert_eq!(vault.hd_next_index(), Some(2));

        assert!(matches!(vault.generate_account("wrong").await, Err(WalletError::InvalidPassword)));
        assert_eq!(vault.hd_next_index(), Some(2));

        let reloaded = Vault::load(store, &config()).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.hd_next_index(), Some(2));
    }

    #[tokio::test]
    async fn test_generate_without_hd_key() {
        let mut vault = Vault::new(MemoryStore::new(), &config());
        assert!(matches!(vault.generate_account("pw").await, Err(WalletError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_import_keystore_rewraps() {
        let source = KeystoreCodec::new(KdfConfig::pbkdf2(1000))
            .encrypt(b"old", &hex::decode(&KEY[2..]).unwrap())
            .unwrap();
        let mut vault = Vault::new(MemoryStore::new(), &config());
        let address = vault
            .import_keystore(&source.to_json().unwrap(), "old", "new")
            .await
            .unwrap();
        assert_eq!(address, source.address);
        assert!(vault.validate_password(&address, "new").await.unwrap());
        assert!(!vault.validate_password(&address, "old").await.unwrap());

        assert!(matches!(
            vault.import_keystore(&source.to_json().unwrap(), "bad", "new").await,
            Err(WalletError::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn test_private_key_and_signing() {
        let mut vault = Vault::new(MemoryStore::new(), &config());
        let address = vault.add_private_key(KEY, "pw").await.unwrap();
        let signed = vault.sign_message(&address.to_lowercase(), "hello", "pw").await.unwrap();
        assert_eq!(signed.message, "hello");
        assert!(matches!(vault.add_private_key("0xzz", "pw").await, Err(WalletError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_watch_only_falls_back_to_hd_password() {
        let mut vault = Vault::new(MemoryStore::new(), &config());
        let watched = vault
            .add_watch_only("0x7c59542b20002ed255598172cab48b86d865dfbb")
            .await
            .unwrap();
        assert_eq!(vault.account(&watched).unwrap().kind(), AccountKind::WatchOnly);
        assert!(matches!(
            vault.validate_password(&watched, "pw").await,
            Err(WalletError::AccessDenied(_))
        ));

        vault.add_hd_wallet(PHRASE, "pw").await.unwrap();
        assert!(vault.validate_password(&watched, "pw").await.unwrap());
        assert!(!vault.validate_password(&watched, "nope").await.unwrap());
        assert!(matches!(
            vault.sign_message(&watched, "hi", "pw").await,
            Err(WalletError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_only_does_not_downgrade() {
        let mut vault = Vault::new(MemoryStore::new(), &config());
        let address = vault.add_private_key(KEY, "pw").await.unwrap();
        vault.add_watch_only(&address).await.unwrap();
        assert_eq!(vault.account(&address).unwrap().kind(), AccountKind::Keystore);
    }

    #[tokio::test]
    async fn test_load_classifies_entries() {
        let store = MemoryStore::new();
        let record = KeystoreCodec::new(KdfConfig::scrypt(1024, 8, 1))
            .encrypt(b"pw", &hex::decode(&KEY[2..]).unwrap())
            .unwrap();
        store
            .set_account(&record.address, serde_json::to_value(&record).unwrap())
            .await
            .unwrap();
        store
            .set_account(FIRST, json!({ "address": FIRST, "hardware": { "index": 0 } }))
            .await
            .unwrap();
        store
            .set_account("0x7c59542b20002ed255598172cab48b86d865dfbb", Value::Null)
            .await
            .unwrap();
        store.set_account("junk", json!({ "address": "nope" })).await.unwrap();

        let vault = Vault::load(store, &config()).await.unwrap();
        assert_eq!(vault.len(), 3);
        assert_eq!(vault.account(&record.address).unwrap().kind(), AccountKind::Keystore);
        assert_eq!(vault.account(FIRST).unwrap().kind(), AccountKind::Hardware);
        assert_eq!(
            vault.account("0x7c59542b20002ed255598172cab48b86d865dfbb").unwrap().kind(),
            AccountKind::WatchOnly
        );
        assert!(!vault.has_hd_key());
    }

    #[tokio::test]
    async fn test_export_keystore() {
        let mut vault = Vault::new(MemoryStore::new(), &config());
        let address = vault.add_private_key(KEY, "pw").await.unwrap();
        let json = vault.export_keystore(&address).unwrap();
        assert_eq!(KeystoreRecord::from_json(&json).unwrap().address, address);

        vault.remove_account(&address).await.unwrap();
        assert!(matches!(vault.account(&address), Err(WalletError::NotFound(_))));
    }
}
