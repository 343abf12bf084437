//! Accounts and password-gated local signing.
//!
//! A [`WalletAccount`] never keeps decrypted key material: each operation
//! decrypts into a zeroizing buffer on a blocking thread, uses it, and drops
//! it before returning. Operations on one account are serialised.

use crate::core::errors::WalletError;
use crate::core::tx::{
    encode_signed, personal_message_hash, recovery_id, signing_hash, transaction_v, SignedMessage,
    TransactionFields,
};
use crate::crypto::keystore::{KeystoreCodec, KeystoreRecord};
use crate::hardware::signer::HardwareSigner;
use ethers::signers::LocalWallet;
use ethers::types::{Signature, H256};
use k256::ecdsa::SigningKey;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// An account backed by an encrypted keystore record.
pub struct WalletAccount {
    record: KeystoreRecord,
    codec: KeystoreCodec,
    session: Mutex<()>,
}

impl WalletAccount {
    /// Wraps a keystore record. The address is stored checksum-cased.
    pub fn new(record: KeystoreRecord, codec: KeystoreCodec) -> Result<Self, WalletError> {
        if !record.is_well_formed() {
            return Err(WalletError::InvalidInput("malformed keystore record".to_string()));
        }
        if record.is_extended_key_record() {
            return Err(WalletError::InvalidInput(
                "extended key records cannot back a single account".to_string(),
            ));
        }
        if record.address.is_empty() {
            return Err(WalletError::InvalidInput("keystore record has no address".to_string()));
        }
        let record = record.normalized()?;
        Ok(Self {
            record,
            codec,
            session: Mutex::new(()),
        })
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    pub fn record(&self) -> &KeystoreRecord {
        &self.record
    }

    /// The encrypted record as JSON. No password is needed.
    pub fn export_to_json(&self) -> Result<String, WalletError> {
        self.record.to_json()
    }

    /// Decrypts, runs `op` with the key, and drops the key.
    async fn with_key<T, F>(&self, password: &str, op: F) -> Result<T, WalletError>
    where
        T: Send + 'static,
        F: FnOnce(&SigningKey, &[u8]) -> Result<T, WalletError> + Send + 'static,
    {
        let _guard = self.session.lock().await;
        let record = self.record.clone();
        let codec = self.codec.clone();
        let password = Zeroizing::new(password.as_bytes().to_vec());

        tokio::task::spawn_blocking(move || {
            let secret = codec.decrypt(&password, &record)?;
            let key = SigningKey::from_slice(&secret)
                .map_err(|_| WalletError::Decryption("decrypted key is out of range".to_string()))?;
            op(&key, &secret)
        })
        .await?
    }

    /// Explicit export of the raw private key.
    pub async fn get_private_key(&self, password: &str) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        let key = self
            .with_key(password, |_, secret| Ok(Zeroizing::new(secret.to_vec())))
            .await?;
        warn!("Private key exported for {}", self.address());
        Ok(key)
    }

    pub async fn get_private_key_string(&self, password: &str) -> Result<Zeroizing<String>, WalletError> {
        let key = self.get_private_key(password).await?;
        Ok(Zeroizing::new(format!("0x{}", hex::encode(key.as_slice()))))
    }

    /// `Ok(false)` for a wrong password; structural damage is still an error.
    pub async fn validate_password(&self, password: &str) -> Result<bool, WalletError> {
        match self.with_key(password, |_, _| Ok(())).await {
            Ok(()) => Ok(true),
            Err(WalletError::InvalidPassword) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Signs `message` with the personal-message preamble.
    pub async fn sign(&self, message: &str, password: &str) -> Result<SignedMessage, WalletError> {
        let hash = personal_message_hash(message);
        let signature = self
            .with_key(password, move |key, _| sign_hash(key, hash))
            .await?;
        debug!("Message signed by {}", self.address());
        Ok(SignedMessage::new(message, hash, &signature))
    }

    /// Signs a legacy transaction and returns the raw `0x` hex.
    pub async fn sign_transaction(
        &self,
        fields: &TransactionFields,
        password: &str,
    ) -> Result<String, WalletError> {
        let request = fields.to_request()?;
        let hash = signing_hash(&request);
        let chain_id = fields.chain_id;
        let signature = self
            .with_key(password, move |key, _| {
                let sig = sign_hash(key, hash)?;
                Ok(Signature {
                    v: transaction_v(recovery_id(sig.v, None)?, chain_id)?,
                    ..sig
                })
            })
            .await?;
        info!("Transaction signed by {}", self.address());
        Ok(encode_signed(&request, &signature))
    }
}

fn sign_hash(key: &SigningKey, hash: H256) -> Result<Signature, WalletError> {
    LocalWallet::from(key.clone())
        .sign_hash(hash)
        .map_err(|e| WalletError::Crypto(format!("signing failed: {}", e)))
}

impl fmt::Debug for WalletAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletAccount")
            .field("address", &self.record.address)
            .finish_non_exhaustive()
    }
}

/// Account variant discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountKind {
    Keystore,
    WatchOnly,
    Hardware,
}

/// One entry of a wallet set.
#[derive(Debug)]
pub enum Account {
    Keystore(WalletAccount),
    WatchOnly { address: String },
    Hardware { address: String, index: u32 },
}

/// Collaborators needed to sign, passed in by the caller.
#[derive(Clone, Default)]
pub struct SigningContext {
    pub hardware: Option<Arc<HardwareSigner>>,
    pub chain_id: Option<u64>,
}

impl SigningContext {
    pub fn new(chain_id: Option<u64>) -> Self {
        Self { hardware: None, chain_id }
    }

    pub fn with_hardware(mut self, signer: Arc<HardwareSigner>) -> Self {
        self.hardware = Some(signer);
        self
    }

    fn hardware(&self) -> Result<&HardwareSigner, WalletError> {
        self.hardware
            .as_deref()
            .ok_or_else(|| WalletError::AccessDenied("no hardware signer is connected".to_string()))
    }
}

impl Account {
    pub fn address(&self) -> &str {
        match self {
            Account::Keystore(account) => account.address(),
            Account::WatchOnly { address } | Account::Hardware { address, .. } => address,
        }
    }

    pub fn kind(&self) -> AccountKind {
        match self {
            Account::Keystore(_) => AccountKind::Keystore,
            Account::WatchOnly { .. } => AccountKind::WatchOnly,
            Account::Hardware { .. } => AccountKind::Hardware,
        }
    }

    pub fn can_sign(&self) -> bool {
        !matches!(self, Account::WatchOnly { .. })
    }

    pub async fn sign_message(
        &self,
        message: &str,
        password: &str,
        ctx: &SigningContext,
    ) -> Result<SignedMessage, WalletError> {
        match self {
            Account::Keystore(account) => account.sign(message, password).await,
            Account::Hardware { index, .. } => ctx.hardware()?.sign_message(message, *index).await,
            Account::WatchOnly { address } => Err(watch_only_denied(address)),
        }
    }

    pub async fn sign_transaction(
        &self,
        fields: &TransactionFields,
        password: &str,
        ctx: &SigningContext,
    ) -> Result<String, WalletError> {
        let fields = fields.clone().with_chain_id(ctx.chain_id);
        match self {
            Account::Keystore(account) => account.sign_transaction(&fields, password).await,
            Account::Hardware { index, .. } => {
                ctx.hardware()?.sign_transaction(&fields, *index).await
            }
            Account::WatchOnly { address } => Err(watch_only_denied(address)),
        }
    }

    pub async fn validate_password(&self, password: &str) -> Result<bool, WalletError> {
        match self {
            Account::Keystore(account) => account.validate_password(password).await,
            other => Err(WalletError::AccessDenied(format!(
                "{} has no password-protected key",
                other.address()
            ))),
        }
    }
}

fn watch_only_denied(address: &str) -> WalletError {
    WalletError::AccessDenied(format!("{} is a watch-only account and cannot sign", address))
}
