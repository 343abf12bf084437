//! BIP39/BIP32/BIP44 HD wallet derivation
//!
//! Path format: m/44'/60'/0'/0/address_index
//!
//! A seed yields one master extended key; accounts are the non-hardened
//! children of the configured parent path, derived lazily by index.

use crate::core::address::checksum;
use crate::core::errors::WalletError;
use bip39::Mnemonic;
use coins_bip32::enc::{MainnetEncoder, XKeyEncoder};
use coins_bip32::path::DerivationPath;
use coins_bip32::primitives::Hint;
use coins_bip32::xkeys::{Parent, XPriv};
use ethers::utils::secret_key_to_address;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Ethereum parent path; account `i` lives at `m/44'/60'/0'/0/i`.
pub const ETHEREUM_PARENT_PATH: &str = "m/44'/60'/0'/0";

/// First hardened index.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// BIP32 extended private key.
#[derive(Clone, PartialEq)]
pub struct ExtendedKey {
    inner: XPriv,
}

impl ExtendedKey {
    /// Parses a base58 `xprv` string.
    pub fn from_xprv(xprv: &str) -> Result<Self, WalletError> {
        let inner = MainnetEncoder::xpriv_from_base58(xprv.trim())
            .map_err(|e| WalletError::KeyDerivation(format!("invalid extended private key: {}", e)))?;
        Ok(Self { inner })
    }

    /// Base58 `xprv` serialisation. Secret.
    pub fn to_xprv(&self) -> Result<Zeroizing<String>, WalletError> {
        MainnetEncoder::xpriv_to_base58(&self.inner)
            .map(Zeroizing::new)
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))
    }

    /// Base58 `xpub` serialisation of the matching public key.
    pub fn to_xpub(&self) -> Result<String, WalletError> {
        MainnetEncoder::xpub_to_base58(&self.inner.verify_key())
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))
    }

    pub fn signing_key(&self) -> &SigningKey {
        self.inner.as_ref()
    }
}

// never print key material
impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey").finish_non_exhaustive()
    }
}

/// One derived account key.
pub struct KeyPair {
    pub index: u32,
    secret: Zeroizing<[u8; 32]>,
    /// Uncompressed SEC1 public key (65 bytes).
    pub public_key: Vec<u8>,
    /// Checksum-cased address.
    pub address: String,
}

impl KeyPair {
    pub fn from_signing_key(index: u32, key: &SigningKey) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&key.to_bytes());
        let public_key = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        let address = checksum(&secret_key_to_address(key));
        Self { index, secret, public_key, address }
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("index", &self.index)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Whether `value` is a base58 `xpub`.
pub fn is_extended_public_key(value: &str) -> bool {
    MainnetEncoder::xpub_from_base58(value.trim()).is_ok()
}

/// Generates a fresh English mnemonic with `word_count` words.
pub fn generate_mnemonic(word_count: usize) -> Result<Zeroizing<String>, WalletError> {
    let entropy_len = match word_count {
        12 => 16,
        15 => 20,
        18 => 24,
        21 => 28,
        24 => 32,
        other => {
            return Err(WalletError::InvalidInput(format!(
                "unsupported mnemonic length: {} words",
                other
            )))
        }
    };
    let mut entropy = Zeroizing::new(vec![0u8; entropy_len]);
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// BIP39 seed from a word list. The checksum word is validated.
pub fn seed_from_mnemonic(phrase: &str, passphrase: &str) -> Result<Zeroizing<[u8; 64]>, WalletError> {
    let mnemonic = Mnemonic::parse(phrase.trim())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    debug!("Mnemonic parsed: {} words", mnemonic.word_count());
    Ok(Zeroizing::new(mnemonic.to_seed(passphrase)))
}

/// Master extended key for a seed.
pub fn master_key(seed: &[u8]) -> Result<ExtendedKey, WalletError> {
    let inner = XPriv::root_from_seed(seed, Some(Hint::Legacy))
        .map_err(|e| WalletError::KeyDerivation(format!("master key derivation failed: {}", e)))?;
    Ok(ExtendedKey { inner })
}

/// Walks `path` (e.g. `m/44'/60'/0'/0`) below `key`.
pub fn derive_path(key: &ExtendedKey, path: &str) -> Result<ExtendedKey, WalletError> {
    let path = DerivationPath::from_str(path)
        .map_err(|e| WalletError::KeyDerivation(format!("invalid derivation path: {}", e)))?;
    let inner = key
        .inner
        .derive_path(&path)
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    Ok(ExtendedKey { inner })
}

/// The `index`-th non-hardened child of `key` as a key pair.
pub fn derive_child_account(key: &ExtendedKey, index: u32) -> Result<KeyPair, WalletError> {
    if index >= HARDENED_OFFSET {
        return Err(WalletError::InvalidInput(format!(
            "account index {} is in the hardened range",
            index
        )));
    }
    let child = key
        .inner
        .derive_child(index)
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    Ok(KeyPair::from_signing_key(index, child.as_ref()))
}

/// HD wallet session state: the parent extended key and the next unused index.
pub struct HdWallet {
    key: Option<ExtendedKey>,
    path: String,
    next_index: u32,
}

impl HdWallet {
    /// `key` must already sit at `path`.
    pub fn new(key: ExtendedKey, path: impl Into<String>, next_index: u32) -> Self {
        Self { key: Some(key), path: path.into(), next_index }
    }

    /// Seed → master → `parent_path`, starting at index 0.
    pub fn from_mnemonic(phrase: &str, passphrase: &str, parent_path: &str) -> Result<Self, WalletError> {
        let seed = seed_from_mnemonic(phrase, passphrase)?;
        let master = master_key(seed.as_ref())?;
        let parent = derive_path(&master, parent_path)?;
        info!("HD wallet initialised at {}", parent_path);
        Ok(Self::new(parent, parent_path, 0))
    }

    pub fn extended_key(&self) -> Result<&ExtendedKey, WalletError> {
        self.key
            .as_ref()
            .ok_or_else(|| WalletError::AccessDenied("HD wallet key has been wiped".to_string()))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Derives a key pair without advancing the counter.
    pub fn account(&self, index: u32) -> Result<KeyPair, WalletError> {
        derive_child_account(self.extended_key()?, index)
    }

    /// Derives the key pair at the next index and advances the counter.
    pub fn next_account(&mut self) -> Result<KeyPair, WalletError> {
        let pair = self.account(self.next_index)?;
        self.next_index = self
            .next_index
            .checked_add(1)
            .filter(|i| *i < HARDENED_OFFSET)
            .ok_or_else(|| WalletError::KeyDerivation("account index space exhausted".to_string()))?;
        Ok(pair)
    }

    /// Drops the extended key; its scalar is zeroed on drop.
    pub fn wipe(&mut self) {
        if self.key.take().is_some() {
            debug!("HD wallet key wiped");
        }
    }

    pub fn is_wiped(&self) -> bool {
        self.key.is_none()
    }
}

impl Drop for HdWallet {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_bip39_seed_vector() {
        let seed = seed_from_mnemonic(TEST_MNEMONIC, "TREZOR").unwrap();
        assert_eq!(
            hex::encode(seed.as_ref()),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn test_bad_checksum_word_rejected() {
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert!(matches!(
            seed_from_mnemonic(phrase, ""),
            Err(WalletError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_unknown_word_rejected() {
        assert!(matches!(
            seed_from_mnemonic("hello world", ""),
            Err(WalletError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_bip32_vector_one() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let master = master_key(&seed).unwrap();
        assert_eq!(
            master.to_xprv().unwrap().as_str(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(
            master.to_xpub().unwrap(),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );

        let child = derive_path(&master, "m/0'").unwrap();
        assert_eq!(
            child.to_xprv().unwrap().as_str(),
            "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7"
        );
    }

    #[test]
    fn test_master_key_is_deterministic() {
        let seed = [7u8; 64];
        let a = master_key(&seed).unwrap();
        let b = master_key(&seed).unwrap();
        assert_eq!(a.to_xprv().unwrap(), b.to_xprv().unwrap());
    }

    #[test]
    fn test_ethereum_first_account() {
        let wallet = HdWallet::from_mnemonic(TEST_MNEMONIC, "", ETHEREUM_PARENT_PATH).unwrap();
        let pair = wallet.account(0).unwrap();
        assert_eq!(pair.address, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
        assert_eq!(pair.public_key.len(), 65);
        assert_eq!(wallet.path(), ETHEREUM_PARENT_PATH);
    }

    #[test]
    fn test_next_account_is_sequential() {
        let mut wallet = HdWallet::from_mnemonic(TEST_MNEMONIC, "", ETHEREUM_PARENT_PATH).unwrap();
        let first = wallet.next_account().unwrap();
        let second = wallet.next_account().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(wallet.next_index(), 2);
        assert_ne!(first.address, second.address);
    }

    #[test]
    fn test_xprv_roundtrip() {
        let wallet = HdWallet::from_mnemonic(TEST_MNEMONIC, "", ETHEREUM_PARENT_PATH).unwrap();
        let xprv = wallet.extended_key().unwrap().to_xprv().unwrap();
        let restored = ExtendedKey::from_xprv(&xprv).unwrap();
        assert_eq!(&restored, wallet.extended_key().unwrap());
    }

    #[test]
    fn test_hardened_account_index_rejected() {
        let wallet = HdWallet::from_mnemonic(TEST_MNEMONIC, "", ETHEREUM_PARENT_PATH).unwrap();
        assert!(matches!(wallet.account(HARDENED_OFFSET), Err(WalletError::InvalidInput(_))));
    }

    #[test]
    fn test_wipe() {
        let mut wallet = HdWallet::from_mnemonic(TEST_MNEMONIC, "", ETHEREUM_PARENT_PATH).unwrap();
        wallet.wipe();
        assert!(wallet.is_wiped());
        assert!(matches!(wallet.next_account(), Err(WalletError::AccessDenied(_))));
    }

    #[test]
    fn test_generated_mnemonic_parses() {
        let phrase = generate_mnemonic(12).unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
        assert!(seed_from_mnemonic(&phrase, "").is_ok());
        assert!(generate_mnemonic(13).is_err());
    }

    #[test]
    fn test_xpub_detection() {
        let master = master_key(&[3u8; 32]).unwrap();
        assert!(is_extended_public_key(&master.to_xpub().unwrap()));
        assert!(!is_extended_public_key(master.to_xprv().unwrap().as_str()));
        assert!(!is_extended_public_key("0x9858EfFD232B4033E47d90003D41EC34EcaEda94"));
    }

    #[test]
    fn test_invalid_path() {
        let master = master_key(&[1u8; 32]).unwrap();
        assert!(matches!(
            derive_path(&master, "m/44'/x"),
            Err(WalletError::KeyDerivation(_))
        ));
    }
}
