//! Web3 Secret Storage (version 3) keystore codec.
//!
//! Records encrypt either a raw 32-byte secp256k1 key or, for HD wallets, the
//! base58 `xprv` of the parent extended key. Extended-key records carry the
//! matching `xpub` in their `address` field, which is how they are told apart
//! without decrypting.

use crate::core::address::{checksum, parse_address};
use crate::core::bip44::{is_extended_public_key, ExtendedKey};
use crate::core::config::KdfConfig;
use crate::core::errors::WalletError;
use crate::crypto::kdf::{KDFAlgorithm, KeyDerivation, MAX_KEY_LENGTH, MIN_KEY_LENGTH};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ethers::utils::secret_key_to_address;
use k256::ecdsa::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const KEYSTORE_VERSION: u32 = 3;
pub const CIPHER_AES_128_CTR: &str = "aes-128-ctr";
pub const PRF_HMAC_SHA256: &str = "hmac-sha256";

const PRIVATE_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const SALT_LEN: usize = 32;
const MAC_LEN: usize = 32;
const MAX_PBKDF2_ROUNDS: u32 = 10_000_000;
/// Upper bound on scrypt's `128 * r * n` working set.
const MAX_SCRYPT_MEMORY: u64 = 1 << 30;

/// Persisted keystore record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeystoreRecord {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Checksum address, or the `xpub` for extended-key records. Empty when
    /// an imported file omitted it.
    #[serde(default)]
    pub address: String,
    #[serde(alias = "Crypto")]
    pub crypto: CryptoSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoSection {
    pub cipher: String,
    pub ciphertext: String,
    pub cipherparams: CipherParams,
    pub kdf: String,
    pub kdfparams: KdfParams,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

/// KDF parameters. Deserialized through [`RawKdfParams`] so the variant is
/// picked by field presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawKdfParams")]
pub enum KdfParams {
    Scrypt {
        n: u32,
        r: u32,
        p: u32,
        dklen: usize,
        salt: String,
    },
    Pbkdf2 {
        c: u32,
        dklen: usize,
        prf: String,
        salt: String,
    },
}

#[derive(Deserialize)]
struct RawKdfParams {
    n: Option<u32>,
    r: Option<u32>,
    p: Option<u32>,
    c: Option<u32>,
    dklen: usize,
    #[serde(default = "default_prf")]
    prf: String,
    salt: String,
}

impl TryFrom<RawKdfParams> for KdfParams {
    type Error = String;

    fn try_from(raw: RawKdfParams) -> Result<Self, Self::Error> {
        match (raw.n, raw.r, raw.p, raw.c) {
            (Some(n), Some(r), Some(p), _) => Ok(KdfParams::Scrypt {
                n,
                r,
                p,
                dklen: raw.dklen,
                salt: raw.salt,
            }),
            (None, _, _, Some(c)) => Ok(KdfParams::Pbkdf2 {
                c,
                dklen: raw.dklen,
                prf: raw.prf,
                salt: raw.salt,
            }),
            _ => Err("kdfparams match neither scrypt nor pbkdf2".to_string()),
        }
    }
}

fn default_prf() -> String {
    PRF_HMAC_SHA256.to_string()
}

impl KdfParams {
    fn name(&self) -> &'static str {
        match self {
            KdfParams::Scrypt { .. } => "scrypt",
            KdfParams::Pbkdf2 { .. } => "pbkdf2",
        }
    }

    fn salt(&self) -> &str {
        match self {
            KdfParams::Scrypt { salt, .. } | KdfParams::Pbkdf2 { salt, .. } => salt,
        }
    }

    fn dklen(&self) -> usize {
        match self {
            KdfParams::Scrypt { dklen, .. } | KdfParams::Pbkdf2 { dklen, .. } => *dklen,
        }
    }

    fn key_derivation(&self) -> KeyDerivation {
        match self {
            KdfParams::Scrypt { n, r, p, .. } => KeyDerivation::scrypt(*n, *r, *p),
            KdfParams::Pbkdf2 { c, .. } => KeyDerivation::pbkdf2(*c),
        }
    }
}

/// Decoded binary fields of a structurally valid record.
struct RawParts {
    ciphertext: Vec<u8>,
    iv: Vec<u8>,
    salt: Vec<u8>,
    mac: Vec<u8>,
}

impl KeystoreRecord {
    pub fn from_json(raw: &str) -> Result<Self, WalletError> {
        serde_json::from_str(raw)
            .map_err(|e| WalletError::Decryption(format!("not a keystore record: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, WalletError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Structural checks only; nothing is decrypted.
    pub fn is_well_formed(&self) -> bool {
        self.raw_parts().is_ok()
    }

    /// Whether this record holds an HD extended key.
    pub fn is_extended_key_record(&self) -> bool {
        is_extended_key_address(&self.address)
    }

    /// Same record with its address in checksum case. Extended-key records
    /// are returned unchanged.
    pub fn normalized(mut self) -> Result<Self, WalletError> {
        if !self.address.is_empty() && !self.is_extended_key_record() {
            self.address = checksum(&parse_address(&self.address)?);
        }
        Ok(self)
    }

    fn raw_parts(&self) -> Result<RawParts, String> {
        if self.version != KEYSTORE_VERSION {
            return Err(format!("unsupported keystore version {}", self.version));
        }
        let crypto = &self.crypto;
        if crypto.cipher != CIPHER_AES_128_CTR {
            return Err(format!("unsupported cipher {}", crypto.cipher));
        }
        if crypto.kdf != crypto.kdfparams.name() {
            return Err(format!(
                "kdf {} does not match its parameters ({})",
                crypto.kdf,
                crypto.kdfparams.name()
            ));
        }
        match &crypto.kdfparams {
            KdfParams::Scrypt { n, .. } if *n < 2 || !n.is_power_of_two() => {
                return Err(format!("scrypt n must be a power of two, got {}", n));
            }
            KdfParams::Scrypt { n, r, p, .. }
                if *r == 0
                    || *p == 0
                    || u64::from(*r)
                        .checked_mul(u64::from(*n))
                        .and_then(|m| m.checked_mul(128))
                        .map_or(true, |m| m > MAX_SCRYPT_MEMORY) =>
            {
                return Err(format!("scrypt parameters out of range (n={}, r={}, p={})", n, r, p));
            }
            KdfParams::Pbkdf2 { prf, .. } if prf != PRF_HMAC_SHA256 => {
                return Err(format!("unsupported prf {}", prf));
            }
            KdfParams::Pbkdf2 { c, .. } if *c == 0 || *c > MAX_PBKDF2_ROUNDS => {
                return Err(format!("pbkdf2 iteration count out of range: {}", c));
            }
            _ => {}
        }
        let dklen = crypto.kdfparams.dklen();
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&dklen) {
            return Err(format!(
                "derived key length must be {}..={} bytes, got {}",
                MIN_KEY_LENGTH, MAX_KEY_LENGTH, dklen
            ));
        }

        let ciphertext = decode_hex("ciphertext", &crypto.ciphertext)?;
        let iv = decode_hex("iv", &crypto.cipherparams.iv)?;
        let salt = decode_hex("salt", crypto.kdfparams.salt())?;
        let mac = decode_hex("mac", &crypto.mac)?;

        if ciphertext.is_empty() {
            return Err("ciphertext is empty".to_string());
        }
        if iv.len() != IV_LEN {
            return Err(format!("iv must be {} bytes, got {}", IV_LEN, iv.len()));
        }
        if salt.is_empty() {
            return Err("salt is empty".to_string());
        }
        if mac.len() != MAC_LEN {
            return Err(format!("mac must be {} bytes, got {}", MAC_LEN, mac.len()));
        }
        Ok(RawParts { ciphertext, iv, salt, mac })
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, String> {
    hex::decode(value.trim_start_matches("0x")).map_err(|e| format!("{} is not hex: {}", field, e))
}

/// Structural validation of an arbitrary JSON value.
pub fn is_well_formed(value: &Value) -> bool {
    KeystoreRecord::deserialize(value)
        .map(|record| record.is_well_formed())
        .unwrap_or(false)
}

/// Whether an address string is an HD `xpub`.
pub fn is_extended_key_address(address: &str) -> bool {
    is_extended_public_key(address)
}

/// Encrypts and decrypts keystore records with a configured KDF.
#[derive(Debug, Clone, Default)]
pub struct KeystoreCodec {
    kdf: KdfConfig,
}

impl KeystoreCodec {
    pub fn new(kdf: KdfConfig) -> Self {
        Self { kdf }
    }

    pub fn kdf(&self) -> &KdfConfig {
        &self.kdf
    }

    /// Encrypts a raw secp256k1 private key.
    pub fn encrypt(&self, password: &[u8], private_key: &[u8]) -> Result<KeystoreRecord, WalletError> {
        if private_key.len() != PRIVATE_KEY_LEN {
            return Err(WalletError::InvalidInput(format!(
                "private key must be {} bytes, got {}",
                PRIVATE_KEY_LEN,
                private_key.len()
            )));
        }
        let key = SigningKey::from_slice(private_key)
            .map_err(|_| WalletError::InvalidInput("private key is out of range".to_string()))?;
        let address = checksum(&secret_key_to_address(&key));
        let record = self.encrypt_payload(password, private_key, address)?;
        info!("Encrypted keystore for {}", record.address);
        Ok(record)
    }

    /// Encrypts an HD extended key; the record's address is its `xpub`.
    pub fn encrypt_extended_key(
        &self,
        password: &[u8],
        key: &ExtendedKey,
    ) -> Result<KeystoreRecord, WalletError> {
        let xprv = key.to_xprv()?;
        let xpub = key.to_xpub()?;
        let record = self.encrypt_payload(password, xprv.as_bytes(), xpub)?;
        info!("Encrypted extended key record");
        Ok(record)
    }

    /// Recovers the private key. Wrong passwords fail with `InvalidPassword`.
    pub fn decrypt(
        &self,
        password: &[u8],
        record: &KeystoreRecord,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        if record.is_extended_key_record() {
            return Err(WalletError::Decryption(
                "record holds an extended key, not a private key".to_string(),
            ));
        }
        let plaintext = decrypt_payload(password, record)?;
        if plaintext.len() != PRIVATE_KEY_LEN {
            return Err(WalletError::Decryption(format!(
                "decrypted key has {} bytes",
                plaintext.len()
            )));
        }
        let key = SigningKey::from_slice(&plaintext)
            .map_err(|_| WalletError::Decryption("decrypted key is out of range".to_string()))?;

        if !record.address.is_empty() {
            let expected = parse_address(&record.address)
                .map_err(|_| WalletError::Decryption(format!("bad address {}", record.address)))?;
            if secret_key_to_address(&key) != expected {
                return Err(WalletError::Decryption(
                    "address does not match the decrypted key".to_string(),
                ));
            }
        }
        Ok(plaintext)
    }

    pub fn decrypt_extended_key(
        &self,
        password: &[u8],
        record: &KeystoreRecord,
    ) -> Result<ExtendedKey, WalletError> {
        if !record.is_extended_key_record() {
            return Err(WalletError::Decryption(
                "record does not hold an extended key".to_string(),
            ));
        }
        let plaintext = decrypt_payload(password, record)?;
        let xprv = std::str::from_utf8(&plaintext)
            .map_err(|_| WalletError::Decryption("extended key is not valid UTF-8".to_string()))?;
        let key = ExtendedKey::from_xprv(xprv)
            .map_err(|_| WalletError::Decryption("extended key does not parse".to_string()))?;
        if key.to_xpub()? != record.address {
            return Err(WalletError::Decryption(
                "xpub does not match the decrypted extended key".to_string(),
            ));
        }
        Ok(key)
    }

    fn encrypt_payload(
        &self,
        password: &[u8],
        plaintext: &[u8],
        address: String,
    ) -> Result<KeystoreRecord, WalletError> {
        let dklen = self.kdf.dklen();
        let salt = KeyDerivation::generate_salt(SALT_LEN);
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let kdf = KeyDerivation::from_config(&self.kdf);
        let derived = kdf.derive_key(password, &salt, dklen)?;

        let mut ciphertext = plaintext.to_vec();
        apply_cipher(&derived[..16], &iv, &mut ciphertext)?;
        let mac = compute_mac(&derived[16..32], &ciphertext);

        let kdfparams = match kdf.algorithm() {
            KDFAlgorithm::Scrypt { n, r, p } => KdfParams::Scrypt {
                n: *n,
                r: *r,
                p: *p,
                dklen,
                salt: hex::encode(&salt),
            },
            KDFAlgorithm::PBKDF2 { iterations } => KdfParams::Pbkdf2 {
                c: *iterations,
                dklen,
                prf: default_prf(),
                salt: hex::encode(&salt),
            },
        };
        debug!("Keystore encrypted with {}", kdfparams.name());

        Ok(KeystoreRecord {
            version: KEYSTORE_VERSION,
            id: Some(Uuid::new_v4().to_string()),
            address,
            crypto: CryptoSection {
                cipher: CIPHER_AES_128_CTR.to_string(),
                ciphertext: hex::encode(&ciphertext),
                cipherparams: CipherParams { iv: hex::encode(iv) },
                kdf: kdfparams.name().to_string(),
                kdfparams,
                mac: hex::encode(mac),
            },
        })
    }
}

fn decrypt_payload(password: &[u8], record: &KeystoreRecord) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    let parts = record.raw_parts().map_err(WalletError::Decryption)?;
    let params = &record.crypto.kdfparams;
    let derived = params
        .key_derivation()
        .derive_key(password, &parts.salt, params.dklen())?;

    let mac = compute_mac(&derived[16..32], &parts.ciphertext);
    if !bool::from(mac.as_slice().ct_eq(&parts.mac)) {
        warn!("Keystore MAC mismatch for {}", record.address);
        return Err(WalletError::InvalidPassword);
    }

    let mut plaintext = Zeroizing::new(parts.ciphertext);
    apply_cipher(&derived[..16], &parts.iv, &mut plaintext)?;
    Ok(plaintext)
}

fn apply_cipher(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), WalletError> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|e| WalletError::Crypto(format!("cipher init failed: {}", e)))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn compute_mac(mac_key: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(mac_key);
    hasher.update(ciphertext);
    hasher.finalize().into()
}
