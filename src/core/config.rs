use crate::core::errors::WalletError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Key derivation settings used when encrypting new keystores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kdf", rename_all = "lowercase")]
pub enum KdfConfig {
    Scrypt {
        #[serde(default = "KdfConfig::default_scrypt_n")]
        n: u32,
        #[serde(default = "KdfConfig::default_scrypt_r")]
        r: u32,
        #[serde(default = "KdfConfig::default_scrypt_p")]
        p: u32,
        #[serde(default = "KdfConfig::default_dklen")]
        dklen: usize,
    },
    Pbkdf2 {
        #[serde(default = "KdfConfig::default_pbkdf2_c")]
        c: u32,
        #[serde(default = "KdfConfig::default_dklen")]
        dklen: usize,
    },
}

impl KdfConfig {
    fn default_scrypt_n() -> u32 { 8192 }
    fn default_scrypt_r() -> u32 { 8 }
    fn default_scrypt_p() -> u32 { 1 }
    fn default_pbkdf2_c() -> u32 { 262_144 }
    fn default_dklen() -> usize { 32 }

    pub fn scrypt(n: u32, r: u32, p: u32) -> Self {
        Self::Scrypt { n, r, p, dklen: Self::default_dklen() }
    }

    pub fn pbkdf2(c: u32) -> Self {
        Self::Pbkdf2 { c, dklen: Self::default_dklen() }
    }

    pub fn dklen(&self) -> usize {
        match self {
            KdfConfig::Scrypt { dklen, .. } | KdfConfig::Pbkdf2 { dklen, .. } => *dklen,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self::scrypt(
            Self::default_scrypt_n(),
            Self::default_scrypt_r(),
            Self::default_scrypt_p(),
        )
    }
}

/// Derivation path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivationConfig {
    /// Parent path of HD accounts; child `i` is derived below it.
    #[serde(default = "DerivationConfig::default_hd_path")]
    pub hd_path: String,
    /// Prefix for hardware accounts; the index is appended verbatim.
    #[serde(default = "DerivationConfig::default_hardware_path")]
    pub hardware_path: String,
}

impl DerivationConfig {
    fn default_hd_path() -> String { "m/44'/60'/0'/0".to_string() }
    fn default_hardware_path() -> String { "44'/60'/0'/0/".to_string() }
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            hd_path: Self::default_hd_path(),
            hardware_path: Self::default_hardware_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Upper bound for a single `list_addresses` batch.
    #[serde(default = "HardwareConfig::default_batch_limit")]
    pub batch_limit: u32,
}

impl HardwareConfig {
    fn default_batch_limit() -> u32 { 10 }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self { batch_limit: Self::default_batch_limit() }
    }
}

/// Chain conventions that vary across networks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "ChainConfig::default_native_decimals")]
    pub native_decimals: u32,
    /// EIP-155 chain id; pre-EIP-155 signatures when absent.
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl ChainConfig {
    fn default_native_decimals() -> u32 { 18 }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            native_decimals: Self::default_native_decimals(),
            chain_id: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_path")]
    pub path: PathBuf,
}

impl StorageConfig {
    fn default_path() -> PathBuf { PathBuf::from("hd-vault.json") }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: Self::default_path() }
    }
}

/// Vault configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub kdf: KdfConfig,
    #[serde(default)]
    pub derivation: DerivationConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl VaultConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, WalletError> {
        Ok(toml::from_str(raw)?)
    }

    /// Reads a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        if !path.exists() {
            debug!("config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
