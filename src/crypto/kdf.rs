use crate::core::config::KdfConfig;
use crate::core::errors::WalletError;
use pbkdf2::pbkdf2_hmac;
use scrypt::Params;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

/// Accepted derived key lengths in bytes.
pub const MIN_KEY_LENGTH: usize = 32;
pub const MAX_KEY_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KDFAlgorithm {
    PBKDF2 { iterations: u32 },
    Scrypt { n: u32, r: u32, p: u32 },
}

/// Password-based key derivation for keystore encryption.
#[derive(Debug, Clone)]
pub struct KeyDerivation {
    algorithm: KDFAlgorithm,
}

impl KeyDerivation {
    pub fn new(algorithm: KDFAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn pbkdf2(iterations: u32) -> Self {
        Self::new(KDFAlgorithm::PBKDF2 { iterations })
    }

    pub fn scrypt(n: u32, r: u32, p: u32) -> Self {
        Self::new(KDFAlgorithm::Scrypt { n, r, p })
    }

    pub fn from_config(config: &KdfConfig) -> Self {
        match config {
            KdfConfig::Scrypt { n, r, p, .. } => Self::scrypt(*n, *r, *p),
            KdfConfig::Pbkdf2 { c, .. } => Self::pbkdf2(*c),
        }
    }

    pub fn algorithm(&self) -> &KDFAlgorithm {
        &self.algorithm
    }

    pub fn derive_key(
        &self,
        password: &[u8],
        salt: &[u8],
        key_length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        debug!("Deriving key with length {} bytes", key_length);
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&key_length) {
            return Err(WalletError::Crypto(format!(
                "derived key length must be {}..={} bytes, got {}",
                MIN_KEY_LENGTH, MAX_KEY_LENGTH, key_length
            )));
        }

        match &self.algorithm {
            KDFAlgorithm::PBKDF2 { iterations } => {
                self.derive_pbkdf2(password, salt, *iterations, key_length)
            }
            KDFAlgorithm::Scrypt { n, r, p } => {
                self.derive_scrypt(password, salt, *n, *r, *p, key_length)
            }
        }
    }

    fn derive_pbkdf2(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        debug!("Using PBKDF2 with {} iterations", iterations);
        if iterations == 0 {
            return Err(WalletError::Crypto("PBKDF2 iteration count must be positive".to_string()));
        }

        let mut key = Zeroizing::new(vec![0u8; key_length]);
        pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
        Ok(key)
    }

    fn derive_scrypt(
        &self,
        password: &[u8],
        salt: &[u8],
        n: u32,
        r: u32,
        p: u32,
        key_length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        debug!("Using Scrypt with parameters N={}, r={}, p={}", n, r, p);

        if n < 2 || !n.is_power_of_two() {
            return Err(WalletError::Crypto(format!(
                "Scrypt N must be a power of two greater than 1, got {}",
                n
            )));
        }
        let log_n = n.trailing_zeros() as u8;
        let params = Params::new(log_n, r, p, key_length)
            .map_err(|e| WalletError::Crypto(format!("Invalid Scrypt parameters: {}", e)))?;

        let mut key = Zeroizing::new(vec![0u8; key_length]);
        scrypt::scrypt(password, salt, &params, &mut key)
            .map_err(|e| WalletError::Crypto(format!("Scrypt derivation failed: {}", e)))?;
        Ok(key)
    }

    pub fn generate_salt(length: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut salt = vec![0u8; length];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self::from_config(&KdfConfig::default())
    }
}
