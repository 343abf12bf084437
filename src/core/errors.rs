use thiserror::Error;

/// User-facing text for any hardware device failure.
pub const DEVICE_ACCESS_MESSAGE: &str =
    "An error occurred while getting access to hardware device. Please, try again.";

/// User-facing text for a failed password check.
pub const INVALID_PASSWORD_MESSAGE: &str = "Invalid password";

/// Error type for keystore, derivation, signing and normalisation operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Malformed construction arguments (missing address, bad key length, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// MAC verification failed while decrypting a keystore.
    #[error("Invalid password")]
    InvalidPassword,
    /// The keystore record is structurally corrupt and cannot be decrypted.
    #[error("Decryption error: {0}")]
    Decryption(String),
    /// The operation is not supported by this account variant.
    #[error("Access denied: {0}")]
    AccessDenied(String),
    /// Seed phrase failed to parse or its checksum word is wrong.
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    /// Any hardware transport failure. The text is always user-safe.
    #[error("{0}")]
    DeviceAccess(String),
    /// A provider payload did not match any known shape.
    #[error("Normalization error: {0}")]
    Normalization(String),
    /// BIP-32 derivation failure.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),
    /// Low-level cryptographic failure (KDF parameters, signing backend).
    #[error("Crypto error: {0}")]
    Crypto(String),
    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Persistent store errors.
    #[error("Storage error: {0}")]
    Storage(String),
    /// Resource not found errors.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// The uniform hardware failure.
    pub fn device_access() -> Self {
        Self::DeviceAccess(DEVICE_ACCESS_MESSAGE.to_string())
    }

    /// Text that is safe to show to the end user.
    pub fn user_message(&self) -> String {
        match self {
            WalletError::InvalidPassword => INVALID_PASSWORD_MESSAGE.to_string(),
            WalletError::DeviceAccess(_) => DEVICE_ACCESS_MESSAGE.to_string(),
            WalletError::Decryption(_) => {
                "The stored keystore is damaged and cannot be decrypted".to_string()
            }
            WalletError::Internal(_) => "Unexpected internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Errors involving key material or its integrity.
    pub fn is_critical(&self) -> bool {
        matches!(self, WalletError::Decryption(_) | WalletError::Crypto(_))
    }

    /// Errors where repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::DeviceAccess(_))
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        WalletError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for WalletError {
    fn from(err: toml::de::Error) -> Self {
        WalletError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for WalletError {
    fn from(err: tokio::task::JoinError) -> Self {
        WalletError::Internal(format!("background task failed: {}", err))
    }
}
