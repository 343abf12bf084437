pub mod account;
pub mod address;
pub mod bip44;
pub mod config;
pub mod errors;
pub mod token;
pub mod transaction;
pub mod tx;
pub mod vault;

pub use account::{Account, AccountKind, SigningContext, WalletAccount};
pub use bip44::{ExtendedKey, HdWallet, KeyPair};
pub use config::VaultConfig;
pub use errors::WalletError;
pub use token::Token;
pub use transaction::{Transaction, TransactionNormalizer, TxState};
pub use tx::{SignedMessage, TransactionFields};
pub use vault::Vault;
