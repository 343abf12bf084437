use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_PASSWORD_ENV: &str = "HD_VAULT_PASSWORD";
pub const DEFAULT_SOURCE_PASSWORD_ENV: &str = "HD_VAULT_SOURCE_PASSWORD";

/// Local keystore and signing tool for Ethereum accounts
#[derive(Debug, Parser)]
#[command(name = "hd-vault", version, about, disable_help_subcommand = true)]
pub struct Cli {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "hd-vault.toml")]
    pub config: PathBuf,

    /// Account store file, overriding `storage.path`
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Environment variable holding the wallet password
    #[arg(long, global = true, default_value = DEFAULT_PASSWORD_ENV)]
    pub password_env: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print a fresh BIP-39 mnemonic
    Mnemonic {
        #[arg(long, default_value_t = 12)]
        words: usize,
    },
    /// Store an HD key from a mnemonic and create its first account
    AddHd {
        /// Mnemonic phrase (quote it)
        #[arg(long)]
        mnemonic: String,
    },
    /// Encrypt a raw private key into a new account
    ImportKey {
        /// 0x-prefixed hex private key
        #[arg(long)]
        key: String,
    },
    /// Re-encrypt a v3 keystore file under the wallet password
    ImportKeystore {
        #[arg(long)]
        file: PathBuf,
        /// Environment variable holding the keystore file's own password
        #[arg(long, default_value = DEFAULT_SOURCE_PASSWORD_ENV)]
        source_password_env: String,
    },
    /// Add an address without a key
    Watch {
        #[arg(long)]
        address: String,
    },
    /// Derive the next HD account
    Generate,
    /// Add accounts from a connected Ledger
    #[cfg(feature = "ledger")]
    AddHardware {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 5)]
        limit: u32,
    },
    /// List accounts
    List,
    /// Sign a personal message
    SignMessage {
        #[arg(long)]
        address: String,
        /// UTF-8 text, or 0x-prefixed hex bytes
        #[arg(long)]
        message: String,
    },
    /// Sign a legacy transaction given as JSON
    SignTx {
        #[arg(long)]
        address: String,
        /// File with `{nonce, gasPrice, gasLimit, to, value, data, chainId}`
        #[arg(long)]
        tx: PathBuf,
    },
    /// Normalise provider transaction payloads (a JSON object or array)
    Normalize {
        #[arg(long)]
        input: PathBuf,
    },
}
