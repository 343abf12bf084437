// src/main.rs
//! hd-vault command line entry point.
use anyhow::{Context, Result};
use clap::Parser;
use hd_vault::cli::{Cli, Commands};
use hd_vault::core::bip44::generate_mnemonic;
use hd_vault::core::config::VaultConfig;
use hd_vault::core::transaction::TransactionNormalizer;
use hd_vault::core::tx::TransactionFields;
use hd_vault::core::vault::Vault;
use hd_vault::storage::JsonFileStore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = VaultConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(store) = &cli.store {
        config.storage.path = store.clone();
    }

    run(cli, config).await
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn read_password(var: &str) -> Result<SecretString> {
    let value = std::env::var(var).with_context(|| format!("password variable {} is not set", var))?;
    Ok(SecretString::new(value))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_vault(config: &VaultConfig) -> Result<Vault<JsonFileStore>> {
    let store = JsonFileStore::open(&config.storage.path).await?;
    let vault = Vault::load(store, config).await?;

    #[cfg(feature = "ledger")]
    let vault = {
        use hd_vault::hardware::{ledger::LedgerConnector, HardwareSigner};
        use std::sync::Arc;
        let signer = HardwareSigner::new(
            Arc::new(LedgerConnector::default()),
            &config.derivation,
            &config.hardware,
        );
        vault.with_hardware(Arc::new(signer))
    };

    Ok(vault)
}

async fn run(cli: Cli, config: VaultConfig) -> Result<()> {
    match cli.command {
        Commands::Mnemonic { words } => {
            let phrase = generate_mnemonic(words)?;
            println!("{}", phrase.as_str());
        }
        Commands::Normalize { input } => {
            let raw = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let payload: Value = serde_json::from_str(&raw)?;
            let normalizer = TransactionNormalizer::new(config.chain.native_decimals);
            match payload {
                Value::Array(items) => print_json(&normalizer.normalize_all(&items)?)?,
                single => print_json(&normalizer.normalize(&single)?)?,
            }
        }
        command => {
            let mut vault = open_vault(&config).await?;
            run_vault_command(&mut vault, command, &cli.password_env).await?;
        }
    }
    Ok(())
}

async fn run_vault_command(vault: &mut Vault<JsonFileStore>, command: Commands, password_env: &str) -> Result<()> {
    match command {
        Commands::AddHd { mnemonic } => {
            let password = read_password(password_env)?;
            let address = vault.add_hd_wallet(&mnemonic, password.expose_secret()).await?;
            info!("HD wallet added");
            println!("{}", address);
        }
        Commands::ImportKey { key } => {
            let password = read_password(password_env)?;
            println!("{}", vault.add_private_key(&key, password.expose_secret()).await?);
        }
        Commands::ImportKeystore { file, source_password_env } => {
            let json = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let source = read_password(&source_password_env)?;
            let password = read_password(password_env)?;
            let address = vault
                .import_keystore(&json, source.expose_secret(), password.expose_secret())
                .await?;
            println!("{}", address);
        }
        Commands::Watch { address } => {
            println!("{}", vault.add_watch_only(&address).await?);
        }
        Commands::Generate => {
            let password = read_password(password_env)?;
            println!("{}", vault.generate_account(password.expose_secret()).await?);
        }
        #[cfg(feature = "ledger")]
        Commands::AddHardware { offset, limit } => {
            for address in vault.add_hardware_accounts(offset, limit).await? {
                println!("{}", address);
            }
        }
        Commands::List => {
            let accounts: Vec<Value> = vault
                .accounts()
                .map(|account| json!({ "address": account.address(), "kind": account.kind() }))
                .collect();
            print_json(&json!({
                "accounts": accounts,
                "hdKey": vault.has_hd_key(),
                "nextIndex": vault.hd_next_index(),
            }))?;
        }
        Commands::SignMessage { address, message } => {
            let password = read_password(password_env).unwrap_or_else(|_| SecretString::new(String::new()));
            print_json(&vault.sign_message(&address, &message, password.expose_secret()).await?)?;
        }
        Commands::SignTx { address, tx } => {
            let raw = tokio::fs::read_to_string(&tx)
                .await
                .with_context(|| format!("failed to read {}", tx.display()))?;
            let fields: TransactionFields = serde_json::from_str(&raw).context("invalid transaction JSON")?;
            let password = read_password(password_env).unwrap_or_else(|_| SecretString::new(String::new()));
            println!("{}", vault.sign_transaction(&address, &fields, password.expose_secret()).await?);
        }
        Commands::Mnemonic { .. } | Commands::Normalize { .. } => {
            anyhow::bail!("mnemonic and normalize run without a vault");
        }
    }
    Ok(())
}
