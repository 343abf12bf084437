use hd_vault::core::account::AccountKind;
use hd_vault::core::config::{KdfConfig, VaultConfig};
use hd_vault::core::tx::TransactionFields;
use hd_vault::core::vault::Vault;
use hd_vault::storage::{AccountStore, JsonFileStore};
use hd_vault::WalletError;
use ethers::types::U256;

const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn config(path: std::path::PathBuf) -> VaultConfig {
    let mut config = VaultConfig {
        kdf: KdfConfig::scrypt(1024, 8, 1),
        ..VaultConfig::default()
    };
    config.storage.path = path;
    config.chain.chain_id = Some(1);
    config
}

#[tokio::test]
async fn vault_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path().join("vault.json"));

    let (first, second) = {
        let store = JsonFileStore::open(&config.storage.path).await.unwrap();
        let mut vault = Vault::load(store, &config).await.unwrap();
        let first = vault.add_hd_wallet(PHRASE, "pw").await.unwrap();
        let second = vault.generate_account("pw").await.unwrap();
        vault
            .add_watch_only("0x7c59542b20002ed255598172cab48b86d865dfbb")
            .await
            .unwrap();
        (first, second)
    };

    let store = JsonFileStore::open(&config.storage.path).await.unwrap();
    assert_eq!(store.list_accounts().await.unwrap().len(), 4);

    let mut vault = Vault::load(store, &config).await.unwrap();
    assert_eq!(vault.len(), 3);
    assert_eq!(vault.hd_next_index(), Some(2));
    assert_eq!(vault.account(&first).unwrap().kind(), AccountKind::Keystore);

    let third = vault.generate_account("pw").await.unwrap();
    assert_ne!(third, first);
    assert_ne!(third, second);
    assert_eq!(vault.hd_next_index(), Some(3));
}

#[tokio::test]
async fn signing_uses_configured_chain_id() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path().join("vault.json"));
    let store = JsonFileStore::open(&config.storage.path).await.unwrap();
    let mut vault = Vault::load(store, &config).await.unwrap();

    let address = vault
        .add_private_key("0x4646464646464646464646464646464646464646464646464646464646464646", "pw")
        .await
        .unwrap();
    let fields = TransactionFields {
        nonce: U256::from(9),
        gas_price: U256::from(20_000_000_000u64),
        gas_limit: U256::from(21_000),
        to: Some("0x3535353535353535353535353535353535353535".to_string()),
        value: U256::exp10(18),
        ..TransactionFields::default()
    };
    let raw = vault.sign_transaction(&address, &fields, "pw").await.unwrap();
    assert_eq!(
        raw,
        "0xf86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
    );

    assert!(matches!(
        vault.sign_transaction(&address, &fields, "wrong").await,
        Err(WalletError::InvalidPassword)
    ));
}
