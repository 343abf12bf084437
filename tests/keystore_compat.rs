//! Keystore interoperability through the public API.

use hd_vault::core::account::WalletAccount;
use hd_vault::core::config::KdfConfig;
use hd_vault::crypto::keystore::{self, KeystoreCodec, KeystoreRecord};
use hd_vault::WalletError;
use serde_json::{json, Value};

const VECTOR_KEY: &str = "7a28b5ba57c53603b0b07b56bba752f7784bf506fa95edc395f5cf6c7514fe9d";
const VECTOR_ADDRESS: &str = "0x008AeEda4D805471dF9b2A5B0f38A0C3bCBA786b";

fn vector(address: Option<&str>) -> Value {
    let mut value = json!({
        "crypto": {
            "cipher": "aes-128-ctr",
            "cipherparams": { "iv": "6087dab2f9fdbbfaddc31a909735c1e6" },
            "ciphertext": "5318b4d5bcd28de64ee5559e671353e16f075ecae9f99c7a79a38af5f869aa46",
            "kdf": "pbkdf2",
            "kdfparams": {
                "c": 262144,
                "dklen": 32,
                "prf": "hmac-sha256",
                "salt": "ae3cd4e7013836a3df6bd7241b12db061dbe2c6785853cce422d148a624ce0bd"
            },
            "mac": "517ead924a9d0dc3124507e3393d175ce3ff7c1e96529c6c555ce9e51205e9b2"
        },
        "id": "3198bc9c-6672-5ab3-d995-4942343ae5b6",
        "version": 3
    });
    if let Some(address) = address {
        value["address"] = json!(address);
    }
    value
}

#[tokio::test]
async fn lowercase_address_without_prefix_is_normalised() {
    let record: KeystoreRecord =
        serde_json::from_value(vector(Some("008aeeda4d805471df9b2a5b0f38a0c3bcba786b"))).unwrap();
    let account = WalletAccount::new(record, KeystoreCodec::default()).unwrap();
    assert_eq!(account.address(), VECTOR_ADDRESS);

    let key = account.get_private_key_string("testpassword").await.unwrap();
    assert_eq!(key.as_str(), format!("0x{}", VECTOR_KEY));
    assert!(!account.validate_password("testpasswort").await.unwrap());
}

#[test]
fn record_with_capitalised_crypto_key_parses() {
    let mut value = vector(None);
    let crypto = value.as_object_mut().unwrap().remove("crypto").unwrap();
    value["Crypto"] = crypto;
    assert!(keystore::is_well_formed(&value));
}

#[test]
fn structural_damage_is_not_a_password_error() {
    let codec = KeystoreCodec::default();

    let mut short_iv = vector(None);
    short_iv["crypto"]["cipherparams"]["iv"] = json!("6087dab2");
    assert!(!keystore::is_well_formed(&short_iv));
    let record: KeystoreRecord = serde_json::from_value(short_iv).unwrap();
    assert!(matches!(codec.decrypt(b"testpassword", &record), Err(WalletError::Decryption(_))));

    let wrong_address = vector(Some("0x9858EfFD232B4033E47d90003D41EC34EcaEda94"));
    let record: KeystoreRecord = serde_json::from_value(wrong_address).unwrap();
    assert!(matches!(codec.decrypt(b"testpassword", &record), Err(WalletError::Decryption(_))));
}

#[test]
fn unknown_cipher_and_version_are_rejected() {
    let mut cbc = vector(None);
    cbc["crypto"]["cipher"] = json!("aes-128-cbc");
    assert!(!keystore::is_well_formed(&cbc));

    let mut v2 = vector(None);
    v2["version"] = json!(2);
    assert!(!keystore::is_well_formed(&v2));

    assert!(!keystore::is_well_formed(&json!({ "address": VECTOR_ADDRESS })));
}

#[test]
fn exported_json_round_trips_through_other_codec_settings() {
    let key = hex::decode(VECTOR_KEY).unwrap();
    let record = KeystoreCodec::new(KdfConfig::scrypt(1024, 8, 1)).encrypt(b"pw", &key).unwrap();
    let json = record.to_json().unwrap();

    let parsed = KeystoreRecord::from_json(&json).unwrap();
    let decrypted = KeystoreCodec::new(KdfConfig::pbkdf2(1)).decrypt(b"pw", &parsed).unwrap();
    assert_eq!(decrypted.as_slice(), key.as_slice());
    assert_eq!(parsed.address, VECTOR_ADDRESS);
}
