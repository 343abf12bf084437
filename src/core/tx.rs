//! Legacy transaction fields and the signature plumbing shared by local and
//! hardware signing.

use crate::core::address::parse_address;
use crate::core::errors::WalletError;
use ethers::types::{Address, Bytes, Signature, TransactionRequest, H256, U256};
use ethers::utils::hash_message;
use serde::{Deserialize, Serialize};

/// Unsigned legacy transaction as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFields {
    #[serde(default, with = "quantity")]
    pub nonce: U256,
    #[serde(default, with = "quantity")]
    pub gas_price: U256,
    #[serde(default, alias = "gas", with = "quantity")]
    pub gas_limit: U256,
    /// Recipient; `None` deploys a contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, with = "quantity")]
    pub value: U256,
    /// `0x`-prefixed call data.
    #[serde(default)]
    pub data: String,
    /// Enables EIP-155 replay protection when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

impl TransactionFields {
    pub fn with_chain_id(mut self, chain_id: Option<u64>) -> Self {
        if self.chain_id.is_none() {
            self.chain_id = chain_id;
        }
        self
    }

    pub fn to_request(&self) -> Result<TransactionRequest, WalletError> {
        let mut request = TransactionRequest::new()
            .nonce(self.nonce)
            .gas_price(self.gas_price)
            .gas(self.gas_limit)
            .value(self.value)
            .data(self.data_bytes()?);
        if let Some(to) = &self.to {
            request = request.to(parse_address(to)?);
        }
        if let Some(chain_id) = self.chain_id {
            eip155_base(chain_id)?;
            request = request.chain_id(chain_id);
        }
        Ok(request)
    }

    fn data_bytes(&self) -> Result<Bytes, WalletError> {
        let raw = self.data.trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        hex::decode(raw)
            .map(Bytes::from)
            .map_err(|e| WalletError::InvalidInput(format!("transaction data is not hex: {}", e)))
    }
}

/// Hash signed for `request`; includes the EIP-155 fields when a chain id is set.
pub fn signing_hash(request: &TransactionRequest) -> H256 {
    request.sighash()
}

/// Payload a signing device hashes itself.
pub fn unsigned_payload(request: &TransactionRequest) -> Vec<u8> {
    request.rlp().to_vec()
}

/// `0x`-prefixed raw transaction with the signature attached.
pub fn encode_signed(request: &TransactionRequest, signature: &Signature) -> String {
    format!("0x{}", hex::encode(request.rlp_signed(signature)))
}

/// `v` of recovery id 0 under EIP-155.
fn eip155_base(chain_id: u64) -> Result<u64, WalletError> {
    chain_id
        .checked_mul(2)
        .and_then(|v| v.checked_add(36))
        .map(|v| v - 1)
        .ok_or_else(|| WalletError::InvalidInput(format!("chain id {} is too large", chain_id)))
}

/// The on-chain `v` for a recovery id.
pub fn transaction_v(recovery_id: u8, chain_id: Option<u64>) -> Result<u64, WalletError> {
    match chain_id {
        Some(chain_id) => Ok(eip155_base(chain_id)? + u64::from(recovery_id & 1)),
        None => Ok(27 + u64::from(recovery_id & 1)),
    }
}

pub fn message_v(recovery_id: u8) -> u64 {
    27 + u64::from(recovery_id)
}

/// Recovery id implied by a `v` of any common convention.
pub fn recovery_id(v: u64, chain_id: Option<u64>) -> Result<u8, WalletError> {
    match v {
        0 | 1 => Ok(v as u8),
        27 | 28 => Ok((v - 27) as u8),
        _ => {
            let offset = match chain_id {
                Some(chain_id) => v.checked_sub(eip155_base(chain_id)?).filter(|o| *o <= 1),
                None => None,
            };
            offset
                .map(|o| o as u8)
                .ok_or_else(|| WalletError::Crypto(format!("unexpected signature v {}", v)))
        }
    }
}

pub fn signature_from_parts(r: &[u8], s: &[u8], v: u64) -> Result<Signature, WalletError> {
    if r.len() != 32 || s.len() != 32 {
        return Err(WalletError::Crypto("signature components must be 32 bytes".to_string()));
    }
    Ok(Signature {
        r: U256::from_big_endian(r),
        s: U256::from_big_endian(s),
        v,
    })
}

/// Signer address of `hash`, accepting any `v` convention.
pub fn recover_signer(signature: &Signature, hash: H256, chain_id: Option<u64>) -> Result<Address, WalletError> {
    let normalized = Signature {
        v: message_v(recovery_id(signature.v, chain_id)?),
        ..*signature
    };
    normalized
        .recover(hash)
        .map_err(|e| WalletError::Crypto(format!("signature recovery failed: {}", e)))
}

/// Message bytes: `0x` hex is decoded, anything else is taken as UTF-8.
pub fn message_bytes(message: &str) -> Vec<u8> {
    message
        .strip_prefix("0x")
        .filter(|body| !body.is_empty())
        .and_then(|body| hex::decode(body).ok())
        .unwrap_or_else(|| message.as_bytes().to_vec())
}

/// Personal-message hash with the `\x19Ethereum Signed Message:\n<len>` preamble.
pub fn personal_message_hash(message: &str) -> H256 {
    hash_message(message_bytes(message))
}

/// A personal-message signature with its components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub message: String,
    pub message_hash: String,
    pub signature: String,
    pub r: String,
    pub s: String,
    pub v: u64,
}

impl SignedMessage {
    pub fn new(message: &str, hash: H256, signature: &Signature) -> Self {
        Self {
            message: message.to_string(),
            message_hash: format!("{:?}", hash),
            signature: format!("0x{}", signature),
            r: word_hex(signature.r),
            s: word_hex(signature.s),
            v: signature.v,
        }
    }
}

fn word_hex(value: U256) -> String {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    format!("0x{}", hex::encode(buf))
}

/// Serde for quantities given as JSON numbers, decimal strings or `0x` hex.
pub mod quantity {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => parse(&n.to_string())
                .map_err(|_| D::Error::custom(format!("quantity must be a non-negative integer: {}", n))),
            Value::String(s) => parse(&s).map_err(D::Error::custom),
            Value::Null => Ok(U256::zero()),
            other => Err(D::Error::custom(format!("invalid quantity: {}", other))),
        }
    }

    pub fn parse(raw: &str) -> Result<U256, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(U256::zero());
        }
        match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) if hex.is_empty() => Ok(U256::zero()),
            Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| format!("{}: {}", raw, e)),
            None => U256::from_dec_str(raw).map_err(|e| format!("{}: {:?}", raw, e)),
        }
    }
}
