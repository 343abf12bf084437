//! Canonical transaction model and provider payload normalisation.
//!
//! Two provider shapes are understood:
//! - native transfers: `{hash, from, to, value, input, timestamp, success}`
//!   with `value` already in human units;
//! - token transfers: `{transactionHash, from, to, value, timestamp,
//!   tokenInfo, decimals}` with `value` in the token's smallest unit.
//!
//! A payload is a token transfer when it carries `tokenInfo` or `decimals`.

use crate::core::address::to_checksum_address;
use crate::core::errors::WalletError;
use crate::core::token::{format_amount, parse_amount, value_to_decimal_string, Token};
use chrono::{DateTime, TimeZone, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    /// Human units.
    pub value: String,
    /// Smallest units.
    pub raw_value: String,
    pub data: String,
    pub timestamp: i64,
    pub date: DateTime<Utc>,
    pub state: TxState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
}

impl Transaction {
    /// A locally submitted transaction that is not yet confirmed.
    pub fn pending(
        hash: &str,
        from: &str,
        to: Option<&str>,
        raw_value: U256,
        data: &str,
        token: Option<Token>,
        native_decimals: u32,
    ) -> Result<Self, WalletError> {
        let decimals = token.as_ref().map_or(native_decimals, |t| t.decimals);
        let date = Utc::now();
        Ok(Self {
            hash: Some(hash.to_string()),
            from: to_checksum_address(from)?,
            to: to.map(to_checksum_address).transpose()?,
            value: format_amount(raw_value, decimals),
            raw_value: raw_value.to_string(),
            data: data.to_string(),
            timestamp: date.timestamp(),
            date,
            state: TxState::Pending,
            token,
        })
    }

    pub fn is_token_transfer(&self) -> bool {
        self.token.is_some()
    }
}

/// Converts provider payloads into [`Transaction`]s.
#[derive(Debug, Clone, Copy)]
pub struct TransactionNormalizer {
    native_decimals: u32,
}

impl Default for TransactionNormalizer {
    fn default() -> Self {
        Self::new(crate::core::token::DEFAULT_DECIMALS)
    }
}

fn invalid(msg: impl Into<String>) -> WalletError {
    WalletError::Normalization(msg.into())
}

impl TransactionNormalizer {
    pub fn new(native_decimals: u32) -> Self {
        Self { native_decimals }
    }

    pub fn native_decimals(&self) -> u32 {
        self.native_decimals
    }

    pub fn is_token_transfer(payload: &Value) -> bool {
        payload.get("tokenInfo").is_some() || payload.get("decimals").is_some()
    }

    pub fn normalize(&self, payload: &Value) -> Result<Transaction, WalletError> {
        if !payload.is_object() {
            return Err(invalid("transaction payload must be an object"));
        }
        let token = if Self::is_token_transfer(payload) {
            let source = payload.get("tokenInfo").filter(|v| v.is_object()).unwrap_or(payload);
            let mut token = Token::from_value(source)
                .map_err(|e| invalid(format!("token transfer without usable token: {}", e)))?;
            if source.get("decimals").is_none() {
                token.decimals = crate::core::token::parse_decimals(payload.get("decimals"));
            }
            Some(token)
        } else {
            None
        };

        let raw_amount = payload
            .get("value")
            .and_then(value_to_decimal_string)
            .ok_or_else(|| invalid("missing value"))?;
        let raw_value = match &token {
            Some(token) => U256::from_dec_str(&raw_amount)
                .map_err(|_| invalid(format!("token value is not an integer: {}", raw_amount)))?,
            None => parse_amount(&raw_amount, self.native_decimals).map_err(invalid)?,
        };
        let decimals = token.as_ref().map_or(self.native_decimals, |t| t.decimals);

        let timestamp = timestamp(payload.get("timestamp"))?;
        let date = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| invalid(format!("timestamp out of range: {}", timestamp)))?;

        let tx = Transaction {
            hash: text(payload, "transactionHash").or_else(|| text(payload, "hash")),
            from: address(payload, "from")?.ok_or_else(|| invalid("missing from address"))?,
            to: address(payload, "to")?,
            value: format_amount(raw_value, decimals),
            raw_value: raw_value.to_string(),
            data: text(payload, "input").unwrap_or_else(|| "0x".to_string()),
            timestamp,
            date,
            state: state(payload),
            token,
        };
        debug!("Normalized transaction {:?}", tx.hash);
        Ok(tx)
    }

    /// Normalises every payload; the first failure aborts.
    pub fn normalize_all(&self, payloads: &[Value]) -> Result<Vec<Transaction>, WalletError> {
        payloads.iter().map(|p| self.normalize(p)).collect()
    }
}

fn text(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn address(payload: &Value, key: &str) -> Result<Option<String>, WalletError> {
    text(payload, key)
        .map(|raw| to_checksum_address(&raw).map_err(|_| invalid(format!("bad {} address: {}", key, raw))))
        .transpose()
}

fn timestamp(value: Option<&Value>) -> Result<i64, WalletError> {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid("missing or invalid timestamp"))
}

/// `success` (bool) or an etherscan-style `isError` flag; records without
/// either come from confirmed history and count as successful.
fn state(payload: &Value) -> TxState {
    let failed = match (payload.get("success"), payload.get("isError")) {
        (Some(Value::Bool(ok)), _) => !ok,
        (_, Some(Value::String(flag))) => flag == "1",
        (_, Some(Value::Number(flag))) => flag.as_u64() == Some(1),
        _ => false,
    };
    if failed {
        TxState::Failed
    } else {
        TxState::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn native() -> Value {
        json!({
            "from": "0x4bd5c3e7e4d6b3df23e9da5b42e5e4daa3d2579b",
            "hash": "0x902aa048c9fee4cc01f0533457009cdce6a172ea9eee5005617ae4ca3fc5fd04",
            "input": "0x",
            "success": true,
            "timestamp": 1525898092,
            "to": "0x7c59542b20002ed255598172cab48b86d865dfbb",
            "value": 0.00000915
        })
    }

    fn token_transfer() -> Value {
        json!({
            "from": "0x4bd5c3e7e4d6b3df23e9da5b42e5e4daa3d2579b",
            "timestamp": 1525898092,
            "to": "0x7c59542b20002ed255598172cab48b86d865dfbb",
            "tokenInfo": {
                "address": "0xe41d2489571d322189246dafa5ebde1f4699f498",
                "name": "0x Protocol Token",
                "decimals": 18
            },
            "decimals": 18,
            "symbol": "ZRX",
            "transactionHash": "0xf7c725deba56e300787afcf569c3a6d04e7eb7a71861328ea35e86cd0acb8189",
            "type": "transfer",
            "value": "22245335081606680213"
        })
    }

    #[test]
    fn test_native_transfer() {
        let tx = TransactionNormalizer::default().normalize(&native()).unwrap();
        assert_eq!(tx.value, "0.00000915");
        assert_eq!(tx.raw_value, "9150000000000");
        assert_eq!(tx.data, "0x");
        assert_eq!(tx.date.year(), 2018);
        assert_eq!(tx.state, TxState::Success);
        assert_eq!(tx.from, "0x4bD5c3E7E4D6b3dF23e9DA5B42E5e4dAa3D2579b");
        assert!(tx.token.is_none());
    }

    #[test]
    fn test_token_transfer_is_exact() {
        let tx = TransactionNormalizer::default().normalize(&token_transfer()).unwrap();
        assert_eq!(tx.value, "22.245335081606680213");
        assert_eq!(tx.raw_value, "22245335081606680213");
        assert_eq!(tx.state, TxState::Success);
        assert_eq!(
            tx.hash.as_deref(),
            Some("0xf7c725deba56e300787afcf569c3a6d04e7eb7a71861328ea35e86cd0acb8189")
        );
        let token = tx.token.unwrap();
        assert_eq!(token.decimals, 18);
        assert_eq!(token.address, "0xE41d2489571d322189246DaFA5ebDe1F4699F498");
    }

    #[test]
    fn test_numeric_values_keep_full_precision() {
        let normalizer = TransactionNormalizer::default();

        let native: Value = serde_json::from_str(
            r#"{"from": "0x4bd5c3e7e4d6b3df23e9da5b42e5e4daa3d2579b", "timestamp": 1525898092, "value": 1.123456789012345678}"#,
        )
        .unwrap();
        let tx = normalizer.normalize(&native).unwrap();
        assert_eq!(tx.raw_value, "1123456789012345678");
        assert_eq!(tx.value, "1.123456789012345678");

        let mut token = token_transfer();
        token["value"] = serde_json::from_str("22245335081606680213").unwrap();
        let tx = normalizer.normalize(&token).unwrap();
        assert_eq!(tx.raw_value, "22245335081606680213");
        assert_eq!(tx.value, "22.245335081606680213");
    }

    #[test]
    fn test_token_decimals_from_definition() {
        let mut payload = token_transfer();
        payload["tokenInfo"]["decimals"] = json!("6");
        payload["value"] = json!("1500000");
        let tx = TransactionNormalizer::default().normalize(&payload).unwrap();
        assert_eq!(tx.value, "1.5");
    }

    #[test]
    fn test_native_decimals_are_configurable() {
        let mut payload = native();
        payload["value"] = json!("1.5");
        let tx = TransactionNormalizer::new(8).normalize(&payload).unwrap();
        assert_eq!(tx.raw_value, "150000000");
    }

    #[test]
    fn test_failed_flags() {
        let mut payload = native();
        payload["success"] = json!(false);
        assert_eq!(TransactionNormalizer::default().normalize(&payload).unwrap().state, TxState::Failed);

        let mut payload = native();
        payload.as_object_mut().unwrap().remove("success");
        payload["isError"] = json!("1");
        assert_eq!(TransactionNormalizer::default().normalize(&payload).unwrap().state, TxState::Failed);
    }

    #[test]
    fn test_unrecognized_payloads() {
        let normalizer = TransactionNormalizer::default();
        assert!(matches!(normalizer.normalize(&json!([])), Err(WalletError::Normalization(_))));

        let mut no_value = native();
        no_value.as_object_mut().unwrap().remove("value");
        assert!(matches!(normalizer.normalize(&no_value), Err(WalletError::Normalization(_))));

        let mut bad_time = native();
        bad_time["timestamp"] = json!("yesterday");
        assert!(matches!(normalizer.normalize(&bad_time), Err(WalletError::Normalization(_))));

        let mut tokenless = token_transfer();
        tokenless.as_object_mut().unwrap().remove("tokenInfo");
        assert!(matches!(normalizer.normalize(&tokenless), Err(WalletError::Normalization(_))));
    }

    #[test]
    fn test_pending() {
        let tx = Transaction::pending(
            "0xabc",
            "0x4bd5c3e7e4d6b3df23e9da5b42e5e4daa3d2579b",
            None,
            U256::exp10(18),
            "0x",
            None,
            18,
        )
        .unwrap();
        assert_eq!(tx.state, TxState::Pending);
        assert_eq!(tx.value, "1");
        assert!(tx.to.is_none());
        assert_eq!(serde_json::to_value(&tx).unwrap()["state"], json!("pending"));
    }
}
