//! ERC-20 token model and exact decimal amount helpers.

use crate::core::address::to_checksum_address;
use crate::core::errors::WalletError;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_DECIMALS: u32 = 18;

/// Largest power of ten that fits in 256 bits.
pub const MAX_DECIMALS: u32 = 77;

/// Converts a human-readable decimal string to smallest units.
///
/// Fails on signs, exponents, or more fractional digits than `decimals`
/// (trailing zeros excepted).
pub fn parse_amount(amount: &str, decimals: u32) -> Result<U256, String> {
    let amount = amount.trim();
    let (int_part, frac_part) = amount.split_once('.').unwrap_or((amount, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("not a decimal amount: {:?}", amount));
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return Err(format!("not a decimal amount: {:?}", amount));
    }
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.len() > decimals as usize {
        return Err(format!("{} has more than {} fractional digits", amount, decimals));
    }
    let digits = format!("{}{:0<width$}", int_part, frac_part, width = decimals as usize);
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_dec_str(digits).map_err(|_| format!("{} overflows 256 bits", amount))
}

/// Formats smallest units as a decimal string with trailing zeros trimmed.
pub fn format_amount(raw: U256, decimals: u32) -> String {
    let digits = raw.to_string();
    if decimals == 0 {
        return digits;
    }
    let width = decimals as usize + 1;
    let padded = format!("{:0>width$}", digits, width = width);
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals as usize);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}

/// JSON number or string as written. Numbers keep their source digits and
/// exponent notation is expanded to a plain decimal.
pub(crate) fn value_to_decimal_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => {
            let text = n.to_string();
            Some(expand_exponent(&text).unwrap_or(text))
        }
        _ => None,
    }
}

/// Largest exponent expanded; anything beyond overflows 256 bits anyway.
const MAX_EXPONENT: i64 = 100;

fn expand_exponent(text: &str) -> Option<String> {
    let Some(at) = text.find(|c| c == 'e' || c == 'E') else {
        return Some(text.to_string());
    };
    let exponent: i64 = text[at + 1..].parse().ok()?;
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }
    let mantissa = &text[..at];
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() || !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits = format!("{}{}", int_part, frac_part);
    let point = int_part.len() as i64 + exponent;
    Some(if point <= 0 {
        format!("0.{}{}", "0".repeat(point.unsigned_abs() as usize), digits)
    } else if point as usize >= digits.len() {
        format!("{}{}", digits, "0".repeat(point as usize - digits.len()))
    } else {
        format!("{}.{}", &digits[..point as usize], &digits[point as usize..])
    })
}

/// Decimals as a leading-integer parse; anything unusable gives the default.
pub fn parse_decimals(value: Option<&Value>) -> u32 {
    let parsed = match value {
        Some(Value::Number(n)) => leading_integer(&n.to_string()),
        Some(Value::String(s)) => leading_integer(s),
        _ => None,
    };
    parsed
        .and_then(|d| u32::try_from(d).ok())
        .filter(|d| *d <= MAX_DECIMALS)
        .unwrap_or(DEFAULT_DECIMALS)
}

fn leading_integer(text: &str) -> Option<u64> {
    let digits: String = text.trim_start().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: String,
    pub decimals: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    /// Balance in smallest units.
    pub balance: String,
}

impl Token {
    pub fn new(address: &str, decimals: u32) -> Result<Self, WalletError> {
        if decimals > MAX_DECIMALS {
            return Err(WalletError::InvalidInput(format!("unsupported token decimals {}", decimals)));
        }
        Ok(Self {
            address: to_checksum_address(address)?,
            decimals,
            symbol: None,
            name: None,
            logo: None,
            balance: "0".to_string(),
        })
    }

    /// Builds a token from a provider object (`address`, `decimals`,
    /// `symbol`, `name`, `logo`, `balance`).
    pub fn from_value(value: &Value) -> Result<Self, WalletError> {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let address = text("address")
            .ok_or_else(|| WalletError::InvalidInput("Token can't be created without address".to_string()))?;
        let mut token = Token::new(&address, parse_decimals(value.get("decimals")))?;
        token.symbol = text("symbol").map(|s| s.to_uppercase());
        token.name = text("name");
        token.logo = text("logo");
        if let Some(balance) = value.get("balance").and_then(value_to_decimal_string) {
            if !balance.is_empty() {
                token.balance = balance;
            }
        }
        Ok(token)
    }

    /// Balance divided by `10^decimals`.
    pub fn human_balance(&self) -> Result<String, WalletError> {
        let raw = U256::from_dec_str(&self.balance)
            .map_err(|_| WalletError::InvalidInput(format!("token balance is not an integer: {}", self.balance)))?;
        Ok(format_amount(raw, self.decimals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("0.00000915", 18 => "9150000000000")]
    #[test_case("22.245335081606680213", 18 => "22245335081606680213")]
    #[test_case("1", 0 => "1")]
    #[test_case("1.500", 2 => "150")]
    #[test_case(".5", 1 => "5")]
    #[test_case("0", 18 => "0")]
    fn test_parse_amount(amount: &str, decimals: u32) -> String {
        parse_amount(amount, decimals).unwrap().to_string()
    }

    #[test_case("1.234", 2)]
    #[test_case("-1", 18)]
    #[test_case("1e5", 18)]
    #[test_case("", 18)]
    #[test_case(".", 18)]
    fn test_parse_amount_rejects(amount: &str, decimals: u32) {
        assert!(parse_amount(amount, decimals).is_err());
    }

    #[test_case("22245335081606680213", 18 => "22.245335081606680213")]
    #[test_case("9150000000000", 18 => "0.00000915")]
    #[test_case("1000000000000000000", 18 => "1")]
    #[test_case("0", 18 => "0")]
    #[test_case("12345", 0 => "12345")]
    #[test_case("5", 3 => "0.005")]
    fn test_format_amount(raw: &str, decimals: u32) -> String {
        format_amount(U256::from_dec_str(raw).unwrap(), decimals)
    }

    #[test]
    fn test_large_values_are_exact() {
        let raw = U256::MAX;
        let human = format_amount(raw, 18);
        assert_eq!(parse_amount(&human, 18).unwrap(), raw);
    }

    #[test]
    fn test_token_requires_address() {
        let err = Token::from_value(&json!({ "symbol": "zrx" })).unwrap_err();
        assert!(matches!(err, WalletError::InvalidInput(_)));
    }

    #[test]
    fn test_token_defaults() {
        let token = Token::from_value(&json!({
            "address": "0xe41d2489571d322189246dafa5ebde1f4699f498",
            "decimals": "abc",
            "symbol": "zrx",
            "name": "0x Protocol Token"
        }))
        .unwrap();
        assert_eq!(token.address, "0xE41d2489571d322189246DaFA5ebDe1F4699F498");
        assert_eq!(token.decimals, 18);
        assert_eq!(token.symbol.as_deref(), Some("ZRX"));
        assert_eq!(token.balance, "0");
    }

    #[test_case(json!(6) => 6)]
    #[test_case(json!("8") => 8)]
    #[test_case(json!("12px") => 12)]
    #[test_case(json!(0) => 0)]
    #[test_case(json!(8.0) => 8)]
    #[test_case(json!(-3) => 18)]
    #[test_case(json!(null) => 18)]
    #[test_case(json!("-2") => 18)]
    #[test_case(json!(500) => 18)]
    fn test_decimals_parsing(value: Value) -> u32 {
        parse_decimals(Some(&value))
    }

    #[test]
    fn test_human_balance() {
        let mut token = Token::new("0xe41d2489571d322189246dafa5ebde1f4699f498", 6).unwrap();
        token.balance = "1234567".to_string();
        assert_eq!(token.human_balance().unwrap(), "1.234567");
        token.balance = "1.5".to_string();
        assert!(token.human_balance().is_err());
    }

    #[test]
    fn test_number_formatting_avoids_exponent() {
        assert_eq!(value_to_decimal_string(&json!(0.00000915)).unwrap(), "0.00000915");
        assert_eq!(value_to_decimal_string(&json!(42)).unwrap(), "42");
        let parsed: Value = serde_json::from_str("[9.15e-6, 1.5E3, 25e-1]").unwrap();
        let expanded: Vec<_> = parsed.as_array().unwrap().iter().filter_map(value_to_decimal_string).collect();
        assert_eq!(expanded, vec!["0.00000915", "1500", "2.5"]);
    }

    #[test]
    fn test_numbers_keep_every_digit() {
        let parsed: Value =
            serde_json::from_str(r#"{"native": 1.123456789012345678, "token": 22245335081606680213}"#).unwrap();
        let native = value_to_decimal_string(&parsed["native"]).unwrap();
        assert_eq!(native, "1.123456789012345678");
        assert_eq!(parse_amount(&native, 18).unwrap(), U256::from(1_123_456_789_012_345_678u64));
        assert_eq!(value_to_decimal_string(&parsed["token"]).unwrap(), "22245335081606680213");
    }

}
