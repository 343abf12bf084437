//! Checksum-cased (EIP-55) address helpers.

use crate::core::errors::WalletError;
use ethers::types::Address;
use ethers::utils::to_checksum;
use std::str::FromStr;

/// Parses a hex address with or without `0x`, in any casing.
pub fn parse_address(raw: &str) -> Result<Address, WalletError> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WalletError::InvalidInput(format!("not a 20-byte hex address: {}", raw)));
    }
    Address::from_str(hex_part)
        .map_err(|e| WalletError::InvalidInput(format!("invalid address {}: {}", raw, e)))
}

/// Returns the `0x`-prefixed EIP-55 form of `raw`.
pub fn to_checksum_address(raw: &str) -> Result<String, WalletError> {
    Ok(checksum(&parse_address(raw)?))
}

pub fn checksum(address: &Address) -> String {
    to_checksum(address, None)
}

pub fn is_valid_address(raw: &str) -> bool {
    parse_address(raw).is_ok()
}
