// src/lib.rs
//! Local keystore and transaction-signing core for an Ethereum wallet.
//!
//! - [`crypto::keystore`]: Web3 v3 keystore encryption
//! - [`core::bip44`]: BIP-39/BIP-32 HD derivation
//! - [`core::account`]: password-gated signing accounts
//! - [`hardware`]: hardware wallet signing over a device transport
//! - [`core::transaction`]: provider payload normalisation
//! - [`core::vault`]: the persisted wallet set

pub mod cli;
pub mod core;
pub mod crypto;
pub mod hardware;
pub mod storage;

pub use crate::core::errors::WalletError;
