//! Ledger Ethereum app support.
//!
//! APDU framing and the app protocol are plain code; the USB transport
//! needs the `ledger` feature.

pub mod apdu;
pub mod eth_app;
pub mod hid;

pub use apdu::{ApduCommand, ApduExchange, ApduResponse, Bip32Path};
pub use eth_app::LedgerEthApp;
#[cfg(feature = "ledger")]
pub use hid::LedgerConnector;
