//! Hardware wallet integration.

pub mod emulator;
pub mod ledger;
pub mod signer;
pub mod transport;

pub use signer::HardwareSigner;
pub use transport::{DeviceSignature, DeviceTransport, TransportConnector, TransportError};
