//! Request/reply contract between the signer and a hardware device.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Transport-level failures. These never leave [`super::signer::HardwareSigner`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no hardware device found")]
    NotFound,
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("request rejected on the device")]
    UserRejected,
    #[error("device did not answer in time")]
    Timeout,
    #[error("device returned status {0:#06x}")]
    Status(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device I/O error: {0}")]
    Io(String),
}

/// Raw `(v, r, s)` as returned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSignature {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl DeviceSignature {
    /// Parses the 65-byte `v ‖ r ‖ s` reply layout.
    pub fn from_vrs(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < 65 {
            return Err(TransportError::Protocol(format!(
                "signature reply has {} bytes, expected 65",
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[1..33]);
        s.copy_from_slice(&bytes[33..65]);
        Ok(Self { v: bytes[0], r, s })
    }
}

/// An open device session.
///
/// Paths are BIP-32 strings such as `44'/60'/0'/0/3`. Payloads are hex
/// without `0x`.
#[async_trait]
pub trait DeviceTransport: Send {
    async fn get_address(
        &mut self,
        path: &str,
        display: bool,
        chain_code: bool,
    ) -> Result<String, TransportError>;

    async fn sign_transaction(
        &mut self,
        path: &str,
        raw_tx_hex: &str,
    ) -> Result<DeviceSignature, TransportError>;

    async fn sign_personal_message(
        &mut self,
        path: &str,
        message_hex: &str,
    ) -> Result<DeviceSignature, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens device sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn DeviceTransport>, TransportError>;
}

/// Owns an open transport and closes it exactly once.
///
/// Prefer [`DeviceSession::close`]; if the session is dropped while still
/// open (for example when the owning future is cancelled) the close is
/// scheduled on the current tokio runtime.
pub struct DeviceSession {
    transport: Option<Box<dyn DeviceTransport>>,
}

impl DeviceSession {
    pub fn new(transport: Box<dyn DeviceTransport>) -> Self {
        Self { transport: Some(transport) }
    }

    pub fn transport(&mut self) -> Result<&mut (dyn DeviceTransport + 'static), TransportError> {
        self.transport
            .as_deref_mut()
            .ok_or_else(|| TransportError::Protocol("device session already closed".to_string()))
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        match self.transport.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.close().await {
                        warn!("Failed to close abandoned device session: {}", e);
                    }
                });
            }
            Err(_) => warn!("Device session dropped outside a runtime; transport left open"),
        }
    }
}
