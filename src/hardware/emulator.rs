//! Software device speaking the transport contract.
//!
//! Signs with an in-process HD key the way a hardware wallet would, with a
//! selectable recovery-id convention and injectable failures. Session
//! open/close counts are exposed for leak checks.

use crate::core::bip44::{derive_path, ExtendedKey};
use crate::core::tx::recovery_id;
use crate::hardware::transport::{DeviceSignature, DeviceTransport, TransportConnector, TransportError};
use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::{Signature, TransactionRequest, H256};
use ethers::utils::{hash_message, keccak256, rlp::Rlp, secret_key_to_address};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How the device reports `v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryConvention {
    /// 0 or 1.
    Raw,
    /// 27 or 28.
    Legacy,
    /// Low byte of the EIP-155 `v` for transactions, 27/28 for messages.
    Eip155Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Refuse,
    Reject,
    Timeout,
    Garbage,
}

impl FailureMode {
    fn error(self) -> TransportError {
        match self {
            FailureMode::Refuse => TransportError::ConnectionRefused("device is locked".to_string()),
            FailureMode::Reject => TransportError::UserRejected,
            FailureMode::Timeout => TransportError::Timeout,
            FailureMode::Garbage => TransportError::Protocol("unexpected reply".to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    requests: AtomicUsize,
}

impl SessionStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Connector producing emulated sessions over one master key.
pub struct SoftwareDevice {
    master: ExtendedKey,
    convention: RecoveryConvention,
    failure: Option<FailureMode>,
    fail_on_open: bool,
    stats: Arc<SessionStats>,
}

impl SoftwareDevice {
    pub fn new(master: ExtendedKey) -> Self {
        Self {
            master,
            convention: RecoveryConvention::Legacy,
            failure: None,
            fail_on_open: false,
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn with_convention(mut self, convention: RecoveryConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Every request fails with `mode`.
    pub fn failing(mut self, mode: FailureMode) -> Self {
        self.failure = Some(mode);
        self
    }

    /// Opening a session fails.
    pub fn unreachable(mut self) -> Self {
        self.fail_on_open = true;
        self
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl TransportConnector for SoftwareDevice {
    async fn open(&self) -> Result<Box<dyn DeviceTransport>, TransportError> {
        if self.fail_on_open {
            return Err(TransportError::NotFound);
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EmulatedSession {
            master: self.master.clone(),
            convention: self.convention,
            failure: self.failure,
            stats: self.stats.clone(),
        }))
    }
}

struct EmulatedSession {
    master: ExtendedKey,
    convention: RecoveryConvention,
    failure: Option<FailureMode>,
    stats: Arc<SessionStats>,
}

impl EmulatedSession {
    fn begin(&self) -> Result<(), TransportError> {
        self.stats.requests.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(mode) => Err(mode.error()),
            None => Ok(()),
        }
    }

    fn wallet(&self, path: &str) -> Result<LocalWallet, TransportError> {
        let full = format!("m/{}", path.trim_start_matches("m/"));
        let key = derive_path(&self.master, &full)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(LocalWallet::from(key.signing_key().clone()))
    }

    fn sign(&self, path: &str, hash: H256) -> Result<(Signature, u8), TransportError> {
        let sig = self
            .wallet(path)?
            .sign_hash(hash)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let recid = recovery_id(sig.v, None).map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok((sig, recid))
    }
}

fn to_device(sig: &Signature, v: u8) -> DeviceSignature {
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    sig.r.to_big_endian(&mut r);
    sig.s.to_big_endian(&mut s);
    DeviceSignature { v, r, s }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, TransportError> {
    hex::decode(value.trim_start_matches("0x")).map_err(|e| TransportError::Protocol(e.to_string()))
}

#[async_trait]
impl DeviceTransport for EmulatedSession {
    async fn get_address(
        &mut self,
        path: &str,
        _display: bool,
        _chain_code: bool,
    ) -> Result<String, TransportError> {
        self.begin()?;
        let key = self.wallet(path)?;
        Ok(format!("{:?}", secret_key_to_address(key.signer())))
    }

    async fn sign_transaction(
        &mut self,
        path: &str,
        raw_tx_hex: &str,
    ) -> Result<DeviceSignature, TransportError> {
        self.begin()?;
        let payload = decode_hex(raw_tx_hex)?;
        let request = TransactionRequest::decode_unsigned_rlp(&Rlp::new(&payload))
            .map_err(|e| TransportError::Protocol(format!("bad transaction: {}", e)))?;
        let (sig, recid) = self.sign(path, H256::from(keccak256(&payload)))?;
        let v = match (self.convention, request.chain_id) {
            (RecoveryConvention::Raw, _) => recid,
            (RecoveryConvention::Eip155Truncated, Some(chain_id)) => {
                chain_id.as_u64().wrapping_mul(2).wrapping_add(35 + u64::from(recid)) as u8
            }
            _ => 27 + recid,
        };
        Ok(to_device(&sig, v))
    }

    async fn sign_personal_message(
        &mut self,
        path: &str,
        message_hex: &str,
    ) -> Result<DeviceSignature, TransportError> {
        self.begin()?;
        let message = decode_hex(message_hex)?;
        let (sig, recid) = self.sign(path, hash_message(message))?;
        let v = match self.convention {
            RecoveryConvention::Raw => recid,
            _ => 27 + recid,
        };
        Ok(to_device(&sig, v))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
