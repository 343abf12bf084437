//! Hardware-backed signing.
//!
//! Every call opens a fresh device session, runs its requests, and closes the
//! session before returning, whatever the outcome. Only one session is open
//! at a time; concurrent callers wait their turn. Transport errors are logged
//! and replaced by the uniform [`WalletError::device_access`] error.

use crate::core::address::{checksum, parse_address};
use crate::core::config::{DerivationConfig, HardwareConfig};
use crate::core::errors::WalletError;
use crate::core::tx::{
    encode_signed, message_bytes, message_v, personal_message_hash, signing_hash, transaction_v,
    unsigned_payload, SignedMessage, TransactionFields,
};
use crate::hardware::transport::{
    DeviceSession, DeviceSignature, DeviceTransport, TransportConnector, TransportError,
};
use ethers::types::{Address, Signature, H256, U256};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct HardwareSigner {
    connector: Arc<dyn TransportConnector>,
    path_prefix: String,
    batch_limit: u32,
    session_lock: Mutex<()>,
}

impl HardwareSigner {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        derivation: &DerivationConfig,
        hardware: &HardwareConfig,
    ) -> Self {
        Self {
            connector,
            path_prefix: derivation.hardware_path.clone(),
            batch_limit: hardware.batch_limit,
            session_lock: Mutex::new(()),
        }
    }

    pub fn with_defaults(connector: Arc<dyn TransportConnector>) -> Self {
        Self::new(connector, &DerivationConfig::default(), &HardwareConfig::default())
    }

    /// Device path of account `index`.
    pub fn path(&self, index: u32) -> String {
        format!("{}{}", self.path_prefix, index)
    }

    pub fn batch_limit(&self) -> u32 {
        self.batch_limit
    }

    async fn run<T, F>(&self, op: F) -> Result<T, WalletError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut (dyn DeviceTransport + 'static)) -> BoxFuture<'a, Result<T, TransportError>>,
    {
        let _turn = self.session_lock.lock().await;

        let transport = self.connector.open().await.map_err(|e| {
            error!("Failed to open hardware device: {}", e);
            WalletError::device_access()
        })?;
        let mut session = DeviceSession::new(transport);
        debug!("Device session opened");

        let result = match session.transport() {
            Ok(transport) => op(transport).await,
            Err(e) => Err(e),
        };

        if let Err(e) = session.close().await {
            warn!("Failed to close device session: {}", e);
        }
        debug!("Device session closed");

        result.map_err(|e| {
            error!("Hardware device request failed: {}", e);
            WalletError::device_access()
        })
    }

    /// Addresses for indices `offset..offset + limit`, in index order.
    pub async fn list_addresses(&self, offset: u32, limit: u32) -> Result<Vec<String>, WalletError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if limit > self.batch_limit {
            return Err(WalletError::InvalidInput(format!(
                "at most {} addresses can be requested at once",
                self.batch_limit
            )));
        }
        let end = offset
            .checked_add(limit)
            .filter(|end| *end <= 0x8000_0000)
            .ok_or_else(|| WalletError::InvalidInput("address index out of range".to_string()))?;

        let paths: Vec<String> = (offset..end).map(|index| self.path(index)).collect();
        let addresses = self
            .run(move |transport| {
                Box::pin(async move {
                    let mut addresses = Vec::with_capacity(paths.len());
                    for path in &paths {
                        let raw = transport.get_address(path, false, false).await?;
                        addresses.push(device_address(&raw)?);
                    }
                    Ok(addresses)
                })
            })
            .await?;

        info!("Read {} addresses from hardware device starting at {}", addresses.len(), offset);
        Ok(addresses.iter().map(checksum).collect())
    }

    pub async fn address(&self, index: u32) -> Result<String, WalletError> {
        let mut addresses = self.list_addresses(index, 1).await?;
        addresses
            .pop()
            .ok_or_else(|| WalletError::Internal("device returned no address".to_string()))
    }

    /// Personal-message signature with `v` in {27, 28}.
    pub async fn sign_message(&self, message: &str, index: u32) -> Result<SignedMessage, WalletError> {
        let hash = personal_message_hash(message);
        let path = self.path(index);
        let message_hex = hex::encode(message_bytes(message));

        let (signer, raw) = self
            .run(move |transport| {
                Box::pin(async move {
                    let signer = device_address(&transport.get_address(&path, false, false).await?)?;
                    let raw = transport.sign_personal_message(&path, &message_hex).await?;
                    Ok((signer, raw))
                })
            })
            .await?;

        let recid = resolve_recovery_id(&raw, hash, signer, message_recovery_hint(raw.v))?;
        let signature = assemble(&raw, message_v(recid));
        info!("Message signed on hardware device (index {})", index);
        Ok(SignedMessage::new(message, hash, &signature))
    }

    /// Signs a legacy transaction on the device and returns the raw `0x` hex.
    pub async fn sign_transaction(&self, fields: &TransactionFields, index: u32) -> Result<String, WalletError> {
        let request = fields.to_request()?;
        let hash = signing_hash(&request);
        let chain_id = fields.chain_id;
        let path = self.path(index);
        let payload_hex = hex::encode(unsigned_payload(&request));

        let (signer, raw) = self
            .run(move |transport| {
                Box::pin(async move {
                    let signer = device_address(&transport.get_address(&path, false, false).await?)?;
                    let raw = transport.sign_transaction(&path, &payload_hex).await?;
                    Ok((signer, raw))
                })
            })
            .await?;

        let recid = resolve_recovery_id(&raw, hash, signer, transaction_recovery_hint(raw.v, chain_id))?;
        let signature = assemble(&raw, transaction_v(recid, chain_id)?);
        info!("Transaction signed on hardware device (index {})", index);
        Ok(encode_signed(&request, &signature))
    }
}

fn device_address(raw: &str) -> Result<Address, TransportError> {
    parse_address(raw).map_err(|_| TransportError::Protocol(format!("device returned bad address {:?}", raw)))
}

fn assemble(raw: &DeviceSignature, v: u64) -> Signature {
    Signature {
        r: U256::from_big_endian(&raw.r),
        s: U256::from_big_endian(&raw.s),
        v,
    }
}

/// Recovery id suggested by a message signature's `v` byte.
pub fn message_recovery_hint(v: u8) -> u8 {
    match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => other & 1,
    }
}

/// Recovery id suggested by a transaction signature's `v` byte.
///
/// Devices may report 0/1, 27/28, or the EIP-155 `v` cut to its low byte.
/// The EIP-155 reading wins when it fits.
pub fn transaction_recovery_hint(v: u8, chain_id: Option<u64>) -> u8 {
    if let Some(chain_id) = chain_id {
        let base = chain_id.wrapping_mul(2).wrapping_add(35) as u8;
        let offset = v.wrapping_sub(base);
        if offset <= 1 {
            return offset;
        }
    }
    message_recovery_hint(v)
}

/// Confirms the recovery id by recovering the signer, trying the other
/// parity when the hint is wrong.
fn resolve_recovery_id(
    raw: &DeviceSignature,
    hash: H256,
    expected: Address,
    hint: u8,
) -> Result<u8, WalletError> {
    for recid in [hint, hint ^ 1] {
        if let Ok(address) = assemble(raw, message_v(recid)).recover(hash) {
            if address == expected {
                if recid != hint {
                    warn!("Device recovery id disagreed with its signature; corrected");
                }
                return Ok(recid);
            }
        }
    }
    error!("Device signature does not recover to {}", checksum(&expected));
    Err(WalletError::device_access())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bip44::{master_key, seed_from_mnemonic};
    use crate::hardware::emulator::{FailureMode, RecoveryConvention, SoftwareDevice};
    use test_case::test_case;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn device() -> SoftwareDevice {
        let seed = seed_from_mnemonic(PHRASE, "").unwrap();
        SoftwareDevice::new(master_key(seed.as_ref()).unwrap())
    }

    #[test_case(0, None => 0)]
    #[test_case(28, None => 1)]
    #[test_case(37, Some(1) => 0)]
    #[test_case(38, Some(1) => 1)]
    #[test_case(0, Some(1) => 0)]
    #[test_case(27, Some(1) => 0)]
    // 35 + 2 * 137 = 309, low byte 53
    #[test_case(54, Some(137) => 1)]
    fn test_transaction_hint(v: u8, chain_id: Option<u64>) -> u8 {
        transaction_recovery_hint(v, chain_id)
    }

    #[tokio::test]
    async fn test_list_addresses_in_order() {
        let device = device();
        let stats = device.stats();
        let signer = HardwareSigner::with_defaults(Arc::new(device));

        let addresses = signer.list_addresses(0, 10).await.unwrap();
        assert_eq!(addresses.len(), 10);
        assert_eq!(addresses[0], "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
        assert_eq!(stats.opened(), 1);
        assert_eq!(stats.closed(), 1);

        let second = signer.list_addresses(1, 1).await.unwrap();
        assert_eq!(second[0], addresses[1]);
    }

    #[tokio::test]
    async fn test_limit_bounds() {
        let device = device();
        let stats = device.stats();
        let signer = HardwareSigner::with_defaults(Arc::new(device));

        assert!(signer.list_addresses(0, 0).await.unwrap().is_empty());
        assert!(matches!(
            signer.list_addresses(0, 11).await,
            Err(WalletError::InvalidInput(_))
        ));
        assert_eq!(stats.opened(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_uniform_and_close() {
        let device = device().failing(FailureMode::Reject);
        let stats = device.stats();
        let signer = HardwareSigner::with_defaults(Arc::new(device));

        let err = signer.sign_message("hi", 0).await.unwrap_err();
        assert!(matches!(err, WalletError::DeviceAccess(_)));
        assert_eq!(err.to_string(), crate::core::errors::DEVICE_ACCESS_MESSAGE);
        assert_eq!(stats.opened(), 1);
        assert_eq!(stats.closed(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let signer = HardwareSigner::with_defaults(Arc::new(device().unreachable()));
        assert!(matches!(signer.address(0).await, Err(WalletError::DeviceAccess(_))));
    }

    #[test_case(RecoveryConvention::Raw)]
    #[test_case(RecoveryConvention::Legacy)]
    #[test_case(RecoveryConvention::Eip155Truncated)]
    fn test_message_v_is_canonical(convention: RecoveryConvention) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let signer = HardwareSigner::with_defaults(Arc::new(device().with_convention(convention)));
            let signed = signer.sign_message("hello", 0).await.unwrap();
            assert!(signed.v == 27 || signed.v == 28);
            let sig: Signature = signed.signature.parse().unwrap();
            assert_eq!(
                checksum(&sig.recover("hello").unwrap()),
                "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
            );
        });
    }
}
