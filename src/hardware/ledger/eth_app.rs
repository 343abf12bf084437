//! Ledger Ethereum app over any APDU exchange.

use super::apdu::{chunk_payload, ApduCommand, ApduExchange, Bip32Path, EthInstruction};
use crate::hardware::transport::{DeviceSignature, DeviceTransport, TransportError};
use async_trait::async_trait;
use tracing::{debug, info};

/// Ethereum app configuration reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfiguration {
    pub flags: u8,
    pub version: String,
}

pub struct LedgerEthApp<E: ApduExchange> {
    exchange: E,
}

impl<E: ApduExchange> LedgerEthApp<E> {
    pub fn new(exchange: E) -> Self {
        Self { exchange }
    }

    pub async fn configuration(&mut self) -> Result<AppConfiguration, TransportError> {
        let command = ApduCommand::new(EthInstruction::GetConfiguration, 0x00, 0x00, Vec::new());
        let data = self.exchange.exchange(&command).await?.into_result()?;
        if data.len() < 4 {
            return Err(TransportError::Protocol("configuration reply too short".to_string()));
        }
        Ok(AppConfiguration {
            flags: data[0],
            version: format!("{}.{}.{}", data[1], data[2], data[3]),
        })
    }

    /// Sends `payload` in chunks; the reply to the last chunk is returned.
    async fn send_chunked(&mut self, ins: EthInstruction, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let chunks = chunk_payload(payload);
        let total = chunks.len();
        let mut reply = Vec::new();
        for (i, (p1, data)) in chunks.into_iter().enumerate() {
            debug!("Sending chunk {}/{}", i + 1, total);
            let command = ApduCommand::new(ins, p1, 0x00, data);
            reply = self.exchange.exchange(&command).await?.into_result()?;
        }
        Ok(reply)
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, TransportError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| TransportError::Protocol(format!("{} is not hex: {}", field, e)))
}

/// `pklen ‖ pubkey ‖ addrlen ‖ ascii address [‖ chain code]`.
fn parse_address_reply(data: &[u8]) -> Result<String, TransportError> {
    let short = || TransportError::Protocol("address reply truncated".to_string());
    let pk_len = *data.first().ok_or_else(short)? as usize;
    let addr_len_at = 1 + pk_len;
    let addr_len = *data.get(addr_len_at).ok_or_else(short)? as usize;
    let addr = data
        .get(addr_len_at + 1..addr_len_at + 1 + addr_len)
        .ok_or_else(short)?;
    let addr = std::str::from_utf8(addr)
        .map_err(|_| TransportError::Protocol("address reply is not ASCII".to_string()))?;
    Ok(format!("0x{}", addr.trim_start_matches("0x")))
}

#[async_trait]
impl<E: ApduExchange> DeviceTransport for LedgerEthApp<E> {
    async fn get_address(
        &mut self,
        path: &str,
        display: bool,
        chain_code: bool,
    ) -> Result<String, TransportError> {
        let path = Bip32Path::parse(path)?;
        let command = ApduCommand::new(
            EthInstruction::GetAddress,
            u8::from(display),
            u8::from(chain_code),
            path.to_bytes(),
        );
        let data = self.exchange.exchange(&command).await?.into_result()?;
        parse_address_reply(&data)
    }

    async fn sign_transaction(
        &mut self,
        path: &str,
        raw_tx_hex: &str,
    ) -> Result<DeviceSignature, TransportError> {
        let mut payload = Bip32Path::parse(path)?.to_bytes();
        payload.extend(decode_hex("transaction", raw_tx_hex)?);
        info!("Sending transaction to Ledger ({} bytes)", payload.len());
        let reply = self.send_chunked(EthInstruction::SignTransaction, &payload).await?;
        DeviceSignature::from_vrs(&reply)
    }

    async fn sign_personal_message(
        &mut self,
        path: &str,
        message_hex: &str,
    ) -> Result<DeviceSignature, TransportError> {
        let message = decode_hex("message", message_hex)?;
        let len = u32::try_from(message.len())
            .map_err(|_| TransportError::Protocol("message too long".to_string()))?;
        let mut payload = Bip32Path::parse(path)?.to_bytes();
        payload.extend_from_slice(&len.to_be_bytes());
        payload.extend_from_slice(&message);
        info!("Sending personal message to Ledger ({} bytes)", message.len());
        let reply = self.send_chunked(EthInstruction::SignPersonalMessage, &payload).await?;
        DeviceSignature::from_vrs(&reply)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.exchange.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ledger::apdu::{ApduResponse, P1_FIRST_CHUNK, P1_MORE_CHUNK};
    use std::collections::VecDeque;

    /// Replays canned replies and records every command.
    struct Scripted {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<ApduCommand>,
        closed: bool,
    }

    impl Scripted {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self { replies: replies.into(), sent: Vec::new(), closed: false }
        }
    }

    #[async_trait]
    impl ApduExchange for Scripted {
        async fn exchange(&mut self, command: &ApduCommand) -> Result<ApduResponse, TransportError> {
            self.sent.push(command.clone());
            let reply = self.replies.pop_front().ok_or(TransportError::Timeout)?;
            ApduResponse::from_bytes(&reply)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed = true;
            Ok(())
        }
    }

    fn ok(mut data: Vec<u8>) -> Vec<u8> {
        data.extend_from_slice(&[0x90, 0x00]);
        data
    }

    fn vrs(v: u8) -> Vec<u8> {
        let mut data = vec![v];
        data.extend_from_slice(&[0x11; 32]);
        data.extend_from_slice(&[0x22; 32]);
        ok(data)
    }

    #[tokio::test]
    async fn test_get_address() {
        let mut reply = vec![65];
        reply.extend_from_slice(&[0x04; 65]);
        let addr = b"9858effd232b4033e47d90003d41ec34ecaeda94";
        reply.push(addr.len() as u8);
        reply.extend_from_slice(addr);

        let mut app = LedgerEthApp::new(Scripted::new(vec![ok(reply)]));
        let address = app.get_address("44'/60'/0'/0/0", true, false).await.unwrap();
        assert_eq!(address, "0x9858effd232b4033e47d90003d41ec34ecaeda94");

        let sent = &app.exchange.sent[0];
        assert_eq!((sent.cla, sent.ins, sent.p1, sent.p2), (0xE0, 0x02, 0x01, 0x00));
        assert_eq!(sent.data[0], 5);
    }

    #[tokio::test]
    async fn test_truncated_address_reply() {
        let mut app = LedgerEthApp::new(Scripted::new(vec![ok(vec![65, 0x04])]));
        assert!(matches!(
            app.get_address("44'/60'/0'/0/0", false, false).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_transaction_chunks() {
        let tx = hex::encode(vec![0xAB; 300]);
        let mut app = LedgerEthApp::new(Scripted::new(vec![ok(vec![]), vrs(0x25)]));
        let sig = app.sign_transaction("44'/60'/0'/0/0", &tx).await.unwrap();
        assert_eq!(sig.v, 0x25);
        assert_eq!(sig.r, [0x11; 32]);
        assert_eq!(sig.s, [0x22; 32]);

        let sent = &app.exchange.sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].ins, 0x04);
        assert_eq!(sent[0].p1, P1_FIRST_CHUNK);
        assert_eq!(sent[1].p1, P1_MORE_CHUNK);
        // 21 path bytes + 300 tx bytes
        assert_eq!(sent[0].data.len() + sent[1].data.len(), 321);
    }

    #[tokio::test]
    async fn test_sign_personal_message_layout() {
        let mut app = LedgerEthApp::new(Scripted::new(vec![vrs(0x1b)]));
        let sig = app
            .sign_personal_message("44'/60'/0'/0/0", &hex::encode("hello"))
            .await
            .unwrap();
        assert_eq!(sig.v, 27);

        let data = &app.exchange.sent[0].data;
        assert_eq!(app.exchange.sent[0].ins, 0x08);
        assert_eq!(&data[21..25], &[0, 0, 0, 5]);
        assert_eq!(&data[25..], b"hello");
    }

    #[tokio::test]
    async fn test_user_rejection() {
        let mut app = LedgerEthApp::new(Scripted::new(vec![vec![0x69, 0x85]]));
        assert!(matches!(
            app.sign_personal_message("44'/60'/0'/0/0", "00").await,
            Err(TransportError::UserRejected)
        ));
        app.close().await.unwrap();
        assert!(app.exchange.closed);
    }

    #[tokio::test]
    async fn test_configuration() {
        let mut app = LedgerEthApp::new(Scripted::new(vec![ok(vec![0x01, 1, 10, 3])]));
        let config = app.configuration().await.unwrap();
        assert_eq!(config.version, "1.10.3");
        assert_eq!(config.flags, 1);
    }
}
