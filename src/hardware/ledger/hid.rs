//! Ledger HID framing and the USB transport.
//!
//! An APDU travels as 64-byte reports: channel (2), tag (1), sequence (2),
//! then on the first report a 2-byte total length, then data.

use crate::hardware::transport::TransportError;

pub const LEDGER_VENDOR_ID: u16 = 0x2C97;
pub const LEDGER_USAGE_PAGE: u16 = 0xFFA0;

pub const HID_PACKET_SIZE: usize = 64;
const CHANNEL: u16 = 0x0101;
const TAG_APDU: u8 = 0x05;
const FIRST_HEADER: usize = 7;
const NEXT_HEADER: usize = 5;
const MAX_PACKETS: u16 = 128;

/// Splits a serialized APDU into HID reports.
pub fn wrap_apdu(apdu: &[u8]) -> Result<Vec<[u8; HID_PACKET_SIZE]>, TransportError> {
    let total = u16::try_from(apdu.len())
        .map_err(|_| TransportError::Protocol("APDU exceeds HID frame limit".to_string()))?;
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut sequence = 0u16;

    loop {
        let mut packet = [0u8; HID_PACKET_SIZE];
        packet[0..2].copy_from_slice(&CHANNEL.to_be_bytes());
        packet[2] = TAG_APDU;
        packet[3..5].copy_from_slice(&sequence.to_be_bytes());

        let header = if sequence == 0 {
            packet[5..7].copy_from_slice(&total.to_be_bytes());
            FIRST_HEADER
        } else {
            NEXT_HEADER
        };
        let take = (HID_PACKET_SIZE - header).min(apdu.len() - offset);
        packet[header..header + take].copy_from_slice(&apdu[offset..offset + take]);
        offset += take;
        packets.push(packet);
        sequence += 1;

        if offset >= apdu.len() {
            return Ok(packets);
        }
    }
}

/// Reassembles a reply from HID reports.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    expected: Option<usize>,
    data: Vec<u8>,
    sequence: u16,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one report. Returns the complete reply once all bytes arrived;
    /// reports for other channels are ignored.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if packet.len() < FIRST_HEADER {
            return Err(TransportError::Protocol("HID report too short".to_string()));
        }
        if u16::from_be_bytes([packet[0], packet[1]]) != CHANNEL || packet[2] != TAG_APDU {
            return Ok(None);
        }
        let sequence = u16::from_be_bytes([packet[3], packet[4]]);
        if sequence != self.sequence {
            return Err(TransportError::Protocol(format!(
                "HID sequence mismatch: expected {}, got {}",
                self.sequence, sequence
            )));
        }
        if sequence >= MAX_PACKETS {
            return Err(TransportError::Protocol("HID reply too long".to_string()));
        }

        if sequence == 0 {
            self.expected = Some(u16::from_be_bytes([packet[5], packet[6]]) as usize);
            self.data.extend_from_slice(&packet[FIRST_HEADER..]);
        } else {
            self.data.extend_from_slice(&packet[NEXT_HEADER..]);
        }
        self.sequence += 1;

        match self.expected {
            Some(len) if self.data.len() >= len => {
                let mut data = std::mem::take(&mut self.data);
                data.truncate(len);
                Ok(Some(data))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(feature = "ledger")]
pub use usb::{HidExchange, LedgerConnector};

#[cfg(feature = "ledger")]
mod usb {
    use super::*;
    use crate::hardware::ledger::apdu::{ApduCommand, ApduExchange, ApduResponse};
    use crate::hardware::ledger::eth_app::LedgerEthApp;
    use crate::hardware::transport::{DeviceTransport, TransportConnector};
    use async_trait::async_trait;
    use hidapi::{HidApi, HidDevice};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::{debug, info, warn};

    /// APDU exchange over a USB HID device.
    pub struct HidExchange {
        device: Arc<Mutex<HidDevice>>,
        timeout: Duration,
    }

    impl HidExchange {
        pub fn new(device: HidDevice, timeout: Duration) -> Self {
            Self {
                device: Arc::new(Mutex::new(device)),
                timeout,
            }
        }
    }

    fn io(e: impl std::fmt::Display) -> TransportError {
        TransportError::Io(e.to_string())
    }

    fn exchange_blocking(device: &HidDevice, apdu: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        for packet in wrap_apdu(apdu)? {
            // report id 0 prefix
            let mut report = Vec::with_capacity(HID_PACKET_SIZE + 1);
            report.push(0x00);
            report.extend_from_slice(&packet);
            device.write(&report).map_err(io)?;
        }

        let mut assembler = ResponseAssembler::new();
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        loop {
            let mut packet = [0u8; HID_PACKET_SIZE];
            let read = device.read_timeout(&mut packet, timeout_ms).map_err(io)?;
            if read == 0 {
                return Err(TransportError::Timeout);
            }
            if let Some(reply) = assembler.push(&packet[..read])? {
                return Ok(reply);
            }
        }
    }

    #[async_trait]
    impl ApduExchange for HidExchange {
        async fn exchange(&mut self, command: &ApduCommand) -> Result<ApduResponse, TransportError> {
            let apdu = command.to_bytes()?;
            let device = self.device.clone();
            let timeout = self.timeout;
            let reply = tokio::task::spawn_blocking(move || {
                let device = device
                    .lock()
                    .map_err(|_| TransportError::Io("HID device lock poisoned".to_string()))?;
                exchange_blocking(&device, &apdu, timeout)
            })
            .await
            .map_err(io)??;

            let response = ApduResponse::from_bytes(&reply)?;
            if !response.is_success() {
                warn!(
                    "APDU failed: {:04X} - {}",
                    response.status_code(),
                    response.error_description()
                );
            }
            Ok(response)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            debug!("Releasing HID device");
            Ok(())
        }
    }

    /// Opens the first connected Ledger running the Ethereum app.
    pub struct LedgerConnector {
        timeout: Duration,
    }

    impl LedgerConnector {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    impl Default for LedgerConnector {
        fn default() -> Self {
            Self::new(Duration::from_secs(30))
        }
    }

    #[async_trait]
    impl TransportConnector for LedgerConnector {
        async fn open(&self) -> Result<Box<dyn DeviceTransport>, TransportError> {
            let device = tokio::task::spawn_blocking(|| {
                let api = HidApi::new().map_err(|e| TransportError::ConnectionRefused(e.to_string()))?;
                let info = api
                    .device_list()
                    .find(|d| d.vendor_id() == LEDGER_VENDOR_ID && d.usage_page() == LEDGER_USAGE_PAGE)
                    .ok_or(TransportError::NotFound)?;
                info!("Opening Ledger device {:?}", info.product_string());
                info.open_device(&api)
                    .map_err(|e| TransportError::ConnectionRefused(e.to_string()))
            })
            .await
            .map_err(io)??;

            Ok(Box::new(LedgerEthApp::new(HidExchange::new(device, self.timeout))))
        }
    }
}
