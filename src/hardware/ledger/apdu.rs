//! APDU (Application Protocol Data Unit) framing for the Ethereum app.

use crate::hardware::transport::TransportError;
use async_trait::async_trait;
use tracing::debug;

/// Class byte used by every Ledger app.
pub const CLA: u8 = 0xE0;

/// Largest data field of a single APDU.
pub const MAX_CHUNK: usize = 255;

pub const P1_FIRST_CHUNK: u8 = 0x00;
pub const P1_MORE_CHUNK: u8 = 0x80;

pub const SW_OK: u16 = 0x9000;
pub const SW_USER_REJECTED: u16 = 0x6985;

/// Ethereum app instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EthInstruction {
    GetAddress = 0x02,
    SignTransaction = 0x04,
    GetConfiguration = 0x06,
    SignPersonalMessage = 0x08,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(ins: EthInstruction, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla: CLA,
            ins: ins as u8,
            p1,
            p2,
            data,
        }
    }

    /// `CLA INS P1 P2 Lc data`. `data` must fit in one chunk.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        if self.data.len() > MAX_CHUNK {
            return Err(TransportError::Protocol(format!(
                "APDU data too long: {} bytes",
                self.data.len()
            )));
        }
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        bytes.extend_from_slice(&self.data);

        debug!(
            "APDU CLA={:02X} INS={:02X} P1={:02X} P2={:02X} Lc={}",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len()
        );
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < 2 {
            return Err(TransportError::Protocol("APDU reply shorter than its status word".to_string()));
        }
        let len = bytes.len();
        Ok(Self {
            data: bytes[..len - 2].to_vec(),
            sw1: bytes[len - 2],
            sw2: bytes[len - 1],
        })
    }

    pub fn status_code(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == SW_OK
    }

    /// The data on success, a typed error otherwise.
    pub fn into_result(self) -> Result<Vec<u8>, TransportError> {
        match self.status_code() {
            SW_OK => Ok(self.data),
            SW_USER_REJECTED => Err(TransportError::UserRejected),
            other => Err(TransportError::Status(other)),
        }
    }

    pub fn error_description(&self) -> &'static str {
        match self.status_code() {
            0x9000 => "success",
            0x6982 => "security status not satisfied (device locked?)",
            0x6985 => "rejected by user",
            0x6A80 => "invalid data",
            0x6A82 => "file not found",
            0x6B00 => "incorrect parameters",
            0x6D00 => "instruction not supported (is the Ethereum app open?)",
            0x6E00 => "class not supported",
            0x6700 => "wrong length",
            _ => "unknown status",
        }
    }
}

/// BIP-32 path in device encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bip32Path {
    pub indices: Vec<u32>,
}

impl Bip32Path {
    /// Parses `44'/60'/0'/0/1`, with or without a leading `m/`.
    pub fn parse(path: &str) -> Result<Self, TransportError> {
        let body = path.trim().trim_start_matches("m/");
        if body.is_empty() {
            return Err(TransportError::Protocol(format!("empty derivation path {:?}", path)));
        }
        let indices = body
            .split('/')
            .map(|part| {
                let hardened = part.ends_with('\'') || part.ends_with('h');
                let number: u32 = part
                    .trim_end_matches(['\'', 'h'])
                    .parse()
                    .map_err(|_| TransportError::Protocol(format!("bad path component {:?}", part)))?;
                if number >= 0x8000_0000 {
                    return Err(TransportError::Protocol(format!("path index too large: {}", part)));
                }
                Ok(if hardened { number | 0x8000_0000 } else { number })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if indices.len() > 10 {
            return Err(TransportError::Protocol("derivation path deeper than 10".to_string()));
        }
        Ok(Self { indices })
    }

    /// Count byte followed by big-endian indices.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 4 * self.indices.len());
        bytes.push(self.indices.len() as u8);
        for index in &self.indices {
            bytes.extend_from_slice(&index.to_be_bytes());
        }
        bytes
    }
}

/// Splits a payload into `(P1, data)` APDU chunks.
pub fn chunk_payload(payload: &[u8]) -> Vec<(u8, Vec<u8>)> {
    payload
        .chunks(MAX_CHUNK)
        .enumerate()
        .map(|(i, chunk)| {
            let p1 = if i == 0 { P1_FIRST_CHUNK } else { P1_MORE_CHUNK };
            (p1, chunk.to_vec())
        })
        .collect()
}

/// One APDU round trip.
#[async_trait]
pub trait ApduExchange: Send {
    async fn exchange(&mut self, command: &ApduCommand) -> Result<ApduResponse, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
