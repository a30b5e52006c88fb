// Cash Hub: wire protocol crate.
//
// SPDX-License-Identifier: MIT

//! The legacy Bitcoin p2p envelope"),
//! used only for the gateway-to-legacy-peers role: 4-byte network magic,
//! 12-byte zero-padded ASCII command, 4-byte LE body length, 4-byte
//! truncated double-SHA256 checksum, then the body.

use amplify::{Display, Error};
use sha2::{Digest, Sha256};

pub const MAGIC_MAINNET: [u8; 4] = [0xe3, 0xe1, 0xf3, 0xe8];
pub const MAGIC_TESTNET: [u8; 4] = [0xf4, 0xe5, 0xf3, 0xf4];
pub const MAGIC_REGTEST: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

const COMMAND_LEN: usize = 12;
const HEADER_LEN: usize = 4 + COMMAND_LEN + 4 + 4;

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum LegacyError {
    /// envelope is shorter than the 24-byte legacy header.
    Truncated,
    /// network magic did not match any known network.
    BadMagic,
    /// command name is not valid ASCII or exceeds 12 bytes.
    BadCommand,
    /// checksum did not match the body.
    BadChecksum,
    /// declared body length does not match the bytes available.
    LengthMismatch,
}

pub struct LegacyEnvelope {
    pub magic: [u8; 4],
    pub command: String,
    pub body: Vec<u8>,
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

impl LegacyEnvelope {
    pub fn new(magic: [u8; 4], command: &str, body: Vec<u8>) -> Self {
        assert!(command.len() <= COMMAND_LEN, "legacy command name too long");
        Self { magic, command: command.to_string(), body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.magic);
        let mut command = [0u8; COMMAND_LEN];
        command[..self.command.len()].copy_from_slice(self.command.as_bytes());
        out.extend_from_slice(&command);
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        let checksum = double_sha256(&self.body);
        out.extend_from_slice(&checksum[..4]);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, LegacyError> {
        if data.len() < HEADER_LEN {
            return Err(LegacyError::Truncated);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if ![MAGIC_MAINNET, MAGIC_TESTNET, MAGIC_REGTEST].contains(&magic) {
            return Err(LegacyError::BadMagic);
        }
        let command_bytes = &data[4..4 + COMMAND_LEN];
        let end = command_bytes.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        if !command_bytes[end..].iter().all(|&b| b == 0) {
            return Err(LegacyError::BadCommand);
        }
        let command = std::str::from_utf8(&command_bytes[..end]).map_err(|_| LegacyError::BadCommand)?.to_string();

        let len_offset = 4 + COMMAND_LEN;
        let body_len = u32::from_le_bytes(data[len_offset..len_offset + 4].try_into().unwrap()) as usize;
        let checksum_offset = len_offset + 4;
        let body_offset = checksum_offset + 4;
        if data.len() != body_offset + body_len {
            return Err(LegacyError::LengthMismatch);
        }
        let body = data[body_offset..].to_vec();
        let checksum = double_sha256(&body);
        if checksum[..4] != data[checksum_offset..checksum_offset + 4] {
            return Err(LegacyError::BadChecksum);
        }
        Ok(Self { magic, command, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let env = LegacyEnvelope::new(MAGIC_MAINNET, "version", vec![1, 2, 3, 4]);
        let bytes = env.encode();
        let decoded = LegacyEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded.magic, MAGIC_MAINNET);
        assert_eq!(decoded.command, "version");
        assert_eq!(decoded.body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn tampered_body_fails_checksum() {
        let env = LegacyEnvelope::new(MAGIC_MAINNET, "ping", vec![9, 9]);
        let mut bytes = env.encode();
        *bytes.last_mut().unwrap() ^= 0xff;
        assert!(matches!(LegacyEnvelope::decode(&bytes), Err(LegacyError::BadChecksum)));
    }
}
