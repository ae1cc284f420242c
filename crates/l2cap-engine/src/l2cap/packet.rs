//! L2CAP Packet handling
//!
//! The basic frame header and the signaling command header.

use super::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_PKT_OVERHEAD {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_PKT_OVERHEAD] {
        let mut result = [0u8; L2CAP_PKT_OVERHEAD];
        result[0..2].copy_from_slice(&self.length.to_le_bytes());
        result[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        result
    }
}

/// Wrap a payload in a basic L2CAP frame addressed to `channel_id`.
pub fn build_basic_frame(channel_id: u16, payload: &[u8]) -> Vec<u8> {
    let header = L2capHeader::new(payload.len() as u16, channel_id);
    let mut frame = Vec::with_capacity(L2CAP_PKT_OVERHEAD + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// L2CAP signaling command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_CMD_OVERHEAD {
            return None;
        }

        let code = data[0];
        let identifier = data[1];

        let mut cursor = Cursor::new(&data[2..4]);
        let length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            code,
            identifier,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_CMD_OVERHEAD] {
        let mut result = [0u8; L2CAP_CMD_OVERHEAD];
        result[0] = self.code;
        result[1] = self.identifier;
        result[2..4].copy_from_slice(&self.length.to_le_bytes());
        result
    }
}
