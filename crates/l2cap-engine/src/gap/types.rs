use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of the local device on an ACL link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Master,
    Slave,
}

impl LinkRole {
    /// HCI encoding (0 = master, 1 = slave)
    pub fn as_u8(self) -> u8 {
        match self {
            LinkRole::Master => 0x00,
            LinkRole::Slave => 0x01,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            LinkRole::Master => LinkRole::Slave,
            LinkRole::Slave => LinkRole::Master,
        }
    }
}

impl From<u8> for LinkRole {
    fn from(value: u8) -> Self {
        match value {
            0x00 => LinkRole::Master,
            _ => LinkRole::Slave,
        }
    }
}

/// Physical transport of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    BrEdr,
    Le,
}

impl Transport {
    pub fn is_le(self) -> bool {
        self == Transport::Le
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::BrEdr => write!(f, "BR/EDR"),
            Transport::Le => write!(f, "LE"),
        }
    }
}

/// Class of device, as carried in the connection request event
pub type DevClass = [u8; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}
