//! HCI packet structures
//!
//! Commands the link layer issues to the controller and the ACL data framing
//! used on the way down.

use crate::gap::{BdAddr, LinkRole};
use crate::hci::constants::*;

/// HCI commands issued by the link and ACL managers
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    CreateConnection {
        bd_addr: BdAddr,
        packet_type: u16,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
        allow_role_switch: bool,
    },
    Disconnect { handle: u16, reason: u8 },
    AcceptConnectionRequest { bd_addr: BdAddr, role: LinkRole },
    RejectConnectionRequest { bd_addr: BdAddr, reason: u8 },
    ChangeConnectionPacketType { handle: u16, packet_type: u16 },
    SetConnectionEncryption { handle: u16, enable: bool },
    ReadRemoteSupportedFeatures { handle: u16 },
    ReadRemoteExtendedFeatures { handle: u16, page: u8 },
    ReadRemoteVersionInformation { handle: u16 },
    ReadClockOffset { handle: u16 },

    // Link Policy Commands (OGF: 0x02)
    ExitSniffMode { handle: u16 },
    ExitParkState { handle: u16 },
    SwitchRole { bd_addr: BdAddr, role: LinkRole },
    WriteLinkPolicySettings { handle: u16, settings: u16 },
    WriteDefaultLinkPolicySettings { settings: u16 },

    // Host Controller Commands (OGF: 0x03)
    WriteAutomaticFlushTimeout { handle: u16, timeout: u16 },

    // LE Commands (OGF: 0x08)
    LeCreateConnection { peer_addr: BdAddr, peer_addr_type: u8 },
    LeReadRemoteFeatures { handle: u16 },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST),
            Self::ChangeConnectionPacketType { .. } => {
                (OGF_LINK_CTL, OCF_CHANGE_CONNECTION_PACKET_TYPE)
            }
            Self::SetConnectionEncryption { .. } => (OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION),
            Self::ReadRemoteSupportedFeatures { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_SUPPORTED_FEATURES)
            }
            Self::ReadRemoteExtendedFeatures { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_EXTENDED_FEATURES)
            }
            Self::ReadRemoteVersionInformation { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_VERSION_INFORMATION)
            }
            Self::ReadClockOffset { .. } => (OGF_LINK_CTL, OCF_READ_CLOCK_OFFSET),

            // Link Policy Commands
            Self::ExitSniffMode { .. } => (OGF_LINK_POLICY, OCF_EXIT_SNIFF_MODE),
            Self::ExitParkState { .. } => (OGF_LINK_POLICY, OCF_EXIT_PARK_STATE),
            Self::SwitchRole { .. } => (OGF_LINK_POLICY, OCF_SWITCH_ROLE),
            Self::WriteLinkPolicySettings { .. } => (OGF_LINK_POLICY, OCF_WRITE_LINK_POLICY_SETTINGS),
            Self::WriteDefaultLinkPolicySettings { .. } => {
                (OGF_LINK_POLICY, OCF_WRITE_DEFAULT_LINK_POLICY_SETTINGS)
            }

            // Host Controller Commands
            Self::WriteAutomaticFlushTimeout { .. } => {
                (OGF_HOST_CTL, OCF_WRITE_AUTOMATIC_FLUSH_TIMEOUT)
            }

            // LE Commands
            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONNECTION),
            Self::LeReadRemoteFeatures { .. } => (OGF_LE, OCF_LE_READ_REMOTE_FEATURES),
        }
    }

    /// Full 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::CreateConnection {
                bd_addr,
                packet_type,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch,
            } => {
                let mut params = Vec::with_capacity(13);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(page_scan_repetition_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params.push(allow_role_switch as u8);
                params
            }

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason);
                params
            }

            Self::AcceptConnectionRequest { bd_addr, role } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(role.as_u8());
                params
            }

            Self::RejectConnectionRequest { bd_addr, reason } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(reason);
                params
            }

            Self::ChangeConnectionPacketType { handle, packet_type } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&packet_type.to_le_bytes());
                params
            }

            Self::SetConnectionEncryption { handle, enable } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(enable as u8);
                params
            }

            Self::ReadRemoteExtendedFeatures { handle, page } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(page);
                params
            }

            Self::ReadRemoteSupportedFeatures { handle }
            | Self::ReadRemoteVersionInformation { handle }
            | Self::ReadClockOffset { handle }
            | Self::ExitSniffMode { handle }
            | Self::ExitParkState { handle }
            | Self::LeReadRemoteFeatures { handle } => handle.to_le_bytes().to_vec(),

            Self::SwitchRole { bd_addr, role } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(role.as_u8());
                params
            }

            Self::WriteLinkPolicySettings { handle, settings } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&settings.to_le_bytes());
                params
            }

            Self::WriteDefaultLinkPolicySettings { settings } => settings.to_le_bytes().to_vec(),

            Self::WriteAutomaticFlushTimeout { handle, timeout } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                params
            }

            Self::LeCreateConnection { peer_addr, peer_addr_type } => {
                let mut params = Vec::with_capacity(25);
                params.extend_from_slice(&0x0060u16.to_le_bytes()); // scan interval
                params.extend_from_slice(&0x0030u16.to_le_bytes()); // scan window
                params.push(0x00); // no filter accept list
                params.push(peer_addr_type);
                params.extend_from_slice(peer_addr.as_slice());
                params.push(0x00); // own address: public
                params.extend_from_slice(&0x0018u16.to_le_bytes()); // interval min
                params.extend_from_slice(&0x0028u16.to_le_bytes()); // interval max
                params.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
                params.extend_from_slice(&0x01F4u16.to_le_bytes()); // supervision timeout
                params.extend_from_slice(&0x0000u16.to_le_bytes()); // min CE length
                params.extend_from_slice(&0x0000u16.to_le_bytes()); // max CE length
                params
            }
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let opcode = self.opcode();
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI ACL data header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet boundary flag (2 bits)
    pub packet_boundary: u8,
    /// Broadcast flag (2 bits)
    pub broadcast: u8,
    /// Length of the payload that follows
    pub length: u16,
}

impl AclHeader {
    pub fn new(handle: u16, packet_boundary: u8, length: u16) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            packet_boundary: packet_boundary & 0x03,
            broadcast: 0,
            length,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_DATA_PREAMBLE_SIZE {
            return None;
        }

        let handle_and_flags = u16::from_le_bytes([data[0], data[1]]);
        let length = u16::from_le_bytes([data[2], data[3]]);

        Some(Self {
            handle: handle_and_flags & HCI_HANDLE_MASK,
            packet_boundary: ((handle_and_flags >> 12) & 0x03) as u8,
            broadcast: ((handle_and_flags >> 14) & 0x03) as u8,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; HCI_DATA_PREAMBLE_SIZE] {
        let handle_and_flags = (self.handle & HCI_HANDLE_MASK)
            | ((self.packet_boundary as u16 & 0x03) << 12)
            | ((self.broadcast as u16 & 0x03) << 14);

        let mut out = [0u8; HCI_DATA_PREAMBLE_SIZE];
        out[0..2].copy_from_slice(&handle_and_flags.to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// One L2CAP PDU on its way to the controller, stamped with its ACL header.
///
/// The header length is capped at the controller's ACL data size; the HCI
/// transport fragments the remainder using continuation packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub header: AclHeader,
    pub payload: Vec<u8>,
}

impl AclPacket {
    /// Payload length plus the HCI preamble
    pub fn wire_len(&self) -> usize {
        self.payload.len() + HCI_DATA_PREAMBLE_SIZE
    }

    /// What is left once the first `num_segments` fragments of
    /// `acl_data_size` bytes have gone out, as a continuation packet.
    pub fn remainder_after(&self, num_segments: u16, acl_data_size: u16) -> Option<AclPacket> {
        let sent = num_segments as usize * acl_data_size as usize;
        if sent >= self.payload.len() {
            return None;
        }

        let payload = self.payload[sent..].to_vec();
        let length = payload.len().min(acl_data_size as usize) as u16;
        Some(AclPacket {
            header: AclHeader::new(self.header.handle, ACL_PB_CONTINUING, length),
            payload,
        })
    }

    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.wire_len());
        packet.push(HCI_ACL_PKT);
        packet.extend_from_slice(&self.header.to_bytes());
        packet.extend_from_slice(&self.payload);
        packet
    }
}
