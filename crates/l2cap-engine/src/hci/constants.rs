//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;

/// Size of the HCI ACL data header (handle + flags, length)
pub const HCI_DATA_PREAMBLE_SIZE: usize = 4;

pub const HCI_INVALID_HANDLE: u16 = 0xFFFF;
pub const HCI_HANDLE_MASK: u16 = 0x0FFF;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_CREATE_CONNECTION: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_ACCEPT_CONNECTION_REQUEST: u16 = 0x0009;
pub const OCF_REJECT_CONNECTION_REQUEST: u16 = 0x000A;
pub const OCF_CHANGE_CONNECTION_PACKET_TYPE: u16 = 0x000F;
pub const OCF_SET_CONNECTION_ENCRYPTION: u16 = 0x0013;
pub const OCF_READ_REMOTE_SUPPORTED_FEATURES: u16 = 0x001B;
pub const OCF_READ_REMOTE_EXTENDED_FEATURES: u16 = 0x001C;
pub const OCF_READ_REMOTE_VERSION_INFORMATION: u16 = 0x001D;
pub const OCF_READ_CLOCK_OFFSET: u16 = 0x001F;

// Link Policy Commands (OGF: 0x02)
pub const OCF_EXIT_SNIFF_MODE: u16 = 0x0004;
pub const OCF_EXIT_PARK_STATE: u16 = 0x0006;
pub const OCF_SWITCH_ROLE: u16 = 0x000B;
pub const OCF_WRITE_LINK_POLICY_SETTINGS: u16 = 0x000D;
pub const OCF_WRITE_DEFAULT_LINK_POLICY_SETTINGS: u16 = 0x000F;

// Host Controller Commands (OGF: 0x03)
pub const OCF_WRITE_AUTOMATIC_FLUSH_TIMEOUT: u16 = 0x0028;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_CREATE_CONNECTION: u16 = 0x000D;
pub const OCF_LE_READ_REMOTE_FEATURES: u16 = 0x0016;

// HCI status / reason codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_NO_CONNECTION: u8 = 0x02;
pub const HCI_ERR_AUTH_FAILURE: u8 = 0x05;
pub const HCI_ERR_MAX_NUM_OF_CONNECTIONS: u8 = 0x09;
pub const HCI_ERR_CONNECTION_EXISTS: u8 = 0x0B;
pub const HCI_ERR_HOST_REJECT_RESOURCES: u8 = 0x0D;
pub const HCI_ERR_HOST_REJECT_DEVICE: u8 = 0x0F;
pub const HCI_ERR_UNSUPPORTED_VALUE: u8 = 0x11;
pub const HCI_ERR_PEER_USER: u8 = 0x13;
pub const HCI_ERR_CONN_CAUSE_LOCAL_HOST: u8 = 0x16;
pub const HCI_ERR_UNSPECIFIED: u8 = 0x1F;
pub const HCI_ERR_HW_FAILURE: u8 = 0x03;

// ACL packet boundary flags
pub const ACL_PB_START_NON_FLUSHABLE: u8 = 0x00;
pub const ACL_PB_CONTINUING: u8 = 0x01;
pub const ACL_PB_START_FLUSHABLE: u8 = 0x02;

// Packet types allowed on outgoing connections (DM1/DH1/DM3/DH3/DM5/DH5)
pub const HCI_PKT_TYPES_MASK_ACL_DEFAULT: u16 = 0xCC18;

pub const HCI_PAGE_SCAN_REP_MODE_R1: u8 = 0x01;

/// Largest flush timeout, in 0.625 ms slots, the controller accepts
pub const HCI_MAX_AUTOMATIC_FLUSH_TIMEOUT: u16 = 0x07FF;

// LMP feature pages
pub const HCI_FEATURE_BYTES_PER_PAGE: usize = 8;
pub const HCI_EXT_FEATURES_PAGE_MAX: u8 = 2;

/// Page 0, byte 7 bit 7: extended features supported
pub const HCI_LMP_EXTENDED_BYTE: usize = 7;
pub const HCI_LMP_EXTENDED_MASK: u8 = 0x80;

/// Page 0, byte 5 bit 2: encryption pause and resume
pub const HCI_ATOMIC_ENCRYPT_BYTE: usize = 5;
pub const HCI_ATOMIC_ENCRYPT_MASK: u8 = 0x04;
