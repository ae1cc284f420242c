//! Type definitions for L2CAP operations
//!
//! Configuration records exchanged with the peer and the channel owner,
//! channel states, connection results and the small enums the upper API
//! hands back.

use std::fmt;
use thiserror::Error;

use super::constants::*;
use crate::gap::BdAddr;

/// Errors returned from the upper API and the signaling parser.
///
/// Protocol outcomes (rejections, timeouts, peer disconnects) are never
/// errors; they reach the channel owner through its callbacks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown channel 0x{0:04X}")]
    UnknownCid(u16),

    #[error("No free control block")]
    NoResources,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("PSM 0x{0:04X} not registered")]
    PsmNotRegistered(u16),

    #[error("PSM 0x{0:04X} still in use")]
    PsmInUse(u16),

    #[error("Malformed signaling: {0}")]
    MalformedSignaling(String),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            service_type: BEST_EFFORT,
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFF_FFFF,
            delay_variation: 0xFFFF_FFFF,
        }
    }
}

/// Retransmission and Flow Control modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetransmissionMode {
    /// Basic L2CAP mode (no retransmission or flow control)
    #[default]
    Basic = 0,
    /// Legacy retransmission mode
    Retransmission = 1,
    /// Legacy flow control mode
    FlowControl = 2,
    /// Enhanced Retransmission mode
    EnhancedRetransmission = 3,
    /// Streaming mode
    Streaming = 4,
}

impl RetransmissionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Basic),
            1 => Some(Self::Retransmission),
            2 => Some(Self::FlowControl),
            3 => Some(Self::EnhancedRetransmission),
            4 => Some(Self::Streaming),
            _ => None,
        }
    }

    /// Bit in a channel's allowed-modes mask. The legacy modes are never
    /// offered, so they map to no bit at all.
    pub fn allowed_bit(self) -> u8 {
        match self {
            Self::Basic => L2CAP_FCR_CHAN_OPT_BASIC,
            Self::EnhancedRetransmission => L2CAP_FCR_CHAN_OPT_ERTM,
            Self::Streaming => L2CAP_FCR_CHAN_OPT_STREAM,
            Self::Retransmission | Self::FlowControl => 0,
        }
    }
}

/// Retransmission and Flow Control configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetransmissionFlowControl {
    /// Mode selection
    pub mode: RetransmissionMode,
    /// Transmission Window size
    pub tx_window_size: u8,
    /// Maximum number of transmissions
    pub max_transmit: u8,
    /// Retransmission timeout (ms)
    pub retransmit_timeout: u16,
    /// Monitor timeout (ms)
    pub monitor_timeout: u16,
    /// Maximum PDU payload size
    pub max_pdu_size: u16,
}

/// Extended Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedFlowSpec {
    pub identifier: u8,
    pub service_type: u8,
    pub max_sdu_size: u16,
    pub sdu_inter_arrival_time: u32,
    pub access_latency: u32,
    pub flush_timeout: u32,
}

/// One configuration request or response.
///
/// An option is present on the wire exactly when its field is `Some`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigInfo {
    pub result: u16,
    pub flags: u16,
    pub mtu: Option<u16>,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosFlowSpec>,
    pub fcr: Option<RetransmissionFlowControl>,
    pub fcs: Option<u8>,
    pub ext_flow_spec: Option<ExtendedFlowSpec>,
    pub ext_window_size: Option<u16>,
}

impl ConfigInfo {
    /// Mode carried by the FCR option; basic when the option is absent.
    pub fn fcr_mode(&self) -> RetransmissionMode {
        self.fcr.map_or(RetransmissionMode::Basic, |fcr| fcr.mode)
    }

    pub fn is_continuation(&self) -> bool {
        self.flags & L2CAP_CFG_FLAGS_MASK_CONT != 0
    }

    pub fn with_mtu(mtu: u16) -> Self {
        Self {
            mtu: Some(mtu),
            ..Default::default()
        }
    }
}

/// Connection parameters carried with connect responses and confirms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnInfo {
    pub bd_addr: BdAddr,
    pub result: u16,
    pub status: u16,
    pub remote_cid: u16,
}

impl ConnInfo {
    pub fn with_result(result: u16, status: u16) -> Self {
        Self {
            result,
            status,
            ..Default::default()
        }
    }
}

/// LE Credit-Based Connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditBasedConfig {
    /// Maximum SDU size
    pub mtu: u16,
    /// Maximum PDU payload size
    pub mps: u16,
    /// Credits granted to the other side
    pub credits: u16,
}

impl Default for LeCreditBasedConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_DEFAULT_MTU,
            mps: L2CAP_LE_MIN_MTU,
            credits: L2CAP_LE_CREDIT_DEFAULT,
        }
    }
}

/// L2CAP Security Level required by a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    /// No security (no authentication, no encryption)
    #[default]
    None = 0,
    /// Authentication required
    Authentication = 1,
    /// Authentication and encryption required
    AuthenticationAndEncryption = 2,
    /// Secure Connections required with encryption
    SecureConnectionsWithEncryption = 3,
}

/// Per-channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    OrigW4SecComp,
    TermW4SecComp,
    W4L2capConnectRsp,
    W4L2caConnectRsp,
    Config,
    Open,
    W4L2capDisconnectRsp,
    W4L2caDisconnectRsp,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::OrigW4SecComp => "ORIG_W4_SEC_COMP",
            Self::TermW4SecComp => "TERM_W4_SEC_COMP",
            Self::W4L2capConnectRsp => "W4_L2CAP_CON_RSP",
            Self::W4L2caConnectRsp => "W4_L2CA_CON_RSP",
            Self::Config => "CONFIG",
            Self::Open => "OPEN",
            Self::W4L2capDisconnectRsp => "W4_L2CAP_DISC_RSP",
            Self::W4L2caDisconnectRsp => "W4_L2CA_DISC_RSP",
        };
        f.write_str(name)
    }
}

/// Outcome of checking a configuration request from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCfgVerdict {
    Ok,
    Unacceptable,
    Disconnect,
}

/// Result of an upper-layer data write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataWriteStatus {
    Success,
    Congested,
    Failed,
}

/// Link-level transmit priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclPriority {
    #[default]
    Normal,
    High,
}

/// Channel service priority within a link, lower value served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ChannelPriority {
    High = 0,
    Medium = 1,
    #[default]
    Low = 2,
}
