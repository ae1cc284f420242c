//! Channel control blocks
//!
//! One CCB per dynamic channel. The local CID is derived from the arena
//! slot, so a CID lookup is a direct index.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use super::arena::ArenaHandle;
use super::constants::*;
use super::interfaces::ChannelOwner;
use super::lcb::LcbHandle;
use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CcbHandle(pub(crate) ArenaHandle);

impl CcbHandle {
    /// Local CID owned by this slot
    pub fn local_cid(&self) -> u16 {
        L2CAP_BASE_APPL_CID + self.0.index as u16
    }
}

impl fmt::Display for CcbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ccb{}", self.0)
    }
}

bitflags! {
    /// Configuration progress of a channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigDone: u8 {
        const IB_CFG_DONE = 0x01;
        const OB_CFG_DONE = 0x02;
        const RECONFIG_FLAG = 0x04;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CcbFlags: u8 {
        /// Peer dropped the link on a fresh outgoing channel, do not retry
        const NO_RETRY = 0x01;
        /// A pending connect response has already been sent
        const SENT_PENDING = 0x02;
    }
}

bitflags! {
    /// Options the peer has configured so far
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PeerCfgBits: u8 {
        const MTU = 0x01;
        const FLUSH_TO = 0x02;
        const QOS = 0x04;
        const EXT_FLOW_SPEC = 0x08;
    }
}

/// Retransmission options an owner may ask for when connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErtmInfo {
    pub preferred_mode: RetransmissionMode,
    /// Mask of `L2CAP_FCR_CHAN_OPT_*` bits
    pub allowed_modes: u8,
}

impl Default for ErtmInfo {
    fn default() -> Self {
        Self {
            preferred_mode: RetransmissionMode::Basic,
            allowed_modes: L2CAP_FCR_CHAN_OPT_BASIC,
        }
    }
}

pub struct ChannelControlBlock {
    pub local_cid: u16,
    pub remote_cid: u16,
    pub lcb: LcbHandle,
    pub psm: u16,
    pub owner: Option<Arc<dyn ChannelOwner>>,
    pub security_level: SecurityLevel,
    pub state: ChannelState,

    pub config_done: ConfigDone,
    pub flags: CcbFlags,
    /// Identifier of our outstanding request
    pub local_id: u8,
    /// Identifier of the peer request we still owe a response to
    pub remote_id: u8,

    pub our_cfg: ConfigInfo,
    pub peer_cfg: ConfigInfo,
    pub peer_cfg_bits: PeerCfgBits,
    /// MTU the peer can receive
    pub peer_mtu: u16,
    pub ertm_info: ErtmInfo,
    pub fcr_cfg_tries: u8,
    pub tx_mps: u16,

    pub xmit_hold_q: VecDeque<Vec<u8>>,
    pub buff_quota: u16,
    pub cong_sent: bool,
    pub tx_data_rate: u16,
    pub rx_data_rate: u16,
    pub priority: ChannelPriority,
    pub is_flushable: bool,

    pub local_conn_cfg: LeCreditBasedConfig,
    pub peer_conn_cfg: LeCreditBasedConfig,
    /// Tail of an SDU whose first K-frame has gone out
    pub le_tx_rest: Option<Vec<u8>>,
    pub le_rx_sdu: Option<LeRxSdu>,
}

/// LE SDU being reassembled from K-frames
#[derive(Debug, Clone, Default)]
pub struct LeRxSdu {
    pub expected: usize,
    pub data: Vec<u8>,
}

impl fmt::Debug for ChannelControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelControlBlock")
            .field("local_cid", &self.local_cid)
            .field("remote_cid", &self.remote_cid)
            .field("psm", &self.psm)
            .field("state", &self.state)
            .field("config_done", &self.config_done)
            .field("flags", &self.flags)
            .field("queued", &self.xmit_hold_q.len())
            .finish()
    }
}

impl ChannelControlBlock {
    pub fn new(handle: CcbHandle, lcb: LcbHandle) -> Self {
        Self {
            local_cid: handle.local_cid(),
            remote_cid: 0,
            lcb,
            psm: 0,
            owner: None,
            security_level: SecurityLevel::None,
            state: ChannelState::Closed,
            config_done: ConfigDone::empty(),
            flags: CcbFlags::empty(),
            local_id: 0,
            remote_id: 0,
            our_cfg: ConfigInfo::default(),
            peer_cfg: ConfigInfo::default(),
            peer_cfg_bits: PeerCfgBits::empty(),
            peer_mtu: L2CAP_DEFAULT_MTU,
            ertm_info: ErtmInfo::default(),
            fcr_cfg_tries: L2CAP_MAX_FCR_CFG_TRIES,
            tx_mps: 0,
            xmit_hold_q: VecDeque::new(),
            buff_quota: L2CAP_DEFAULT_BUFF_QUOTA,
            cong_sent: false,
            tx_data_rate: 1,
            rx_data_rate: 1,
            priority: ChannelPriority::Low,
            is_flushable: false,
            local_conn_cfg: LeCreditBasedConfig::default(),
            peer_conn_cfg: LeCreditBasedConfig::default(),
            le_tx_rest: None,
            le_rx_sdu: None,
        }
    }

    pub fn is_config_complete(&self) -> bool {
        self.config_done
            .contains(ConfigDone::IB_CFG_DONE | ConfigDone::OB_CFG_DONE)
    }

    /// Channel runs in basic mode on both directions
    pub fn is_basic_mode(&self) -> bool {
        self.peer_cfg.fcr_mode() == RetransmissionMode::Basic
    }

    pub fn queued_bytes(&self) -> usize {
        self.xmit_hold_q.iter().map(Vec::len).sum()
    }
}
