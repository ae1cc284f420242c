//! Link control blocks
//!
//! One LCB per physical ACL link. It owns the link transmit queue, the
//! per-link quota counters and the ordered list of channels multiplexed on
//! the link.

use std::collections::VecDeque;
use std::fmt;

use super::arena::ArenaHandle;
use super::ccb::CcbHandle;
use super::types::{AclPriority, ChannelPriority};
use crate::gap::{BdAddr, LinkRole, Transport};
use crate::hci::constants::HCI_INVALID_HANDLE;
use crate::hci::AclPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LcbHandle(pub(crate) ArenaHandle);

impl fmt::Display for LcbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lcb{}", self.0)
    }
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    /// Controller is out of ACL slots, waiting for another link to drop
    ConnectHolding,
    /// Waiting for a role switch on another link before paging
    ConnectingWaitSwitch,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::ConnectHolding => "CONNECT_HOLDING",
            Self::ConnectingWaitSwitch => "CONNECTING_WAIT_SWITCH",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct LinkControlBlock {
    pub bd_addr: BdAddr,
    pub transport: Transport,
    pub state: LinkState,
    /// HCI connection handle, `HCI_INVALID_HANDLE` until connected
    pub handle: u16,
    pub role: LinkRole,

    next_signal_id: u8,

    /// Seconds to keep the link once its last channel is gone
    pub idle_timeout: u16,
    pub is_bonding: bool,
    pub w4_info_rsp: bool,
    pub peer_ext_fea: u32,
    pub peer_chnl_mask: u64,
    pub link_flush_tout: u16,
    pub acl_priority: AclPriority,
    pub disc_reason: u8,

    pub link_xmit_quota: u16,
    pub sent_not_acked: u16,
    pub partial_segment_being_sent: bool,
    pub link_xmit_data_q: VecDeque<AclPacket>,

    /// Channels on this link, highest priority first
    pub ccbs: Vec<CcbHandle>,
    /// Channel whose connect request arrived while the link was going down
    pub pending_ccb: Option<CcbHandle>,
}

impl LinkControlBlock {
    pub fn new(bd_addr: BdAddr, transport: Transport, idle_timeout: u16, is_bonding: bool) -> Self {
        Self {
            bd_addr,
            transport,
            state: LinkState::Disconnected,
            handle: HCI_INVALID_HANDLE,
            role: LinkRole::Master,
            next_signal_id: 1,
            idle_timeout,
            is_bonding,
            w4_info_rsp: false,
            peer_ext_fea: 0,
            peer_chnl_mask: 0,
            link_flush_tout: super::constants::L2CAP_NO_AUTOMATIC_FLUSH,
            acl_priority: AclPriority::Normal,
            disc_reason: 0,
            link_xmit_quota: 0,
            sent_not_acked: 0,
            partial_segment_being_sent: false,
            link_xmit_data_q: VecDeque::new(),
            ccbs: Vec::new(),
            pending_ccb: None,
        }
    }

    /// Next signaling identifier. Zero is never used on the wire.
    pub fn next_signal_id(&mut self) -> u8 {
        let id = self.next_signal_id;
        self.next_signal_id = self.next_signal_id.wrapping_add(1);
        if self.next_signal_id == 0 {
            self.next_signal_id = 1;
        }
        id
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn is_high_priority(&self) -> bool {
        self.acl_priority == AclPriority::High
    }

    /// Inserts a channel behind every channel of the same or higher
    /// priority.
    pub fn enqueue_ccb(
        &mut self,
        ccb: CcbHandle,
        priority: ChannelPriority,
        priorities: &dyn Fn(CcbHandle) -> ChannelPriority,
    ) {
        let position = self
            .ccbs
            .iter()
            .position(|&other| priorities(other) > priority)
            .unwrap_or(self.ccbs.len());
        self.ccbs.insert(position, ccb);
    }

    pub fn dequeue_ccb(&mut self, ccb: CcbHandle) -> bool {
        match self.ccbs.iter().position(|&other| other == ccb) {
            Some(position) => {
                self.ccbs.remove(position);
                true
            }
            None => false,
        }
    }
}
