//! Collaborator interfaces
//!
//! Everything the engine talks to outside itself: the channel owners above,
//! the security manager, the timer scheduler, the ACL manager and the
//! retransmission engine. None of them may call back into the
//! [`L2capManager`](super::L2capManager) from inside a callback; work they
//! trigger re-enters through the manager's entry points later.

use std::collections::VecDeque;

use super::ccb::CcbHandle;
use super::lcb::LcbHandle;
use super::types::{ConfigInfo, SecurityLevel};
use crate::acl::BtmStatus;
use crate::gap::{BdAddr, DevClass, LinkRole, Transport};

/// Callbacks of a registered service.
///
/// Every method has an empty default so an owner only implements what it
/// cares about.
#[allow(unused_variables)]
pub trait ChannelOwner: Send + Sync {
    /// Peer asked to open a channel to this PSM
    fn connect_ind(&self, bd_addr: BdAddr, lcid: u16, psm: u16, identifier: u8) {}

    fn connect_cfm(&self, lcid: u16, result: u16) {}

    /// Peer answered our connect request with a pending result
    fn connect_pnd(&self, lcid: u16) {}

    fn config_ind(&self, lcid: u16, config: &ConfigInfo) {}

    fn config_cfm(&self, lcid: u16, config: &ConfigInfo) {}

    fn disconnect_ind(&self, lcid: u16, ack_needed: bool) {}

    fn disconnect_cfm(&self, lcid: u16, result: u16) {}

    fn qos_violation_ind(&self, bd_addr: BdAddr) {}

    fn data_ind(&self, lcid: u16, data: Vec<u8>) {}

    fn congestion_status(&self, lcid: u16, congested: bool) {}

    fn tx_complete(&self, lcid: u16, num_sdus: u16) {}

    fn credits_received(&self, lcid: u16, credits: u16, credit_count: u16) {}
}

/// Verdict of the security manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStatus {
    Success,
    SuccessNoSecurity,
    /// Procedure started, the verdict comes back through `sec_comp`
    CmdStarted,
    CmdStored,
    Busy,
    /// Encryption change may still arrive, check again later
    DelayCheck,
    NoResources,
    ModeUnsupported,
    FailedAuthentication,
    FailedEncryption,
    Failed(u8),
}

impl SecurityStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessNoSecurity)
    }

    /// Verdict is still outstanding
    pub fn is_pending(self) -> bool {
        matches!(self, Self::CmdStarted | Self::CmdStored | Self::Busy)
    }
}

/// Everything the security manager needs to decide on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    pub bd_addr: BdAddr,
    pub psm: u16,
    pub handle: u16,
    pub transport: Transport,
    pub is_originator: bool,
    pub security_level: SecurityLevel,
    pub ccb: CcbHandle,
}

pub trait SecurityGate: Send {
    /// Checks access for a channel. A pending verdict is delivered later
    /// through `L2capManager::sec_comp` with the same CCB handle.
    fn access_req(&mut self, request: &AccessRequest) -> SecurityStatus;

    fn abort_access_req(&mut self, bd_addr: BdAddr);

    /// Drops the ACL link, letting security finish any bonding first
    fn disconnect(&mut self, handle: u16, reason: u8) -> SecurityStatus;
}

/// Timers the engine arms. Expiry is reported through
/// `L2capManager::timer_expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    Channel(CcbHandle),
    ChannelAck(CcbHandle),
    Link(LcbHandle),
    InfoRsp(LcbHandle),
}

pub trait TimerService: Send {
    /// Arms or re-arms the timer
    fn arm(&mut self, id: TimerId, timeout_ms: u64);

    fn cancel(&mut self, id: TimerId);
}

/// The slice of the ACL manager the link layer drives
pub trait AclLink: Send {
    fn acl_created(
        &mut self,
        bd_addr: BdAddr,
        dev_class: Option<DevClass>,
        handle: u16,
        role: LinkRole,
        transport: Transport,
    );

    fn acl_removed(&mut self, bd_addr: BdAddr, transport: Transport);

    /// Forces the link out of sniff or park before channel setup
    fn set_power_mode_active(&mut self, bd_addr: BdAddr);

    /// A power mode change is in flight, data must wait
    fn power_mode_pending(&self, bd_addr: BdAddr) -> bool;

    fn switch_role(&mut self, bd_addr: BdAddr, role: LinkRole) -> BtmStatus;

    fn peer_supports_role_switch(&self, bd_addr: BdAddr) -> bool;
}

/// Retransmission engine for ERTM and streaming channels
#[allow(unused_variables)]
pub trait FcrHandler: Send {
    fn on_channel_open(&mut self, lcid: u16, config: &ConfigInfo) {}

    fn cleanup(&mut self, lcid: u16) {}

    fn process_timeout(&mut self, lcid: u16) {}

    fn process_ack_timeout(&mut self, lcid: u16) {}

    /// Next I-frame or S-frame body for the channel, built from the SDUs
    /// in `queue`. The engine adds the basic L2CAP header.
    fn next_segment(
        &mut self,
        lcid: u16,
        queue: &mut VecDeque<Vec<u8>>,
        mps: u16,
    ) -> Option<Vec<u8>>;

    /// Takes one received PDU of an ERTM or streaming channel and returns
    /// the SDUs it completed, in order
    fn receive_pdu(&mut self, lcid: u16, pdu: Vec<u8>) -> Vec<Vec<u8>> {
        vec![pdu]
    }

    /// The peer's receive window is closed
    fn is_flow_controlled(&self, lcid: u16) -> bool {
        false
    }
}

/// Frames queued SDUs as-is, for stacks without a retransmission engine
#[derive(Debug, Default)]
pub struct BasicFcr;

impl FcrHandler for BasicFcr {
    fn next_segment(
        &mut self,
        _lcid: u16,
        queue: &mut VecDeque<Vec<u8>>,
        _mps: u16,
    ) -> Option<Vec<u8>> {
        queue.pop_front()
    }
}
