//! Link and channel registries
//!
//! Allocation, release and lookup of link and channel control blocks, and
//! the idle handling that decides when a link without channels goes down.

use log::{debug, info, warn};

use super::ccb::{CcbHandle, ChannelControlBlock};
use super::constants::*;
use super::interfaces::{SecurityStatus, TimerId};
use super::lcb::{LcbHandle, LinkControlBlock, LinkState};
use super::manager::L2capManager;
use super::types::ChannelPriority;
use crate::gap::{BdAddr, Transport};
use crate::hci::constants::{HCI_ERR_PEER_USER, HCI_INVALID_HANDLE};
use crate::hci::HciCommand;

/// Idle timeout value meaning the link is kept until someone drops it
pub const L2CAP_NO_IDLE_TIMEOUT: u16 = 0xFFFF;

impl L2capManager {
    pub(crate) fn allocate_lcb(
        &mut self,
        bd_addr: BdAddr,
        is_bonding: bool,
        transport: Transport,
    ) -> Option<LcbHandle> {
        let idle_timeout = self.idle_timeout;
        let Some(handle) = self
            .lcbs
            .alloc(LinkControlBlock::new(bd_addr, transport, idle_timeout, is_bonding))
        else {
            warn!("L2CAP no free link for {}", bd_addr);
            return None;
        };

        let lcb = LcbHandle(handle);
        debug!("L2CAP allocated {} for {} ({:?})", lcb, bd_addr, transport);
        self.adjust_allocation_for(transport);
        Some(lcb)
    }

    /// Drops a link with every channel still on it. Buffers the controller
    /// never acknowledged are returned to the pool.
    pub(crate) fn release_lcb(&mut self, lcb: LcbHandle) {
        let Some(link) = self.link(lcb) else {
            return;
        };
        let (bd_addr, transport, state) = (link.bd_addr, link.transport, link.state);
        let (sent_not_acked, round_robin) = (link.sent_not_acked, link.link_xmit_quota == 0);
        let channels = link.ccbs.clone();

        info!("L2CAP releasing {} to {} in {}", lcb, bd_addr, state);

        self.timers.cancel(TimerId::Link(lcb));
        self.timers.cancel(TimerId::InfoRsp(lcb));

        if sent_not_acked > 0 {
            let pool = self.pool_mut(transport);
            pool.window = pool.window.saturating_add(sent_not_acked).min(pool.num_bufs);
            if round_robin {
                pool.round_robin_unacked = pool.round_robin_unacked.saturating_sub(sent_not_acked);
            }
        }

        for ccb in channels {
            self.release_ccb_quietly(ccb);
        }

        if matches!(state, LinkState::Connected | LinkState::Disconnecting) {
            self.acl.acl_removed(bd_addr, transport);
        }

        // Queued buffers go with the block
        self.lcbs.release(lcb.0);
        self.adjust_allocation_for(transport);
    }

    pub fn find_lcb_by_bd_addr(&self, bd_addr: BdAddr, transport: Transport) -> Option<LcbHandle> {
        self.links()
            .find(|(_, link)| link.bd_addr == bd_addr && link.transport == transport)
            .map(|(handle, _)| handle)
    }

    pub fn find_lcb_by_handle(&self, handle: u16) -> Option<LcbHandle> {
        if handle == HCI_INVALID_HANDLE {
            return None;
        }
        self.links()
            .find(|(_, link)| link.handle == handle)
            .map(|(lcb, _)| lcb)
    }

    pub(crate) fn find_lcb_by_state(&self, state: LinkState) -> Option<LcbHandle> {
        self.links()
            .find(|(_, link)| link.state == state)
            .map(|(handle, _)| handle)
    }

    /// Some link is on its way down
    pub(crate) fn lcb_disconnecting(&self) -> bool {
        self.links()
            .any(|(_, link)| link.state == LinkState::Disconnecting)
    }

    /// Creates a closed channel on the link, served behind the link's other
    /// low priority channels
    pub(crate) fn allocate_ccb(&mut self, lcb: LcbHandle) -> Option<CcbHandle> {
        if !self.lcbs.contains(lcb.0) {
            return None;
        }

        let Some(handle) = self
            .ccbs
            .alloc_with(|slot| ChannelControlBlock::new(CcbHandle(slot), lcb))
        else {
            warn!("L2CAP no free channel on {}", lcb);
            return None;
        };
        let ccb = CcbHandle(handle);

        let ccbs = &self.ccbs;
        if let Some(link) = self.lcbs.get_mut(lcb.0) {
            link.enqueue_ccb(ccb, ChannelPriority::Low, &|other| {
                ccbs.get(other.0).map_or(ChannelPriority::Low, |c| c.priority)
            });
        }

        debug!("L2CAP allocated CID 0x{:04X} on {}", ccb.local_cid(), lcb);
        self.adjust_chnl_allocation();
        Some(ccb)
    }

    /// Frees a channel. A connected link left without channels starts its
    /// idle countdown.
    pub(crate) fn release_ccb(&mut self, ccb: CcbHandle) {
        let Some(lcb) = self.release_ccb_quietly(ccb) else {
            return;
        };

        let Some(link) = self.link(lcb) else {
            return;
        };
        if link.state != LinkState::Connected {
            return;
        }

        if link.ccbs.is_empty() {
            self.no_dynamic_ccbs(lcb);
        } else {
            self.adjust_chnl_allocation();
        }
    }

    /// Frees the channel without looking at its link afterwards. Returns
    /// the link the channel was on.
    fn release_ccb_quietly(&mut self, ccb: CcbHandle) -> Option<LcbHandle> {
        let chan = self.channel(ccb)?;
        let (lcb, lcid) = (chan.lcb, chan.local_cid);
        debug!("L2CAP releasing CID 0x{:04X} in {}", lcid, chan.state);

        self.timers.cancel(TimerId::Channel(ccb));
        self.timers.cancel(TimerId::ChannelAck(ccb));
        self.fcr.cleanup(lcid);

        if let Some(link) = self.link_mut(lcb) {
            link.dequeue_ccb(ccb);
            if link.pending_ccb == Some(ccb) {
                link.pending_ccb = None;
            }
        }

        self.ccbs.release(ccb.0);
        Some(lcb)
    }

    /// Channel with this local CID, optionally restricted to one link
    pub fn find_ccb_by_cid(&self, lcb: Option<LcbHandle>, local_cid: u16) -> Option<CcbHandle> {
        let index = usize::from(local_cid.checked_sub(L2CAP_BASE_APPL_CID)?);
        let ccb = CcbHandle(self.ccbs.handle_at(index)?);
        match lcb {
            Some(lcb) if self.channel(ccb)?.lcb != lcb => None,
            _ => Some(ccb),
        }
    }

    pub(crate) fn find_ccb_by_remote_cid(&self, lcb: LcbHandle, remote_cid: u16) -> Option<CcbHandle> {
        self.link(lcb)?
            .ccbs
            .iter()
            .copied()
            .find(|&c| self.channel(c).map_or(false, |chan| chan.remote_cid == remote_cid))
    }

    /// Tears the channel down on our side and tells the owner without
    /// waiting for the peer
    pub(crate) fn disconnect_chnl(&mut self, ccb: CcbHandle) {
        let Some(chan) = self.channel(ccb) else {
            return;
        };
        let (lcid, owner) = (chan.local_cid, chan.owner.clone());
        warn!("L2CAP disconnecting CID 0x{:04X}", lcid);

        self.send_peer_disc_req(ccb);
        self.release_ccb(ccb);
        if let Some(owner) = owner {
            owner.disconnect_ind(lcid, false);
        }
    }

    /// Last channel left the link: arm the idle timer, or drop the link now
    /// when it has no idle timeout
    pub(crate) fn no_dynamic_ccbs(&mut self, lcb: LcbHandle) {
        let Some(link) = self.link(lcb) else {
            return;
        };
        if link.is_bonding {
            return;
        }

        let (handle, idle_timeout) = (link.handle, link.idle_timeout);
        let mut timeout_ms = u64::from(idle_timeout) * 1000;

        if idle_timeout == L2CAP_NO_IDLE_TIMEOUT {
            debug!("L2CAP {} has no channels, keeping it", lcb);
            self.timers.cancel(TimerId::Link(lcb));
            return;
        }

        if idle_timeout == 0 {
            match self.security.disconnect(handle, HCI_ERR_PEER_USER) {
                SecurityStatus::CmdStarted => {
                    self.set_link_state(lcb, LinkState::Disconnecting);
                    timeout_ms = L2CAP_LINK_DISCONNECT_TIMEOUT_MS;
                }
                SecurityStatus::Success => {
                    self.set_link_state(lcb, LinkState::Disconnecting);
                    timeout_ms = 0;
                }
                _ if self.link(lcb).map_or(false, |l| l.is_bonding) => {
                    self.hci.send_command(HciCommand::Disconnect {
                        handle,
                        reason: HCI_ERR_PEER_USER,
                    });
                    self.set_link_state(lcb, LinkState::Disconnecting);
                    timeout_ms = L2CAP_LINK_DISCONNECT_TIMEOUT_MS;
                }
                // Security is busy, ask again shortly
                _ => timeout_ms = L2CAP_LINK_RETRY_TIMEOUT_MS,
            }
        }

        if timeout_ms > 0 {
            debug!("L2CAP {} idle, link timer {} ms", lcb, timeout_ms);
            self.timers.arm(TimerId::Link(lcb), timeout_ms);
        } else {
            self.timers.cancel(TimerId::Link(lcb));
        }
    }

    /// Dedicated bonding finished. Returns true when the link timer now
    /// decides the link's fate.
    pub fn start_post_bond_timer(&mut self, handle: u16) -> bool {
        let Some(lcb) = self.find_lcb_by_handle(handle) else {
            return true;
        };
        let Some(link) = self.link_mut(lcb) else {
            return true;
        };

        link.is_bonding = false;
        if !link.ccbs.is_empty() {
            return false;
        }

        if !matches!(
            link.state,
            LinkState::Connected | LinkState::Connecting | LinkState::Disconnecting
        ) {
            return false;
        }

        let mut timeout_ms = L2CAP_BONDING_TIMEOUT_MS;
        if link.idle_timeout == 0 {
            link.state = LinkState::Disconnecting;
            self.hci.send_command(HciCommand::Disconnect {
                handle,
                reason: HCI_ERR_PEER_USER,
            });
            timeout_ms = L2CAP_LINK_DISCONNECT_TIMEOUT_MS;
        }
        self.timers.arm(TimerId::Link(lcb), timeout_ms);
        true
    }

    pub(crate) fn set_link_state(&mut self, lcb: LcbHandle, state: LinkState) {
        if let Some(link) = self.link_mut(lcb) {
            if link.state != state {
                debug!("L2CAP {} {} -> {}", lcb, link.state, state);
                link.state = state;
            }
        }
    }
}
