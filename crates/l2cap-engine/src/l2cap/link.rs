//! Link events
//!
//! Reactions to the controller's connection lifecycle for ACL links, the
//! link timers, and outgoing connection creation including the role switch
//! dance needed when another link has us as slave.

use log::{debug, error, info, warn};

use super::ccb::CcbHandle;
use super::constants::*;
use super::csm::CsmEvent;
use super::interfaces::{SecurityStatus, TimerId};
use super::lcb::{LcbHandle, LinkState};
use super::manager::L2capManager;
use super::types::{AclPriority, ChannelState};
use crate::acl::BtmStatus;
use crate::gap::{BdAddr, LinkRole, Transport};
use crate::hci::constants::*;
use crate::hci::HciCommand;

/// Links we will take part in before refusing to let the peer switch roles
const MAX_LINKS_ALLOWING_SWITCH: usize = 3;

impl L2capManager {
    /// Incoming ACL connection request. Returns true when it was accepted.
    pub fn hci_conn_req(&mut self, bd_addr: BdAddr) -> bool {
        let Some(lcb) = self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr) else {
            let Some(lcb) = self.allocate_lcb(bd_addr, false, Transport::BrEdr) else {
                error!("L2CAP failed to allocate LCB for {}", bd_addr);
                self.hci.send_command(HciCommand::RejectConnectionRequest {
                    bd_addr,
                    reason: HCI_ERR_HOST_REJECT_RESOURCES,
                });
                return false;
            };

            // Already in a piconet: accept as master
            let role = if self.links().any(|(other, _)| other != lcb) {
                LinkRole::Master
            } else {
                self.conn_role(bd_addr)
            };

            if let Some(link) = self.link_mut(lcb) {
                link.role = role;
                link.state = LinkState::Connecting;
            }
            self.hci
                .send_command(HciCommand::AcceptConnectionRequest { bd_addr, role });
            self.timers
                .arm(TimerId::Link(lcb), L2CAP_LINK_CONNECT_TIMEOUT_MS);
            return true;
        };

        let Some(state) = self.link(lcb).map(|l| l.state) else {
            return false;
        };
        match state {
            LinkState::Connecting | LinkState::ConnectHolding => {
                // Collision: accept anyway
                let role = self.conn_role(bd_addr);
                if let Some(link) = self.link_mut(lcb) {
                    link.role = role;
                    link.state = LinkState::Connecting;
                }
                self.hci
                    .send_command(HciCommand::AcceptConnectionRequest { bd_addr, role });
                true
            }
            LinkState::Disconnecting => {
                self.hci.send_command(HciCommand::RejectConnectionRequest {
                    bd_addr,
                    reason: HCI_ERR_HOST_REJECT_DEVICE,
                });
                false
            }
            _ => {
                error!("L2CAP got conn_req from {} while {}, rejecting", bd_addr, state);
                self.hci.send_command(HciCommand::RejectConnectionRequest {
                    bd_addr,
                    reason: HCI_ERR_CONNECTION_EXISTS,
                });
                false
            }
        }
    }

    fn conn_role(&self, bd_addr: BdAddr) -> LinkRole {
        if self.acl.peer_supports_role_switch(bd_addr) {
            self.desired_role
        } else {
            LinkRole::Slave
        }
    }

    /// ACL connection complete, successful or not
    pub fn hci_conn_comp(&mut self, status: u8, handle: u16, bd_addr: BdAddr) -> bool {
        let lcb = match self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr) {
            Some(lcb) => lcb,
            None => {
                warn!("L2CAP conn_comp from unknown {}, allocating", bd_addr);
                let Some(lcb) = self.allocate_lcb(bd_addr, false, Transport::BrEdr) else {
                    warn!("L2CAP failed to allocate LCB for {}", bd_addr);
                    return false;
                };
                self.set_link_state(lcb, LinkState::Connecting);
                lcb
            }
        };

        let Some(link) = self.link(lcb) else {
            return false;
        };
        if link.state != LinkState::Connecting {
            error!(
                "L2CAP got conn_comp in bad state: {} status: 0x{:02X}",
                link.state, status
            );
            let old_handle = link.handle;
            if status != HCI_SUCCESS {
                self.hci_disc_comp(old_handle, status);
            }
            return false;
        }

        if let Some(link) = self.link_mut(lcb) {
            link.handle = handle;
        }

        if status == HCI_SUCCESS {
            info!("L2CAP link up to {} handle 0x{:04X}", bd_addr, handle);
            self.set_link_state(lcb, LinkState::Connected);
            self.send_peer_info_req(lcb, L2CAP_EXTENDED_FEATURES_INFO_TYPE);

            let (role, is_bonding) = self.link(lcb).map_or((LinkRole::Master, false), |l| (l.role, l.is_bonding));
            self.acl
                .acl_created(bd_addr, None, handle, role, Transport::BrEdr);

            if is_bonding && self.start_post_bond_timer(handle) {
                return true;
            }

            self.timers.cancel(TimerId::Link(lcb));
            for ccb in self.link_ccbs(lcb) {
                self.csm_execute(ccb, CsmEvent::LpConnectCfm);
            }

            if self.link(lcb).map_or(false, |l| l.ccbs.is_empty()) {
                self.timers
                    .arm(TimerId::Link(lcb), L2CAP_LINK_STARTUP_TOUT_MS);
            }
        } else if status == HCI_ERR_MAX_NUM_OF_CONNECTIONS && self.lcb_disconnecting() {
            // Retried once the other link is gone
            debug!("L2CAP holding connection to {}", bd_addr);
            self.set_link_state(lcb, LinkState::ConnectHolding);
            if let Some(link) = self.link_mut(lcb) {
                link.handle = HCI_INVALID_HANDLE;
            }
        } else {
            warn!("L2CAP connection to {} failed: 0x{:02X}", bd_addr, status);
            self.set_link_state(lcb, LinkState::Disconnecting);

            for ccb in self.link_ccbs(lcb) {
                self.csm_execute(ccb, CsmEvent::LpConnectCfmNeg { status });
            }

            let Some(link) = self.link_mut(lcb) else {
                return true;
            };
            link.disc_reason = status;

            if link.ccbs.is_empty() {
                self.release_lcb(lcb);
            } else if status == HCI_ERR_CONNECTION_EXISTS {
                // Collision: wait for the peer's connection request
                link.state = LinkState::Connecting;
            } else {
                self.create_conn_br_edr(lcb);
            }
        }
        true
    }

    /// LE connection complete. As master the link waits for remote feature
    /// discovery and comes up through `ble_link_up`; as slave it is usable
    /// right away.
    pub fn ble_conn_comp(&mut self, handle: u16, role: LinkRole, bd_addr: BdAddr) {
        let lcb = match self.find_lcb_by_bd_addr(bd_addr, Transport::Le) {
            Some(lcb) => {
                let state = self.link(lcb).map(|l| l.state);
                if role == LinkRole::Master && state != Some(LinkState::Connecting) {
                    error!("L2CAP got LE conn_comp as master in bad state: {:?}", state);
                    return;
                }
                lcb
            }
            // Peer connected to us while advertising
            None => match self.allocate_lcb(bd_addr, false, Transport::Le) {
                Some(lcb) => lcb,
                None => {
                    error!("L2CAP failed to allocate LCB for LE {}", bd_addr);
                    self.security.disconnect(handle, HCI_ERR_NO_CONNECTION);
                    return;
                }
            },
        };

        if role == LinkRole::Master {
            self.timers.cancel(TimerId::Link(lcb));
        }

        if let Some(link) = self.link_mut(lcb) {
            link.handle = handle;
            link.role = role;
            link.transport = Transport::Le;
        }
        info!("L2CAP LE link up to {} handle 0x{:04X} as {:?}", bd_addr, handle, role);
        self.acl.acl_created(bd_addr, None, handle, role, Transport::Le);

        if role == LinkRole::Slave {
            self.ble_link_up(bd_addr);
        }
    }

    /// LE link finished feature discovery: channels waiting on it start
    pub fn ble_link_up(&mut self, bd_addr: BdAddr) {
        let Some(lcb) = self.find_lcb_by_bd_addr(bd_addr, Transport::Le) else {
            return;
        };
        if self.link(lcb).map_or(false, |l| l.handle == HCI_INVALID_HANDLE) {
            warn!("L2CAP LE link up for {} before conn_comp", bd_addr);
            return;
        }
        self.set_link_state(lcb, LinkState::Connected);

        for ccb in self.link_ccbs(lcb) {
            if self.channel(ccb).map_or(false, |c| c.state == ChannelState::Closed) {
                self.csm_execute(ccb, CsmEvent::LpConnectCfm);
            }
        }
        if self.link(lcb).map_or(false, |l| l.ccbs.is_empty()) {
            self.timers
                .arm(TimerId::Link(lcb), L2CAP_LINK_STARTUP_TOUT_MS);
        }
    }

    /// Security verdict for a channel on the link to `bd_addr`
    pub fn link_sec_comp(
        &mut self,
        bd_addr: BdAddr,
        transport: Transport,
        ccb: CcbHandle,
        status: SecurityStatus,
    ) {
        let Some(lcb) = self.find_lcb_by_bd_addr(bd_addr, transport) else {
            warn!("L2CAP got sec_comp for unknown {}", bd_addr);
            return;
        };
        if !self.link(lcb).map_or(false, |l| l.ccbs.contains(&ccb)) {
            warn!("L2CAP sec_comp for {} not on link to {}", ccb, bd_addr);
            return;
        }
        self.sec_comp(ccb, status);
    }

    /// Security manager finished something that may unblock channels
    /// waiting on it
    pub fn resubmit_pending_sec_req(&mut self, bd_addr: Option<BdAddr>) {
        let links: Vec<LcbHandle> = match bd_addr {
            Some(bd_addr) => match self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr) {
                Some(lcb) => vec![lcb],
                None => {
                    warn!("L2CAP resubmit for unknown {}", bd_addr);
                    return;
                }
            },
            None => self.links().map(|(lcb, _)| lcb).collect(),
        };

        for lcb in links {
            for ccb in self.link_ccbs(lcb) {
                self.csm_execute(ccb, CsmEvent::SecReSendCmd);
            }
        }
    }

    /// ACL disconnect complete. Returns true when the handle was ours.
    pub fn hci_disc_comp(&mut self, handle: u16, reason: u8) -> bool {
        let mut lcb_is_free = true;
        let known = match self.find_lcb_by_handle(handle) {
            None => false,
            Some(lcb) => {
                info!("L2CAP link 0x{:04X} down, reason 0x{:02X}", handle, reason);
                let Some(link) = self.link_mut(lcb) else {
                    return false;
                };
                link.disc_reason = reason;
                link.state = LinkState::Disconnecting;
                let pending = link.pending_ccb;

                // A channel reconnecting over this link is retried below
                for ccb in self.link_ccbs(lcb) {
                    if Some(ccb) != pending {
                        self.csm_execute(ccb, CsmEvent::LpDisconnectInd { reason: Some(reason) });
                    }
                }

                let Some(link) = self.link_mut(lcb) else {
                    return true;
                };
                if !link.ccbs.is_empty() || link.pending_ccb.is_some() {
                    debug!("L2CAP restarting pending ACL request to {}", link.bd_addr);
                    link.link_xmit_data_q.clear();
                    let (bd_addr, transport) = (link.bd_addr, link.transport);

                    let restarted = if transport.is_le() {
                        // LE always drops the ACL so remote features are read again
                        self.acl.acl_removed(bd_addr, transport);
                        self.create_conn_le(lcb)
                    } else {
                        self.create_conn_br_edr(lcb)
                    };
                    lcb_is_free = !restarted;
                }

                if let Some(link) = self.link_mut(lcb) {
                    link.pending_ccb = None;
                }
                if lcb_is_free {
                    self.release_lcb(lcb);
                }
                true
            }
        };

        // A connection slot just freed up
        if lcb_is_free {
            if let Some(holding) = self.find_lcb_by_state(LinkState::ConnectHolding) {
                self.create_conn_br_edr(holding);
            }
        }
        known
    }

    pub fn hci_qos_violation(&mut self, handle: u16) -> bool {
        let Some(lcb) = self.find_lcb_by_handle(handle) else {
            return false;
        };
        for ccb in self.link_ccbs(lcb) {
            self.csm_execute(ccb, CsmEvent::LpQosViolationInd);
        }
        true
    }

    /// Link timer expiry: connect/disconnect supervision, idle disconnect,
    /// and the flow control retry
    pub fn link_timeout(&mut self, lcb: LcbHandle) {
        let Some(link) = self.link(lcb) else {
            warn!("L2CAP link timer for stale {}", lcb);
            return;
        };
        debug!(
            "L2CAP link timeout {} state {} channels {} bonding {}",
            lcb,
            link.state,
            link.ccbs.len(),
            link.is_bonding
        );

        if matches!(
            link.state,
            LinkState::ConnectingWaitSwitch
                | LinkState::Connecting
                | LinkState::ConnectHolding
                | LinkState::Disconnecting
        ) {
            if let Some(link) = self.link_mut(lcb) {
                link.pending_ccb = None;
            }
            for ccb in self.link_ccbs(lcb) {
                self.csm_execute(ccb, CsmEvent::LpDisconnectInd { reason: None });
            }
            self.release_lcb(lcb);
            return;
        }

        let Some(link) = self.link(lcb) else {
            return;
        };
        if link.state != LinkState::Connected {
            return;
        }

        if !link.ccbs.is_empty() {
            // We may have been flow controlled
            self.check_send_pkts(Some(lcb), None, None);
            return;
        }

        let (handle, is_bonding) = (link.handle, link.is_bonding);
        let timeout_ms = match self.security.disconnect(handle, HCI_ERR_PEER_USER) {
            // Security manager disconnects once it is done
            SecurityStatus::CmdStored | SecurityStatus::Busy => None,
            SecurityStatus::CmdStarted => {
                self.set_link_state(lcb, LinkState::Disconnecting);
                Some(L2CAP_LINK_DISCONNECT_TIMEOUT_MS)
            }
            SecurityStatus::Success => {
                self.set_link_state(lcb, LinkState::Disconnecting);
                None
            }
            _ if is_bonding => {
                self.hci.send_command(HciCommand::Disconnect {
                    handle,
                    reason: HCI_ERR_PEER_USER,
                });
                self.set_link_state(lcb, LinkState::Disconnecting);
                Some(L2CAP_LINK_DISCONNECT_TIMEOUT_MS)
            }
            _ => Some(L2CAP_LINK_RETRY_TIMEOUT_MS),
        };

        if let Some(timeout_ms) = timeout_ms {
            self.timers.arm(TimerId::Link(lcb), timeout_ms);
        }
    }

    /// Gave up waiting for the peer's features; carry on with basic mode
    pub fn info_resp_timeout(&mut self, lcb: LcbHandle) {
        let Some(link) = self.link(lcb) else {
            return;
        };
        if !link.w4_info_rsp {
            return;
        }

        // Security still running: give the peer more time
        let securing = link.ccbs.iter().any(|&ccb| {
            self.channel(ccb).map_or(false, |c| {
                matches!(c.state, ChannelState::OrigW4SecComp | ChannelState::TermW4SecComp)
            })
        });
        if securing {
            self.timers
                .arm(TimerId::InfoRsp(lcb), L2CAP_WAIT_INFO_RSP_TIMEOUT_MS);
            return;
        }

        warn!("L2CAP no info response from {}", link.bd_addr);
        let state = link.state;
        if let Some(link) = self.link_mut(lcb) {
            link.w4_info_rsp = false;
        }

        if !matches!(state, LinkState::Disconnected | LinkState::Disconnecting) {
            for ccb in self.link_ccbs(lcb) {
                self.csm_execute(ccb, CsmEvent::L2capInfoRsp);
            }
        }
    }

    /// Peer answered one of our information requests
    pub(crate) fn process_info_rsp(&mut self, lcb: LcbHandle, info_type: u16, result: u16, data: &[u8]) {
        if self.link(lcb).map_or(false, |l| l.w4_info_rsp) {
            self.timers.cancel(TimerId::InfoRsp(lcb));
            if let Some(link) = self.link_mut(lcb) {
                link.w4_info_rsp = false;
            }
        }

        let success = result == L2CAP_INFO_RESP_RESULT_SUCCESS;
        match info_type {
            L2CAP_EXTENDED_FEATURES_INFO_TYPE if success => {
                let Some(bytes) = data.get(..4) else {
                    warn!("L2CAP short extended features response");
                    return;
                };
                let features = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                debug!("L2CAP peer extended features 0x{:08X}", features);
                if let Some(link) = self.link_mut(lcb) {
                    link.peer_ext_fea = features;
                }

                if features & L2CAP_EXTFEA_FIXED_CHNLS != 0 {
                    self.send_peer_info_req(lcb, L2CAP_FIXED_CHANNELS_INFO_TYPE);
                    return;
                }
            }
            L2CAP_FIXED_CHANNELS_INFO_TYPE if success => {
                let Some(bytes) = data.get(..8) else {
                    warn!("L2CAP short fixed channels response");
                    return;
                };
                let mut mask = [0u8; 8];
                mask.copy_from_slice(bytes);
                if let Some(link) = self.link_mut(lcb) {
                    link.peer_chnl_mask = u64::from_le_bytes(mask);
                }
            }
            _ => {}
        }

        for ccb in self.link_ccbs(lcb) {
            self.csm_execute(ccb, CsmEvent::L2capInfoRsp);
        }
    }

    /// Timer expiry routed to whatever owns the timer
    pub fn timer_expired(&mut self, id: TimerId) {
        match id {
            TimerId::Channel(ccb) => self.csm_execute(ccb, CsmEvent::Timeout),
            TimerId::ChannelAck(ccb) => self.csm_execute(ccb, CsmEvent::AckTimeout),
            TimerId::Link(lcb) => self.link_timeout(lcb),
            TimerId::InfoRsp(lcb) => self.info_resp_timeout(lcb),
        }
    }

    /// Role change on a classic link, or the failure of one we asked for
    pub fn role_changed(&mut self, bd_addr: Option<BdAddr>, new_role: LinkRole, hci_status: u8) {
        if let Some(bd_addr) = bd_addr {
            if let Some(lcb) = self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr) {
                if let Some(link) = self.link_mut(lcb) {
                    debug!("L2CAP {} role now {:?}", bd_addr, new_role);
                    link.role = new_role;
                }
                if hci_status == HCI_SUCCESS {
                    self.reapply_acl_priority(lcb);
                }
            }
        }

        let waiting: Vec<LcbHandle> = self
            .links()
            .filter(|(_, link)| link.state == LinkState::ConnectingWaitSwitch)
            .map(|(lcb, _)| lcb)
            .collect();
        for lcb in waiting {
            self.create_conn_after_switch(lcb);
        }
    }

    /// Pairing on a link without channels gets the extended connect timer
    pub fn pin_code_request(&mut self, bd_addr: BdAddr) {
        let Some(lcb) = self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr) else {
            return;
        };
        if self.link(lcb).map_or(false, |l| l.ccbs.is_empty()) {
            self.timers
                .arm(TimerId::Link(lcb), L2CAP_LINK_CONNECT_EXT_TIMEOUT_MS);
        }
    }

    /// Brings up an ACL link for a link block we just allocated
    pub(crate) fn create_conn(&mut self, lcb: LcbHandle) -> bool {
        match self.link(lcb).map(|l| l.transport) {
            Some(Transport::Le) => self.create_conn_le(lcb),
            Some(Transport::BrEdr) => self.create_conn_br_edr(lcb),
            None => false,
        }
    }

    pub(crate) fn create_conn_le(&mut self, lcb: LcbHandle) -> bool {
        let Some(link) = self.link_mut(lcb) else {
            return false;
        };
        link.transport = Transport::Le;
        link.state = LinkState::Connecting;
        let peer_addr = link.bd_addr;

        debug!("L2CAP LE connect to {}", peer_addr);
        self.hci.send_command(HciCommand::LeCreateConnection {
            peer_addr,
            peer_addr_type: 0,
        });
        self.timers
            .arm(TimerId::Link(lcb), L2CAP_BLE_LINK_CONNECT_TIMEOUT_MS);
        true
    }

    /// Classic connect. When some other link has us as slave we first ask
    /// to become master there and connect once the switch resolves.
    pub(crate) fn create_conn_br_edr(&mut self, lcb: LcbHandle) -> bool {
        let slave_links: Vec<BdAddr> = self
            .links()
            .filter(|(other, link)| *other != lcb && link.role == LinkRole::Slave)
            .map(|(_, link)| link.bd_addr)
            .collect();

        if self.controller.supports_role_switch {
            for peer in slave_links {
                if let Some(link) = self.link_mut(lcb) {
                    link.state = LinkState::ConnectingWaitSwitch;
                    link.role = LinkRole::Master;
                }

                if self.acl.switch_role(peer, LinkRole::Master) == BtmStatus::CmdStarted {
                    debug!("L2CAP {} waits for role switch with {}", lcb, peer);
                    self.timers
                        .arm(TimerId::Link(lcb), L2CAP_LINK_ROLE_SWITCH_TIMEOUT_MS);
                    return true;
                }
            }
        }

        self.set_link_state(lcb, LinkState::Connecting);
        self.create_conn_after_switch(lcb)
    }

    pub(crate) fn create_conn_after_switch(&mut self, lcb: LcbHandle) -> bool {
        let num_links = self.lcbs.len();
        let num_high = self.links().filter(|(_, l)| l.is_high_priority()).count();
        let switch_ok = !self.disallow_switch && num_links < MAX_LINKS_ALLOWING_SWITCH;
        let supported = self.controller.supports_role_switch;
        let Some(link) = self.link_mut(lcb) else {
            return false;
        };

        let allow_role_switch = (switch_ok || (link.is_bonding && num_high == 0)) && supported;
        link.state = LinkState::Connecting;
        let bd_addr = link.bd_addr;

        debug!(
            "L2CAP connect to {} links:{} high:{} switch:{}",
            bd_addr, num_links, num_high, allow_role_switch
        );
        self.hci.send_command(HciCommand::CreateConnection {
            bd_addr,
            packet_type: HCI_PKT_TYPES_MASK_ACL_DEFAULT,
            page_scan_repetition_mode: HCI_PAGE_SCAN_REP_MODE_R1,
            clock_offset: 0,
            allow_role_switch,
        });
        self.timers
            .arm(TimerId::Link(lcb), L2CAP_LINK_CONNECT_TIMEOUT_MS);
        true
    }

    /// Controller reset: every link with a handle goes down
    pub fn device_reset(&mut self) {
        let handles: Vec<u16> = self
            .links()
            .map(|(_, link)| link.handle)
            .filter(|&handle| handle != HCI_INVALID_HANDLE)
            .collect();
        info!("L2CAP device reset, dropping {} links", handles.len());
        for handle in handles {
            self.hci_disc_comp(handle, HCI_ERR_HW_FAILURE);
        }
    }

    /// Changes the transmit priority of the classic link to `bd_addr`.
    /// Returns false when there is no such link.
    pub fn set_acl_priority(&mut self, bd_addr: BdAddr, priority: AclPriority) -> bool {
        let Some(lcb) = self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr) else {
            warn!("L2CAP no link to {} for ACL priority", bd_addr);
            return false;
        };
        let Some(link) = self.link_mut(lcb) else {
            return false;
        };

        if link.acl_priority != priority {
            debug!("L2CAP {} ACL priority {:?}", bd_addr, priority);
            link.acl_priority = priority;
            self.adjust_allocation();
        }
        true
    }

    /// A role switch resets controller side priority; the high quota has
    /// to be recomputed for the link
    fn reapply_acl_priority(&mut self, lcb: LcbHandle) {
        if self.link(lcb).map_or(false, |l| l.is_high_priority()) {
            self.adjust_allocation();
        }
    }
}
