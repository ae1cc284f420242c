//! Link flow control
//!
//! Shares the controller's ACL buffers between links. Every link gets a
//! transmit quota; when there are more low priority links than buffers the
//! low priority links get a quota of zero and take turns from a shared
//! round-robin allowance instead. A PDU longer than the controller's ACL
//! data size may leave only partially, in which case the link sends nothing
//! else until the remainder comes back through `segments_xmitted`.

use std::sync::Arc;

use log::{debug, trace, warn};

use super::ccb::CcbHandle;
use super::constants::*;
use super::interfaces::{ChannelOwner, TimerId};
use super::lcb::{LcbHandle, LinkState};
use super::manager::L2capManager;
use super::packet::build_basic_frame;
use super::types::{ChannelState, RetransmissionMode};
use crate::gap::Transport;
use crate::hci::constants::{ACL_PB_START_FLUSHABLE, ACL_PB_START_NON_FLUSHABLE};
use crate::hci::{AclHeader, AclPacket};

/// Owner to tell once a PDU has been handed to the controller
pub(crate) struct TxComplete {
    owner: Arc<dyn ChannelOwner>,
    lcid: u16,
    num_sdus: u16,
}

impl L2capManager {
    /// Recomputes the classic pool quotas
    pub(crate) fn adjust_allocation(&mut self) {
        self.adjust_pool_allocation(false);
    }

    /// Recomputes the LE pool quotas. Without dedicated LE buffers LE links
    /// are part of the classic pool.
    pub(crate) fn adjust_ble_allocation(&mut self) {
        self.adjust_pool_allocation(!self.controller.ble_shares_acl_bufs());
    }

    pub(crate) fn adjust_allocation_for(&mut self, transport: Transport) {
        if transport.is_le() {
            self.adjust_ble_allocation();
        } else {
            self.adjust_allocation();
        }
    }

    fn adjust_pool_allocation(&mut self, ble: bool) {
        let members: Vec<LcbHandle> = self
            .links()
            .filter(|(_, link)| self.uses_ble_pool(link.transport) == ble)
            .map(|(handle, _)| handle)
            .collect();

        let pool = if ble { &mut self.ble_pool } else { &mut self.classic_pool };
        let num_bufs = pool.num_bufs;

        if members.is_empty() {
            pool.round_robin_quota = 0;
            pool.round_robin_unacked = 0;
            pool.window = num_bufs;
            return;
        }

        let num_hipri = members
            .iter()
            .filter(|&&h| self.lcbs.get(h.0).map_or(false, |l| l.is_high_priority()))
            .count() as u16;
        let num_lowpri = members.len() as u16 - num_hipri;

        // High priority links get their minimum unless that starves the rest
        let mut hi_quota = self.controller.high_pri_min_xmit_quota;
        let low_min = u16::from(num_lowpri > 0);
        while num_hipri * hi_quota + low_min > num_bufs && hi_quota > 1 {
            hi_quota -= 1;
        }

        let low_quota = if num_hipri * hi_quota < num_bufs {
            num_bufs - num_hipri * hi_quota
        } else {
            1
        };

        let pool = if ble { &mut self.ble_pool } else { &mut self.classic_pool };
        let (qq, mut remainder) = if num_lowpri > low_quota {
            pool.round_robin_quota = low_quota;
            (0, 0)
        } else if num_lowpri > 0 {
            pool.round_robin_quota = 0;
            pool.round_robin_unacked = 0;
            (low_quota / num_lowpri, low_quota % num_lowpri)
        } else {
            pool.round_robin_quota = 0;
            (0, 0)
        };

        debug!(
            "L2CAP {} pool: {} bufs, {} high ({} each), {} low ({} each, rem {}), rr quota {}",
            if ble { "LE" } else { "ACL" },
            num_bufs,
            num_hipri,
            hi_quota,
            num_lowpri,
            qq,
            remainder,
            pool.round_robin_quota
        );

        let mut rr_unacked_added = 0u16;
        let mut kick = Vec::new();
        for handle in members {
            let Some(link) = self.lcbs.get_mut(handle.0) else {
                continue;
            };

            if link.is_high_priority() {
                link.link_xmit_quota = hi_quota;
            } else {
                // Buffers in flight move to the round-robin count
                if link.link_xmit_quota > 0 && qq == 0 {
                    rr_unacked_added = rr_unacked_added.saturating_add(link.sent_not_acked);
                }
                link.link_xmit_quota = qq;
                if remainder > 0 {
                    link.link_xmit_quota += 1;
                    remainder -= 1;
                }
            }

            trace!(
                "L2CAP {} handle 0x{:03X}: quota {}, sent not acked {}",
                link.bd_addr,
                link.handle,
                link.link_xmit_quota,
                link.sent_not_acked
            );

            if link.state == LinkState::Connected
                && !link.link_xmit_data_q.is_empty()
                && link.sent_not_acked < link.link_xmit_quota
            {
                kick.push(handle);
            }
        }

        let pool = if ble { &mut self.ble_pool } else { &mut self.classic_pool };
        pool.round_robin_unacked = pool.round_robin_unacked.saturating_add(rr_unacked_added);

        for handle in kick {
            self.timers
                .arm(TimerId::Link(handle), L2CAP_LINK_FLOW_CONTROL_TIMEOUT_MS);
        }
    }

    /// Gives every channel a hold queue quota from its data rates
    pub(crate) fn adjust_chnl_allocation(&mut self) {
        let handles: Vec<CcbHandle> = self.ccbs.handles().into_iter().map(CcbHandle).collect();
        for ccb in handles {
            if let Some(chan) = self.channel_mut(ccb) {
                chan.buff_quota =
                    L2CAP_CHNL_QUOTA_PER_RATE * (chan.tx_data_rate + chan.rx_data_rate);
                trace!(
                    "L2CAP CID 0x{:04X}: buff quota {}",
                    chan.local_cid,
                    chan.buff_quota
                );
            }
            self.check_channel_congestion(ccb);
        }
    }

    /// Reports the channel congested above its quota and relieved once it
    /// has drained to half of it
    pub(crate) fn check_channel_congestion(&mut self, ccb: CcbHandle) {
        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };
        if chan.buff_quota == 0 {
            return;
        }

        let queued = chan.xmit_hold_q.len();
        let congested = if chan.cong_sent {
            if queued > usize::from(chan.buff_quota / 2) {
                return;
            }
            false
        } else {
            if queued <= usize::from(chan.buff_quota) {
                return;
            }
            true
        };

        chan.cong_sent = congested;
        debug!(
            "L2CAP CID 0x{:04X}: congested {} ({} queued, quota {})",
            chan.local_cid, congested, queued, chan.buff_quota
        );
        if let Some(owner) = chan.owner.clone() {
            owner.congestion_status(chan.local_cid, congested);
        }
    }

    /// A power mode change is in flight and the link has data waiting
    pub(crate) fn link_check_power_mode(&self, lcb: LcbHandle) -> bool {
        let Some(link) = self.link(lcb) else {
            return false;
        };

        let has_data = !link.link_xmit_data_q.is_empty()
            || link
                .ccbs
                .iter()
                .any(|&c| self.channel(c).map_or(false, |c| !c.xmit_hold_q.is_empty()));

        has_data && self.acl.power_mode_pending(link.bd_addr)
    }

    /// Moves as much queued data to the controller as the quotas allow.
    ///
    /// `packet` is appended to the link queue first. When it belongs to a
    /// channel only link queue data is sent, so channel queues are not
    /// drained ahead of it.
    pub(crate) fn check_send_pkts(
        &mut self,
        lcb: Option<LcbHandle>,
        ccb: Option<CcbHandle>,
        packet: Option<AclPacket>,
    ) {
        let mut single_write = false;

        if let Some(packet) = packet {
            let Some(handle) = lcb else {
                warn!("L2CAP dropping packet without a link");
                return;
            };
            let Some(link) = self.link_mut(handle) else {
                warn!("L2CAP dropping packet for released link {}", handle);
                return;
            };

            single_write = ccb.is_some();
            link.link_xmit_data_q.push_back(packet);
            if link.link_xmit_quota == 0 {
                let transport = link.transport;
                self.pool_mut(transport).check_round_robin = true;
            }
        }

        match lcb {
            Some(handle) if self.link(handle).map_or(false, |l| l.link_xmit_quota != 0) => {
                self.send_on_link(handle, single_write)
            }
            _ => self.send_round_robin(lcb, single_write),
        }
    }

    fn send_round_robin(&mut self, lcb: Option<LcbHandle>, single_write: bool) {
        let capacity = self.lcbs.capacity();
        if capacity == 0 {
            return;
        }

        let start = match lcb {
            None => 0,
            Some(handle) if single_write => handle.0.index,
            Some(handle) => handle.0.index + 1,
        };

        for step in 0..capacity {
            let index = (start + step) % capacity;
            let Some(handle) = self.lcbs.handle_at(index).map(LcbHandle) else {
                continue;
            };
            let Some(link) = self.link(handle) else {
                continue;
            };

            let pool = self.pool(link.transport);
            if pool.window == 0 || pool.round_robin_unacked >= pool.round_robin_quota {
                continue;
            }

            if link.partial_segment_being_sent
                || link.state != LinkState::Connected
                || link.link_xmit_quota != 0
                || self.link_check_power_mode(handle)
            {
                continue;
            }

            let queued = self
                .link_mut(handle)
                .and_then(|l| l.link_xmit_data_q.pop_front());
            if let Some(packet) = queued {
                self.send_to_lower(handle, packet, None);
            } else if single_write {
                break;
            } else if let Some((packet, complete)) = self.get_next_buffer_to_send(handle) {
                self.send_to_lower(handle, packet, complete);
            }
        }

        for pool in [&mut self.classic_pool, &mut self.ble_pool] {
            if pool.round_robin_open() {
                pool.check_round_robin = false;
            }
        }
    }

    fn send_on_link(&mut self, lcb: LcbHandle, single_write: bool) {
        let Some(link) = self.link(lcb) else {
            return;
        };
        if link.partial_segment_being_sent
            || link.state != LinkState::Connected
            || self.link_check_power_mode(lcb)
        {
            return;
        }

        while self.link_can_send(lcb) {
            let Some(packet) = self.link_mut(lcb).and_then(|l| l.link_xmit_data_q.pop_front())
            else {
                break;
            };
            self.send_to_lower(lcb, packet, None);
        }

        if !single_write {
            while self.link_can_send(lcb) {
                let Some((packet, complete)) = self.get_next_buffer_to_send(lcb) else {
                    break;
                };
                self.send_to_lower(lcb, packet, complete);
            }
        }

        // Quotas may have been readjusted while another link was sending
        if let Some(link) = self.link(lcb) {
            if !link.link_xmit_data_q.is_empty() && link.sent_not_acked < link.link_xmit_quota {
                self.timers
                    .arm(TimerId::Link(lcb), L2CAP_LINK_FLOW_CONTROL_TIMEOUT_MS);
            }
        }
    }

    fn link_can_send(&self, lcb: LcbHandle) -> bool {
        self.link(lcb).map_or(false, |link| {
            !link.partial_segment_being_sent
                && self.pool(link.transport).window != 0
                && link.sent_not_acked < link.link_xmit_quota
        })
    }

    /// Hands one PDU to the HCI transport, charging the link and pool for
    /// the fragments it will take.
    fn send_to_lower(&mut self, lcb: LcbHandle, packet: AclPacket, complete: Option<TxComplete>) {
        let Some(transport) = self.link(lcb).map(|l| l.transport) else {
            return;
        };
        let acl_data_size = usize::from(self.acl_data_size(transport));
        let window = self.pool(transport).window;
        let Some(link) = self.link_mut(lcb) else {
            return;
        };

        let length = packet.payload.len();
        let num_segs = if length <= acl_data_size {
            1
        } else {
            let needed = length.div_ceil(acl_data_size) as u16;
            if link.link_xmit_quota == 0 {
                link.partial_segment_being_sent = true;
                1
            } else {
                let mut num_segs = needed;
                if num_segs > window {
                    num_segs = window;
                    link.partial_segment_being_sent = true;
                }
                let room = link.link_xmit_quota.saturating_sub(link.sent_not_acked);
                if num_segs > room {
                    num_segs = room;
                    link.partial_segment_being_sent = true;
                }
                num_segs
            }
        };

        let round_robin = link.link_xmit_quota == 0;
        link.sent_not_acked = link.sent_not_acked.saturating_add(num_segs);
        let (handle, sent_not_acked, quota) =
            (link.handle, link.sent_not_acked, link.link_xmit_quota);

        let pool = self.pool_mut(transport);
        pool.window = pool.window.saturating_sub(num_segs);
        if round_robin {
            pool.round_robin_unacked = pool.round_robin_unacked.saturating_add(num_segs);
        }

        trace!(
            "L2CAP TX handle 0x{:03X}: {} bytes in {} segs, window {}, sent {}/{}, rr {}/{}",
            handle,
            length,
            num_segs,
            pool.window,
            sent_not_acked,
            quota,
            pool.round_robin_unacked,
            pool.round_robin_quota
        );

        self.hci.send_acl(packet, num_segs);

        if let Some(complete) = complete {
            complete.owner.tx_complete(complete.lcid, complete.num_sdus);
        }
    }

    /// Next PDU from the channels of a link, highest priority channel
    /// first, stamped with its ACL header
    fn get_next_buffer_to_send(&mut self, lcb: LcbHandle) -> Option<(AclPacket, Option<TxComplete>)> {
        let link = self.link(lcb)?;
        let (transport, handle) = (link.transport, link.handle);

        let ccb = link.ccbs.iter().copied().find(|&c| {
            self.channel(c).map_or(false, |chan| {
                if chan.state != ChannelState::Open {
                    return false;
                }
                if transport.is_le() {
                    return !chan.xmit_hold_q.is_empty() || chan.le_tx_rest.is_some();
                }
                if chan.xmit_hold_q.is_empty() {
                    return false;
                }
                !(chan.peer_cfg.fcr_mode() == RetransmissionMode::EnhancedRetransmission
                    && self.fcr.is_flow_controlled(chan.local_cid))
            })
        })?;

        let payload = if transport.is_le() {
            self.next_le_segment(ccb)?
        } else {
            let (mode, lcid, rcid, mps) = self.classic_tx_params(ccb)?;
            if mode == RetransmissionMode::Basic {
                self.channel_mut(ccb)?.xmit_hold_q.pop_front()?
            } else {
                let chan = self.ccbs.get_mut(ccb.0)?;
                let body = self.fcr.next_segment(lcid, &mut chan.xmit_hold_q, mps)?;
                build_basic_frame(rcid, &body)
            }
        };

        let chan = self.channel(ccb)?;
        let complete = match (&chan.owner, chan.peer_cfg.fcr_mode()) {
            (_, RetransmissionMode::EnhancedRetransmission) => None,
            (Some(owner), _) => Some(TxComplete {
                owner: owner.clone(),
                lcid: chan.local_cid,
                num_sdus: 1,
            }),
            (None, _) => None,
        };

        let pb = if transport.is_le() || (!chan.is_flushable && self.controller.non_flushable_pbf) {
            ACL_PB_START_NON_FLUSHABLE
        } else {
            ACL_PB_START_FLUSHABLE
        };
        let length = payload.len().min(usize::from(self.acl_data_size(transport))) as u16;

        self.check_channel_congestion(ccb);

        Some((
            AclPacket {
                header: AclHeader::new(handle, pb, length),
                payload,
            },
            complete,
        ))
    }

    /// Mode, local CID, remote CID and MPS of a classic channel
    fn classic_tx_params(&self, ccb: CcbHandle) -> Option<(RetransmissionMode, u16, u16, u16)> {
        let chan = self.channel(ccb)?;
        Some((chan.peer_cfg.fcr_mode(), chan.local_cid, chan.remote_cid, chan.tx_mps))
    }

    /// Cuts the next K-frame off the head SDU, spending one peer credit.
    /// The first K-frame of an SDU carries the SDU length.
    fn next_le_segment(&mut self, ccb: CcbHandle) -> Option<Vec<u8>> {
        let chan = self.channel_mut(ccb)?;
        if chan.peer_conn_cfg.credits == 0 {
            debug!("L2CAP CID 0x{:04X}: no credits to send", chan.local_cid);
            return None;
        }

        let mps = usize::from(chan.peer_conn_cfg.mps.max(L2CAP_LE_MIN_MPS));
        let body = match chan.le_tx_rest.take() {
            Some(mut rest) => {
                if rest.len() > mps {
                    chan.le_tx_rest = Some(rest.split_off(mps));
                }
                rest
            }
            None => {
                let mut sdu = chan.xmit_hold_q.pop_front()?;
                let room = mps - L2CAP_SDU_LEN_OVERHEAD;
                if sdu.len() > room {
                    chan.le_tx_rest = Some(sdu.split_off(room));
                }
                let total = sdu.len() + chan.le_tx_rest.as_ref().map_or(0, Vec::len);
                let mut body = Vec::with_capacity(L2CAP_SDU_LEN_OVERHEAD + sdu.len());
                body.extend_from_slice(&(total as u16).to_le_bytes());
                body.extend_from_slice(&sdu);
                body
            }
        };

        chan.peer_conn_cfg.credits -= 1;
        Some(build_basic_frame(chan.remote_cid, &body))
    }

    /// Controller reported how many packets it has finished per handle
    pub fn process_num_completed_pkts(&mut self, completed: &[(u16, u16)]) {
        for &(handle, num_sent) in completed {
            let Some(lcb) = self.find_lcb_by_handle(handle) else {
                debug!("L2CAP completed packets for unknown handle 0x{:03X}", handle);
                continue;
            };
            self.num_completed(lcb, num_sent);
        }
    }

    fn num_completed(&mut self, lcb: LcbHandle, num_sent: u16) {
        let Some(link) = self.link_mut(lcb) else {
            return;
        };
        let transport = link.transport;
        let round_robin = link.link_xmit_quota == 0;
        let high_priority = link.is_high_priority();
        link.sent_not_acked = link.sent_not_acked.saturating_sub(num_sent);

        let pool = self.pool_mut(transport);
        pool.window = pool.window.saturating_add(num_sent).min(pool.num_bufs);
        if round_robin {
            pool.round_robin_unacked = pool.round_robin_unacked.saturating_sub(num_sent);
        }

        trace!(
            "L2CAP {} packets completed on {}, window {}",
            num_sent,
            lcb,
            pool.window
        );

        self.check_send_pkts(Some(lcb), None, None);

        // A busy high priority link may have starved the round-robin links
        let pool = self.pool(transport);
        if high_priority
            && pool.check_round_robin
            && pool.round_robin_unacked < pool.round_robin_quota
        {
            self.check_send_pkts(None, None, None);
        }
    }

    /// The transport sent the first fragments of a partially sent PDU and
    /// hands back the rest
    pub fn segments_xmitted(&mut self, handle: u16, remainder: AclPacket) {
        let Some(lcb) = self.find_lcb_by_handle(handle) else {
            warn!("L2CAP dropping partial segment, unknown handle 0x{:03X}", handle);
            return;
        };
        let Some(link) = self.link_mut(lcb) else {
            return;
        };
        if link.state != LinkState::Connected {
            debug!("L2CAP dropping partial segment, link not connected");
            return;
        }

        link.link_xmit_data_q.push_front(remainder);
        link.partial_segment_being_sent = false;
        self.check_send_pkts(Some(lcb), None, None);
    }

    /// Controller buffer count read at init or after a reset
    pub fn process_num_bufs(&mut self, num_acl_bufs: u16) {
        self.controller.num_acl_bufs = num_acl_bufs;
        self.classic_pool.num_bufs = num_acl_bufs;
        self.classic_pool.window = num_acl_bufs;
        self.adjust_allocation();
    }

    pub fn process_ble_num_bufs(&mut self, num_ble_bufs: u16) {
        self.controller.num_ble_bufs = num_ble_bufs;
        self.ble_pool.num_bufs = num_ble_bufs;
        self.ble_pool.window = num_ble_bufs;
        self.adjust_ble_allocation();
    }
}
