//! Configuration negotiation
//!
//! Checks and records the options carried by configuration requests and
//! responses in both directions. The functions take the `ConfigInfo` by
//! mutable reference: whatever is left in it is what the owner sees in its
//! indication, or what goes back to the peer in the response.

use log::{debug, error, warn};

use super::ccb::{CcbHandle, PeerCfgBits};
use super::constants::*;
use super::interfaces::TimerId;
use super::manager::L2capManager;
use super::types::*;
use crate::hci::constants::HCI_MAX_AUTOMATIC_FLUSH_TIMEOUT;
use crate::hci::HciCommand;

/// Features a retransmission mode needs from the peer
fn mode_supported(mode: RetransmissionMode, peer_ext_fea: u32) -> bool {
    match mode {
        RetransmissionMode::Basic => true,
        RetransmissionMode::EnhancedRetransmission => peer_ext_fea & L2CAP_EXTFEA_ENH_RETRANS != 0,
        RetransmissionMode::Streaming => peer_ext_fea & L2CAP_EXTFEA_STREAM_MODE != 0,
        RetransmissionMode::Retransmission | RetransmissionMode::FlowControl => false,
    }
}

impl L2capManager {
    /// Checks a configuration request from the peer.
    ///
    /// Accepted values are saved so a follow-up request that leaves an
    /// option out inherits it. On an unacceptable verdict only the
    /// offending options stay in `cfg`, holding the values we suggest.
    pub(crate) fn process_peer_cfg_req(
        &mut self,
        ccb: CcbHandle,
        cfg: &mut ConfigInfo,
    ) -> PeerCfgVerdict {
        let Some(chan) = self.channel_mut(ccb) else {
            return PeerCfgVerdict::Disconnect;
        };

        let mut mtu_ok = true;
        let mut flush_to_ok = true;
        let mut qos_ok = true;

        match cfg.mtu {
            Some(mtu) if mtu >= L2CAP_MIN_MTU => {
                // Basic mode MTU is bounded by our receive buffer
                let mtu = if cfg.fcr.is_none() { mtu.min(L2CAP_MTU_SIZE) } else { mtu };
                cfg.mtu = Some(mtu);
                chan.peer_cfg.mtu = Some(mtu);
                chan.peer_mtu = mtu;
                chan.peer_cfg_bits |= PeerCfgBits::MTU;
            }
            Some(_) => {
                cfg.mtu = Some(L2CAP_MIN_MTU);
                mtu_ok = false;
            }
            None => cfg.mtu = chan.peer_cfg.mtu,
        }

        match cfg.flush_timeout {
            // Zero is illegal, suggest infinite retransmissions
            Some(0) => {
                cfg.flush_timeout = Some(L2CAP_DEFAULT_FLUSH_TO);
                flush_to_ok = false;
            }
            Some(flush_to) => {
                chan.peer_cfg.flush_timeout = Some(flush_to);
                chan.peer_cfg_bits |= PeerCfgBits::FLUSH_TO;
            }
            None => cfg.flush_timeout = chan.peer_cfg.flush_timeout,
        }

        match cfg.qos.as_mut() {
            Some(qos) if qos.service_type <= GUARANTEED => {
                chan.peer_cfg.qos = Some(*qos);
                chan.peer_cfg_bits |= PeerCfgBits::QOS;
            }
            Some(qos) => {
                qos.service_type = BEST_EFFORT;
                qos_ok = false;
            }
            None => cfg.qos = chan.peer_cfg.qos,
        }

        let fcr_verdict = {
            let requested = cfg.fcr_mode();
            let ours = match chan.our_cfg.fcr {
                Some(fcr) => fcr.mode,
                None => chan.ertm_info.preferred_mode,
            };
            let allowed = chan.ertm_info.allowed_modes & requested.allowed_bit() != 0;

            if allowed && requested == ours {
                chan.peer_cfg.fcr = cfg.fcr;
                chan.peer_cfg.fcs = cfg.fcs;
                if let Some(fcr) = cfg.fcr.as_mut() {
                    if fcr.mode == RetransmissionMode::EnhancedRetransmission {
                        fcr.retransmit_timeout = L2CAP_MIN_RETRANS_TOUT;
                        fcr.monitor_timeout = L2CAP_MIN_MONITOR_TOUT;
                    }
                }
                PeerCfgVerdict::Ok
            } else if chan.fcr_cfg_tries > 0 {
                chan.fcr_cfg_tries -= 1;
                debug!(
                    "L2CAP CID 0x{:04X}: peer asked for {:?}, suggesting {:?}",
                    chan.local_cid, requested, ours
                );
                cfg.fcr = Some(RetransmissionFlowControl {
                    mode: ours,
                    ..cfg.fcr.unwrap_or_default()
                });
                PeerCfgVerdict::Unacceptable
            } else {
                PeerCfgVerdict::Disconnect
            }
        };

        if fcr_verdict == PeerCfgVerdict::Disconnect {
            warn!(
                "L2CAP CID 0x{:04X}: incompatible channel modes, disconnecting",
                chan.local_cid
            );
            cfg.result = L2CAP_CFG_FAILED_NO_REASON;
            cfg.mtu = None;
            cfg.qos = None;
            cfg.flush_timeout = None;
            return PeerCfgVerdict::Disconnect;
        }

        let fcr_ok = fcr_verdict == PeerCfgVerdict::Ok;
        if mtu_ok && flush_to_ok && qos_ok && fcr_ok {
            self.adjust_out_mps(ccb);
            return PeerCfgVerdict::Ok;
        }

        cfg.result = L2CAP_CFG_UNACCEPTABLE_PARAMS;
        if mtu_ok {
            cfg.mtu = None;
        }
        if flush_to_ok {
            cfg.flush_timeout = None;
        }
        if qos_ok {
            cfg.qos = None;
        }
        if fcr_ok {
            cfg.fcr = None;
        }
        PeerCfgVerdict::Unacceptable
    }

    /// Records what the peer accepted in its configuration response
    pub(crate) fn process_peer_cfg_rsp(&mut self, ccb: CcbHandle, cfg: &ConfigInfo) {
        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };

        if let (Some(qos), Some(_)) = (cfg.qos, chan.our_cfg.qos) {
            chan.our_cfg.qos = Some(qos);
        }

        if let Some(fcr) = cfg.fcr {
            if fcr.mode == RetransmissionMode::EnhancedRetransmission {
                let peer = chan.peer_cfg.fcr.get_or_insert(RetransmissionFlowControl {
                    mode: fcr.mode,
                    ..Default::default()
                });
                peer.retransmit_timeout = fcr.retransmit_timeout;
                peer.monitor_timeout = fcr.monitor_timeout;
            }
        }
    }

    /// Records and normalises the configuration request we are about to
    /// send. A flush timeout shorter than the link's is pushed down to the
    /// controller.
    pub(crate) fn process_our_cfg_req(&mut self, ccb: CcbHandle, cfg: &mut ConfigInfo) {
        let Some((lcb, peer_ext_fea)) = self
            .channel(ccb)
            .and_then(|c| self.link(c.lcb).map(|l| (c.lcb, l.peer_ext_fea)))
        else {
            return;
        };
        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };

        if let Some(qos) = cfg.qos {
            chan.our_cfg.qos = Some(qos);
        }

        match cfg.fcr.as_mut() {
            Some(fcr) => {
                if fcr.mode == RetransmissionMode::Basic {
                    *fcr = RetransmissionFlowControl::default();
                } else {
                    // Timers are only carried in the response on BR/EDR
                    fcr.retransmit_timeout = 0;
                    fcr.monitor_timeout = 0;
                    if fcr.mode == RetransmissionMode::Streaming {
                        fcr.max_transmit = 0;
                        fcr.tx_window_size = 0;
                    }
                }

                if peer_ext_fea & L2CAP_EXTFEA_NO_CRC == 0 {
                    cfg.fcs = None;
                }
            }
            None => cfg.fcs = None,
        }

        let mode = cfg.fcr_mode();
        chan.our_cfg.fcr = Some(RetransmissionFlowControl {
            mode,
            ..cfg.fcr.unwrap_or_default()
        });

        let flush_to = match cfg.flush_timeout {
            Some(0) | Some(L2CAP_NO_AUTOMATIC_FLUSH) => {
                cfg.flush_timeout = None;
                return;
            }
            Some(flush_to) => flush_to,
            None => return,
        };
        chan.our_cfg.flush_timeout = Some(flush_to);

        let Some(link) = self.link_mut(lcb) else {
            return;
        };
        if flush_to < link.link_flush_tout {
            link.link_flush_tout = flush_to;
            if u32::from(flush_to) <= (u32::from(HCI_MAX_AUTOMATIC_FLUSH_TIMEOUT) * 5) / 8 {
                // Controller counts in 0.625 ms slots
                let timeout = ((u32::from(flush_to) * 8 + 3) / 5) as u16;
                let handle = link.handle;
                self.hci
                    .send_command(HciCommand::WriteAutomaticFlushTimeout { handle, timeout });
            }
        }
    }

    /// QoS in our positive response is only kept when the peer asked for it
    pub(crate) fn process_our_cfg_rsp(&mut self, ccb: CcbHandle, cfg: &mut ConfigInfo) {
        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };

        match (cfg.qos, chan.peer_cfg.qos.is_some()) {
            (Some(qos), true) => chan.peer_cfg.qos = Some(qos),
            _ => cfg.qos = None,
        }
    }

    /// Retries configuration in the mode the peer proposed in a negative
    /// response. Returns false when the channel has no acceptable mode left
    /// and the owner has to be told.
    pub(crate) fn renegotiate_fcr(&mut self, ccb: CcbHandle, rsp: &ConfigInfo) -> bool {
        let Some(proposed) = rsp.fcr else {
            return false;
        };
        let Some(chan) = self.channel_mut(ccb) else {
            return false;
        };

        if rsp.result != L2CAP_CFG_UNACCEPTABLE_PARAMS
            || chan.ertm_info.allowed_modes & proposed.mode.allowed_bit() == 0
            || chan.fcr_cfg_tries == 0
        {
            return false;
        }

        chan.fcr_cfg_tries -= 1;
        debug!(
            "L2CAP CID 0x{:04X}: renegotiating in {:?}",
            chan.local_cid, proposed.mode
        );

        let mut req = chan.our_cfg.clone();
        req.result = L2CAP_CFG_OK;
        req.flags = 0;
        req.fcr = Some(RetransmissionFlowControl {
            mode: proposed.mode,
            ..req.fcr.unwrap_or_default()
        });

        self.process_our_cfg_req(ccb, &mut req);
        self.send_peer_config_req(ccb, &req);
        self.timers
            .arm(TimerId::Channel(ccb), L2CAP_CHNL_CFG_TIMEOUT_MS);
        true
    }

    /// Makes sure the channel can run in one of its allowed modes given
    /// what the peer supports, falling back from the preferred mode.
    pub(crate) fn chk_chan_modes(&mut self, ccb: CcbHandle) -> bool {
        let Some(peer_ext_fea) = self
            .channel(ccb)
            .and_then(|c| self.link(c.lcb))
            .map(|l| l.peer_ext_fea)
        else {
            return false;
        };
        let Some(chan) = self.channel_mut(ccb) else {
            return false;
        };

        let info = &mut chan.ertm_info;
        if info.allowed_modes & info.preferred_mode.allowed_bit() != 0
            && mode_supported(info.preferred_mode, peer_ext_fea)
        {
            return true;
        }

        let fallback = [
            RetransmissionMode::EnhancedRetransmission,
            RetransmissionMode::Streaming,
            RetransmissionMode::Basic,
        ]
        .into_iter()
        .find(|&mode| {
            info.allowed_modes & mode.allowed_bit() != 0 && mode_supported(mode, peer_ext_fea)
        });

        match fallback {
            Some(mode) => {
                debug!(
                    "L2CAP CID 0x{:04X}: peer lacks {:?}, using {:?}",
                    chan.local_cid, info.preferred_mode, mode
                );
                info.preferred_mode = mode;
                true
            }
            None => {
                warn!(
                    "L2CAP CID 0x{:04X}: no channel mode in 0x{:02X} supported by peer",
                    chan.local_cid, info.allowed_modes
                );
                false
            }
        }
    }

    /// Picks an outgoing MPS that splits into whole ACL packets
    pub(crate) fn adjust_out_mps(&mut self, ccb: CcbHandle) {
        let Some(transport) = self
            .channel(ccb)
            .and_then(|c| self.link(c.lcb))
            .map(|l| l.transport)
        else {
            return;
        };
        let packet_size = self.acl_data_size(transport);
        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };

        let Some(peer_mps) = chan.peer_cfg.fcr.map(|fcr| fcr.max_pdu_size) else {
            return;
        };

        let overhead =
            (L2CAP_PKT_OVERHEAD + L2CAP_FCR_OVERHEAD + L2CAP_SDU_LEN_OVERHEAD + L2CAP_FCS_LEN) as u16;
        if packet_size <= overhead {
            error!(
                "L2CAP bad packet size {}, using MPS {}",
                packet_size, peer_mps
            );
            chan.tx_mps = peer_mps;
            return;
        }

        let packet_size = packet_size - overhead;
        chan.tx_mps = if peer_mps >= packet_size {
            peer_mps / packet_size * packet_size
        } else {
            peer_mps
        };
    }
}
