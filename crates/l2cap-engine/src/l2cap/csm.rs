//! Channel state machine
//!
//! Every event for a dynamic channel, whether it comes from the link, the
//! security manager, the peer or the owner, is fed through
//! [`L2capManager::csm_execute`]. The handler for the channel's current
//! state decides what goes to the peer, what the owner is told and which
//! timer runs next.

use std::sync::Arc;

use log::{debug, error, warn};

use super::ccb::{CcbFlags, CcbHandle, ConfigDone};
use super::constants::*;
use super::interfaces::{AccessRequest, ChannelOwner, SecurityStatus, TimerId};
use super::lcb::LcbHandle;
use super::manager::L2capManager;
use super::packet::build_basic_frame;
use super::types::*;
use crate::gap::{BdAddr, Transport};
use crate::hci::constants::{HCI_ERR_AUTH_FAILURE, HCI_ERR_PEER_USER};
use crate::hci::HciCommand;

/// Events driving a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsmEvent {
    /// Link came up
    LpConnectCfm,
    /// Link could not be established
    LpConnectCfmNeg { status: u8 },
    /// Link went down; `reason` is the HCI disconnect reason when known
    LpDisconnectInd { reason: Option<u8> },
    LpQosViolationInd,

    SecComp,
    SecCompNeg { status: SecurityStatus },
    /// Security manager has what it needs, ask again
    SecReSendCmd,

    L2capConnectReq,
    L2capConnectRsp { remote_cid: u16 },
    L2capConnectRspPnd { remote_cid: u16 },
    L2capConnectRspNeg { result: u16 },
    L2capConfigReq(ConfigInfo),
    L2capConfigRsp(ConfigInfo),
    L2capConfigRspNeg(ConfigInfo),
    L2capDisconnectReq,
    L2capDisconnectRsp,
    L2capData(Vec<u8>),
    L2capInfoRsp,
    L2capRecvFlowControlCredit(u16),

    L2caConnectReq,
    L2caConnectRsp { result: u16, status: u16 },
    L2caConnectRspNeg { result: u16, status: u16 },
    L2caConfigReq(ConfigInfo),
    L2caConfigRsp(ConfigInfo),
    L2caConfigRspNeg(ConfigInfo),
    L2caDisconnectReq,
    L2caDisconnectRsp,
    L2caDataWrite(Vec<u8>),
    L2caSendFlowControlCredit(u16),

    Timeout,
    AckTimeout,
}

impl CsmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LpConnectCfm => "LOWER_LAYER_CONNECT_CFM",
            Self::LpConnectCfmNeg { .. } => "LOWER_LAYER_CONNECT_CFM_NEG",
            Self::LpDisconnectInd { .. } => "LOWER_LAYER_DISCONNECT_IND",
            Self::LpQosViolationInd => "LOWER_LAYER_QOS_VIOLATION_IND",
            Self::SecComp => "SECURITY_COMPLETE",
            Self::SecCompNeg { .. } => "SECURITY_COMPLETE_NEG",
            Self::SecReSendCmd => "SECURITY_RE_SEND_CMD",
            Self::L2capConnectReq => "PEER_CONNECT_REQ",
            Self::L2capConnectRsp { .. } => "PEER_CONNECT_RSP",
            Self::L2capConnectRspPnd { .. } => "PEER_CONNECT_RSP_PND",
            Self::L2capConnectRspNeg { .. } => "PEER_CONNECT_RSP_NEG",
            Self::L2capConfigReq(_) => "PEER_CONFIG_REQ",
            Self::L2capConfigRsp(_) => "PEER_CONFIG_RSP",
            Self::L2capConfigRspNeg(_) => "PEER_CONFIG_RSP_NEG",
            Self::L2capDisconnectReq => "PEER_DISCONNECT_REQ",
            Self::L2capDisconnectRsp => "PEER_DISCONNECT_RSP",
            Self::L2capData(_) => "PEER_DATA",
            Self::L2capInfoRsp => "L2CAP_INFO_RSP",
            Self::L2capRecvFlowControlCredit(_) => "RECV_FLOW_CONTROL_CREDIT",
            Self::L2caConnectReq => "UPPER_LAYER_CONNECT_REQ",
            Self::L2caConnectRsp { .. } => "UPPER_LAYER_CONNECT_RSP",
            Self::L2caConnectRspNeg { .. } => "UPPER_LAYER_CONNECT_RSP_NEG",
            Self::L2caConfigReq(_) => "UPPER_LAYER_CONFIG_REQ",
            Self::L2caConfigRsp(_) => "UPPER_LAYER_CONFIG_RSP",
            Self::L2caConfigRspNeg(_) => "UPPER_LAYER_CONFIG_RSP_NEG",
            Self::L2caDisconnectReq => "UPPER_LAYER_DISCONNECT_REQ",
            Self::L2caDisconnectRsp => "UPPER_LAYER_DISCONNECT_RSP",
            Self::L2caDataWrite(_) => "UPPER_LAYER_DATA_WRITE",
            Self::L2caSendFlowControlCredit(_) => "SEND_FLOW_CONTROL_CREDIT",
            Self::Timeout => "TIMEOUT",
            Self::AckTimeout => "ACK_TIMEOUT",
        }
    }
}

/// What every state handler needs to know about the channel
struct ChannelCtx {
    ccb: CcbHandle,
    lcid: u16,
    lcb: LcbHandle,
    transport: Transport,
    bd_addr: BdAddr,
    owner: Arc<dyn ChannelOwner>,
}

impl L2capManager {
    /// Runs one event through the channel's state machine
    pub fn csm_execute(&mut self, ccb: CcbHandle, event: CsmEvent) {
        let Some(chan) = self.channel(ccb) else {
            warn!("L2CAP {} not in use, dropping {}", ccb, event.name());
            return;
        };
        let (state, lcid, lcb) = (chan.state, chan.local_cid, chan.lcb);

        let Some(owner) = chan.owner.clone() else {
            error!(
                "L2CAP - LCID: 0x{:04X} st: {} evt: {} without registration",
                lcid,
                state,
                event.name()
            );
            return;
        };
        let Some(link) = self.link(lcb) else {
            warn!("L2CAP CID 0x{:04X} lost its link, dropping {}", lcid, event.name());
            return;
        };

        debug!(
            "L2CAP - {}LCID: 0x{:04X} st: {} evt: {}",
            if link.transport.is_le() { "LE " } else { "" },
            lcid,
            state,
            event.name()
        );

        let ctx = ChannelCtx {
            ccb,
            lcid,
            lcb,
            transport: link.transport,
            bd_addr: link.bd_addr,
            owner,
        };

        match state {
            ChannelState::Closed => self.csm_closed(&ctx, event),
            ChannelState::OrigW4SecComp => self.csm_orig_w4_sec_comp(&ctx, event),
            ChannelState::TermW4SecComp => self.csm_term_w4_sec_comp(&ctx, event),
            ChannelState::W4L2capConnectRsp => self.csm_w4_l2cap_connect_rsp(&ctx, event),
            ChannelState::W4L2caConnectRsp => self.csm_w4_l2ca_connect_rsp(&ctx, event),
            ChannelState::Config => self.csm_config(&ctx, event),
            ChannelState::Open => self.csm_open(&ctx, event),
            ChannelState::W4L2capDisconnectRsp => self.csm_w4_l2cap_disconnect_rsp(&ctx, event),
            ChannelState::W4L2caDisconnectRsp => self.csm_w4_l2ca_disconnect_rsp(&ctx, event),
        }
    }

    /// Delivers the security manager's verdict on a channel
    pub fn sec_comp(&mut self, ccb: CcbHandle, status: SecurityStatus) {
        debug!("L2CAP security verdict {:?} for {}", status, ccb);
        match status {
            s if s.is_success() => self.csm_execute(ccb, CsmEvent::SecComp),
            // Encryption change has not arrived yet
            SecurityStatus::DelayCheck => {
                if self.channel(ccb).is_some() {
                    self.timers
                        .arm(TimerId::Channel(ccb), L2CAP_DELAY_CHECK_SM4_TIMEOUT_MS);
                }
            }
            s if s.is_pending() => {}
            s => self.csm_execute(ccb, CsmEvent::SecCompNeg { status: s }),
        }
    }

    fn set_chnl_state(&mut self, ccb: CcbHandle, state: ChannelState) {
        if let Some(chan) = self.channel_mut(ccb) {
            chan.state = state;
        }
    }

    fn arm_chnl_timer(&mut self, ccb: CcbHandle, timeout_ms: u64) {
        self.timers.arm(TimerId::Channel(ccb), timeout_ms);
    }

    fn cancel_chnl_timer(&mut self, ccb: CcbHandle) {
        self.timers.cancel(TimerId::Channel(ccb));
    }

    /// Asks the security manager about the channel and acts on an
    /// immediate verdict. Returns the raw status.
    fn request_security(&mut self, ctx: &ChannelCtx, is_originator: bool) -> SecurityStatus {
        let Some(chan) = self.channel(ctx.ccb) else {
            return SecurityStatus::Failed(0);
        };
        let handle = self.link(ctx.lcb).map_or(0, |l| l.handle);
        let request = AccessRequest {
            bd_addr: ctx.bd_addr,
            psm: chan.psm,
            handle,
            transport: ctx.transport,
            is_originator,
            security_level: chan.security_level,
            ccb: ctx.ccb,
        };

        let status = self.security.access_req(&request);
        debug!("L2CAP CID 0x{:04X}: security request -> {:?}", ctx.lcid, status);
        status
    }

    /// Security check for a channel we originate. On classic links the
    /// channel only waits in OrigW4SecComp while a verdict is outstanding;
    /// an immediate verdict is handled from Closed.
    fn start_orig_security(&mut self, ctx: &ChannelCtx) {
        if ctx.transport.is_le() {
            self.set_chnl_state(ctx.ccb, ChannelState::OrigW4SecComp);
            let status = self.request_security(ctx, true);
            self.sec_comp(ctx.ccb, status);
            return;
        }

        let status = self.request_security(ctx, true);
        if status.is_pending() {
            self.set_chnl_state(ctx.ccb, ChannelState::OrigW4SecComp);
        }
        self.sec_comp(ctx.ccb, status);
    }

    fn release_then(&mut self, ctx: &ChannelCtx, notify: impl FnOnce(&dyn ChannelOwner, u16)) {
        self.release_ccb(ctx.ccb);
        notify(ctx.owner.as_ref(), ctx.lcid);
    }

    /// Sends our connect request once the peer's features are known
    fn start_peer_connect(&mut self, ctx: &ChannelCtx) {
        if !self.chk_chan_modes(ctx.ccb) {
            self.release_then(ctx, |owner, lcid| owner.connect_cfm(lcid, L2CAP_CONN_NO_LINK));
            return;
        }
        self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CONNECT_TIMEOUT_MS);
        self.send_peer_connect_req(ctx.ccb);
    }

    fn indicate_connect(&mut self, ctx: &ChannelCtx) {
        let Some(chan) = self.channel(ctx.ccb) else {
            return;
        };
        let (psm, remote_id) = (chan.psm, chan.remote_id);
        self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CONNECT_TIMEOUT_MS);
        ctx.owner.connect_ind(ctx.bd_addr, ctx.lcid, psm, remote_id);
    }

    fn w4_info_rsp(&self, lcb: LcbHandle) -> bool {
        self.link(lcb).map_or(false, |l| l.w4_info_rsp)
    }

    /// Connect response on the right signaling flavour for the link
    fn answer_connect(&mut self, ctx: &ChannelCtx, result: u16, status: u16) {
        if ctx.transport.is_le() {
            self.send_le_credit_based_conn_rsp(ctx.ccb, result);
        } else {
            self.send_peer_connect_rsp(ctx.ccb, result, status);
        }
    }

    fn begin_local_disconnect(&mut self, ctx: &ChannelCtx) {
        self.send_peer_disc_req(ctx.ccb);
        self.set_chnl_state(ctx.ccb, ChannelState::W4L2capDisconnectRsp);
        self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_DISCONNECT_TIMEOUT_MS);
    }

    fn send_disc_rsp_for(&mut self, ctx: &ChannelCtx) {
        let Some(chan) = self.channel(ctx.ccb) else {
            return;
        };
        let (remote_id, remote_cid) = (chan.remote_id, chan.remote_cid);
        self.send_peer_disc_rsp(ctx.lcb, remote_id, ctx.lcid, remote_cid);
    }

    fn csm_closed(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::LpConnectCfm => self.start_orig_security(ctx),

            CsmEvent::LpConnectCfmNeg { status } => {
                self.release_then(ctx, |owner, lcid| owner.connect_cfm(lcid, u16::from(status)));
            }

            CsmEvent::L2caConnectReq => {
                if !ctx.transport.is_le() {
                    self.acl.set_power_mode_active(ctx.bd_addr);
                }
                self.start_orig_security(ctx);
            }

            CsmEvent::SecComp => {
                self.set_chnl_state(ctx.ccb, ChannelState::W4L2capConnectRsp);
                if !self.w4_info_rsp(ctx.lcb) {
                    self.start_peer_connect(ctx);
                }
            }

            CsmEvent::SecCompNeg { .. } => {
                self.release_then(ctx, |owner, lcid| {
                    owner.connect_cfm(lcid, L2CAP_CONN_SECURITY_BLOCK)
                });
            }

            CsmEvent::L2capConnectReq => {
                // Security and the link timer must not race
                self.timers.cancel(TimerId::Link(ctx.lcb));
                if !ctx.transport.is_le() {
                    self.acl.set_power_mode_active(ctx.bd_addr);
                }

                self.set_chnl_state(ctx.ccb, ChannelState::TermW4SecComp);
                let status = self.request_security(ctx, false);
                if status == SecurityStatus::CmdStarted && !ctx.transport.is_le() {
                    // Tell the peer to run a longer timer
                    self.send_peer_connect_rsp(ctx.ccb, L2CAP_CONN_PENDING, L2CAP_CONN_STATUS_AUTHENTICATION_PENDING);
                }
                self.sec_comp(ctx.ccb, status);
            }

            CsmEvent::Timeout => {
                self.release_then(ctx, |owner, lcid| owner.connect_cfm(lcid, L2CAP_CONN_TIMEOUT));
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            CsmEvent::L2caDisconnectReq => self.release_ccb(ctx.ccb),

            _ => {}
        }
    }

    fn csm_orig_w4_sec_comp(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::SecReSendCmd | CsmEvent::LpConnectCfm => {
                let status = self.request_security(ctx, true);
                self.sec_comp(ctx.ccb, status);
            }

            CsmEvent::SecComp => {
                self.set_chnl_state(ctx.ccb, ChannelState::W4L2capConnectRsp);
                if ctx.transport.is_le() {
                    self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CONNECT_TIMEOUT_MS);
                    self.send_le_credit_based_conn_req(ctx.ccb);
                } else if !self.w4_info_rsp(ctx.lcb) {
                    self.start_peer_connect(ctx);
                }
            }

            CsmEvent::SecCompNeg { status } => {
                debug!("L2CAP CID 0x{:04X}: security failed {:?}", ctx.lcid, status);
                // Last channel: drop the link right away
                if let Some(link) = self.link_mut(ctx.lcb) {
                    if link.ccbs.len() == 1 && link.ccbs[0] == ctx.ccb {
                        link.idle_timeout = 0;
                    }
                }
                self.release_then(ctx, |owner, lcid| {
                    owner.connect_cfm(lcid, u16::from(HCI_ERR_AUTH_FAILURE))
                });
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            CsmEvent::L2caDisconnectReq => {
                self.security.abort_access_req(ctx.bd_addr);
                self.release_ccb(ctx.ccb);
            }

            _ => {}
        }
    }

    fn csm_term_w4_sec_comp(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.security.abort_access_req(ctx.bd_addr);
                self.release_ccb(ctx.ccb);
            }

            CsmEvent::SecComp => {
                self.set_chnl_state(ctx.ccb, ChannelState::W4L2caConnectRsp);
                if !self.w4_info_rsp(ctx.lcb) {
                    self.indicate_connect(ctx);
                } else {
                    // Owner hears about it once the info response is in
                    self.send_peer_connect_rsp(ctx.ccb, L2CAP_CONN_PENDING, L2CAP_CONN_STATUS_NONE);
                }
            }

            CsmEvent::SecCompNeg { status } => {
                if status == SecurityStatus::DelayCheck {
                    self.arm_chnl_timer(ctx.ccb, L2CAP_DELAY_CHECK_SM4_TIMEOUT_MS);
                    return;
                }

                if ctx.transport.is_le() {
                    // Every LE refusal reads as missing authentication
                    let remote_id = self.channel(ctx.ccb).map_or(0, |c| c.remote_id);
                    self.reject_ble_connection(
                        ctx.lcb,
                        remote_id,
                        L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION,
                    );
                } else {
                    self.send_peer_connect_rsp(ctx.ccb, L2CAP_CONN_SECURITY_BLOCK, L2CAP_CONN_STATUS_NONE);
                }
                self.release_ccb(ctx.ccb);
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            CsmEvent::L2caDisconnectReq => self.release_ccb(ctx.ccb),

            CsmEvent::L2capDisconnectReq => {
                self.send_disc_rsp_for(ctx);
                self.security.abort_access_req(ctx.bd_addr);
                self.release_ccb(ctx.ccb);
            }

            CsmEvent::Timeout => {
                // Encryption never came up
                let handle = self.link(ctx.lcb).map_or(0, |l| l.handle);
                self.hci.send_command(HciCommand::Disconnect {
                    handle,
                    reason: HCI_ERR_AUTH_FAILURE,
                });
            }

            CsmEvent::SecReSendCmd => {
                let status = self.request_security(ctx, false);
                self.sec_comp(ctx.ccb, status);
            }

            _ => {}
        }
    }

    fn csm_w4_l2cap_connect_rsp(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { reason } => {
                self.set_chnl_state(ctx.ccb, ChannelState::Closed);
                let no_retry = self
                    .channel(ctx.ccb)
                    .map_or(true, |c| c.flags.contains(CcbFlags::NO_RETRY));

                // Peer dropped a fresh link normally: keep the channel and
                // retry once on a new link
                if no_retry || reason != Some(HCI_ERR_PEER_USER) {
                    self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
                } else if let Some(chan) = self.channel_mut(ctx.ccb) {
                    chan.flags |= CcbFlags::NO_RETRY;
                }
            }

            CsmEvent::L2capConnectRsp { remote_cid } => {
                if let Some(chan) = self.channel_mut(ctx.ccb) {
                    chan.remote_cid = remote_cid;
                }
                if ctx.transport.is_le() {
                    self.cancel_chnl_timer(ctx.ccb);
                    self.set_chnl_state(ctx.ccb, ChannelState::Open);
                } else {
                    self.set_chnl_state(ctx.ccb, ChannelState::Config);
                    self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CFG_TIMEOUT_MS);
                }
                ctx.owner.connect_cfm(ctx.lcid, L2CAP_CONN_OK);
            }

            CsmEvent::L2capConnectRspPnd { remote_cid } => {
                if let Some(chan) = self.channel_mut(ctx.ccb) {
                    chan.remote_cid = remote_cid;
                }
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CONNECT_EXT_TIMEOUT_MS);
                ctx.owner.connect_pnd(ctx.lcid);
            }

            CsmEvent::L2capConnectRspNeg { result } => {
                warn!(
                    "L2CAP connection rejected, lcid=0x{:04X}, reason=0x{:04X}",
                    ctx.lcid, result
                );
                self.release_then(ctx, |owner, lcid| owner.connect_cfm(lcid, result));
            }

            CsmEvent::Timeout => {
                warn!("L2CAP connection timeout, lcid=0x{:04X}", ctx.lcid);
                self.release_then(ctx, |owner, lcid| owner.connect_cfm(lcid, L2CAP_CONN_TIMEOUT));
            }

            CsmEvent::L2caDisconnectReq => {
                // A pending response told us the peer CID
                if self.channel(ctx.ccb).map_or(0, |c| c.remote_cid) != 0 {
                    self.begin_local_disconnect(ctx);
                } else {
                    self.release_then(ctx, |owner, lcid| {
                        owner.disconnect_cfm(lcid, L2CAP_CONN_NO_LINK)
                    });
                }
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            CsmEvent::L2capInfoRsp => self.start_peer_connect(ctx),

            _ => {}
        }
    }

    fn csm_w4_l2ca_connect_rsp(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::L2caConnectRsp { result, status } => {
                if ctx.transport.is_le() {
                    if result == L2CAP_CONN_OK {
                        self.send_le_credit_based_conn_rsp(ctx.ccb, L2CAP_LE_RESULT_CONN_OK);
                        self.set_chnl_state(ctx.ccb, ChannelState::Open);
                        self.cancel_chnl_timer(ctx.ccb);
                    } else {
                        self.send_le_credit_based_conn_rsp(ctx.ccb, result);
                        self.release_ccb(ctx.ccb);
                    }
                } else if result == L2CAP_CONN_OK {
                    self.send_peer_connect_rsp(ctx.ccb, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE);
                    self.set_chnl_state(ctx.ccb, ChannelState::Config);
                    self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CFG_TIMEOUT_MS);
                } else {
                    // Pending: stay here on the extended timer
                    self.send_peer_connect_rsp(ctx.ccb, result, status);
                    self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CONNECT_EXT_TIMEOUT_MS);
                }
            }

            CsmEvent::L2caConnectRspNeg { result, status } => {
                self.answer_connect(ctx, result, status);
                self.release_ccb(ctx.ccb);
            }

            CsmEvent::Timeout => {
                self.answer_connect(ctx, L2CAP_CONN_NO_PSM, L2CAP_CONN_STATUS_NONE);
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            CsmEvent::L2caDisconnectReq => self.begin_local_disconnect(ctx),

            CsmEvent::L2capInfoRsp => self.indicate_connect(ctx),

            _ => {}
        }
    }

    /// Both directions are configured. Modes must agree or the channel is
    /// torn down. Returns false when the channel is gone.
    fn complete_config(&mut self, ctx: &ChannelCtx) -> bool {
        let Some(chan) = self.channel(ctx.ccb) else {
            return false;
        };
        let (ours, peers) = (chan.our_cfg.fcr_mode(), chan.peer_cfg.fcr_mode());

        if ours != peers {
            warn!(
                "L2CAP CID 0x{:04X}: incompatible modes {:?}/{:?}, disconnecting",
                ctx.lcid, ours, peers
            );
            self.send_peer_disc_req(ctx.ccb);
            self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            return false;
        }

        let Some(chan) = self.channel_mut(ctx.ccb) else {
            return false;
        };
        chan.config_done |= ConfigDone::RECONFIG_FLAG;
        chan.state = ChannelState::Open;
        let peer_cfg = chan.peer_cfg.clone();

        self.adjust_chnl_allocation();
        self.cancel_chnl_timer(ctx.ccb);
        if peers != RetransmissionMode::Basic {
            self.fcr.on_channel_open(ctx.lcid, &peer_cfg);
        }
        debug!("L2CAP CID 0x{:04X} open in {:?}", ctx.lcid, peers);
        true
    }

    fn flush_if_open(&mut self, ctx: &ChannelCtx) {
        let pending = self
            .channel(ctx.ccb)
            .map_or(false, |c| c.state == ChannelState::Open && !c.xmit_hold_q.is_empty());
        if pending {
            self.check_send_pkts(Some(ctx.lcb), None, None);
        }
    }

    fn csm_config(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::L2capConfigReq(mut cfg) => match self.process_peer_cfg_req(ctx.ccb, &mut cfg) {
                PeerCfgVerdict::Ok => ctx.owner.config_ind(ctx.lcid, &cfg),
                PeerCfgVerdict::Disconnect => self.disconnect_chnl(ctx.ccb),
                // Let the peer try again with our suggestions
                PeerCfgVerdict::Unacceptable => self.send_peer_config_rsp(ctx.ccb, &cfg),
            },

            CsmEvent::L2capConfigRsp(cfg) => {
                self.process_peer_cfg_rsp(ctx.ccb, &cfg);

                if cfg.result != L2CAP_CFG_PENDING {
                    let Some(chan) = self.channel_mut(ctx.ccb) else {
                        return;
                    };
                    chan.config_done |= ConfigDone::OB_CFG_DONE;

                    if chan.config_done.contains(ConfigDone::IB_CFG_DONE) {
                        if !self.complete_config(ctx) {
                            return;
                        }
                        self.flush_if_open(ctx);
                    }
                }

                ctx.owner.config_cfm(ctx.lcid, &cfg);
            }

            CsmEvent::L2capConfigRspNeg(cfg) => {
                self.cancel_chnl_timer(ctx.ccb);
                if !self.renegotiate_fcr(ctx.ccb, &cfg) {
                    ctx.owner.config_cfm(ctx.lcid, &cfg);
                }
            }

            CsmEvent::L2capDisconnectReq => {
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_DISCONNECT_TIMEOUT_MS);
                self.set_chnl_state(ctx.ccb, ChannelState::W4L2caDisconnectRsp);
                ctx.owner.disconnect_ind(ctx.lcid, true);
            }

            CsmEvent::L2caConfigReq(mut cfg) => {
                self.process_our_cfg_req(ctx.ccb, &mut cfg);
                self.send_peer_config_req(ctx.ccb, &cfg);
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CFG_TIMEOUT_MS);
            }

            CsmEvent::L2caConfigRsp(mut cfg) => {
                self.process_our_cfg_rsp(ctx.ccb, &mut cfg);

                if cfg.is_continuation() || cfg.result == L2CAP_CFG_PENDING {
                    self.send_peer_config_rsp(ctx.ccb, &cfg);
                    return;
                }

                let Some(chan) = self.channel_mut(ctx.ccb) else {
                    return;
                };
                // A later reconfiguration starts from scratch
                chan.peer_cfg.mtu = None;
                chan.peer_cfg.flush_timeout = None;
                chan.peer_cfg.qos = None;
                chan.config_done |= ConfigDone::IB_CFG_DONE;

                if chan.config_done.contains(ConfigDone::OB_CFG_DONE) && !self.complete_config(ctx) {
                    return;
                }

                self.send_peer_config_rsp(ctx.ccb, &cfg);
                self.flush_if_open(ctx);
            }

            CsmEvent::L2caConfigRspNeg(cfg) => {
                self.send_peer_config_rsp(ctx.ccb, &cfg);
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CFG_TIMEOUT_MS);
            }

            CsmEvent::L2caDisconnectReq => self.begin_local_disconnect(ctx),

            CsmEvent::L2capData(data) => ctx.owner.data_ind(ctx.lcid, data),

            CsmEvent::L2caDataWrite(data) => {
                let ob_done = self
                    .channel(ctx.ccb)
                    .map_or(false, |c| c.config_done.contains(ConfigDone::OB_CFG_DONE));
                if ob_done {
                    self.enqueue_peer_data(ctx.ccb, data);
                }
            }

            CsmEvent::Timeout => {
                self.send_peer_disc_req(ctx.ccb);
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            _ => {}
        }
    }

    fn csm_open(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::LpQosViolationInd => ctx.owner.qos_violation_ind(ctx.bd_addr),

            CsmEvent::L2capConfigReq(mut cfg) => {
                let Some(chan) = self.channel_mut(ctx.ccb) else {
                    return;
                };
                let (saved_state, saved_done) = (chan.state, chan.config_done);
                chan.state = ChannelState::Config;
                chan.config_done.remove(ConfigDone::IB_CFG_DONE);
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CFG_TIMEOUT_MS);

                match self.process_peer_cfg_req(ctx.ccb, &mut cfg) {
                    PeerCfgVerdict::Ok => ctx.owner.config_ind(ctx.lcid, &cfg),
                    PeerCfgVerdict::Unacceptable => {
                        // Stay open on the old configuration
                        self.cancel_chnl_timer(ctx.ccb);
                        if let Some(chan) = self.channel_mut(ctx.ccb) {
                            chan.state = saved_state;
                            chan.config_done = saved_done;
                        }
                        self.send_peer_config_rsp(ctx.ccb, &cfg);
                    }
                    PeerCfgVerdict::Disconnect => self.disconnect_chnl(ctx.ccb),
                }
            }

            CsmEvent::L2capDisconnectReq => {
                if !ctx.transport.is_le() {
                    self.acl.set_power_mode_active(ctx.bd_addr);
                }
                self.set_chnl_state(ctx.ccb, ChannelState::W4L2caDisconnectRsp);
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_DISCONNECT_TIMEOUT_MS);
                ctx.owner.disconnect_ind(ctx.lcid, true);
            }

            CsmEvent::L2capData(data) => ctx.owner.data_ind(ctx.lcid, data),

            CsmEvent::L2caDisconnectReq => {
                if !ctx.transport.is_le() {
                    self.acl.set_power_mode_active(ctx.bd_addr);
                }
                self.begin_local_disconnect(ctx);
            }

            CsmEvent::L2caDataWrite(data) => {
                self.enqueue_peer_data(ctx.ccb, data);
                self.check_send_pkts(Some(ctx.lcb), None, None);
            }

            CsmEvent::L2caConfigReq(mut cfg) => {
                if let Some(chan) = self.channel_mut(ctx.ccb) {
                    chan.state = ChannelState::Config;
                    chan.config_done
                        .remove(ConfigDone::IB_CFG_DONE | ConfigDone::OB_CFG_DONE);
                }
                self.process_our_cfg_req(ctx.ccb, &mut cfg);
                self.send_peer_config_req(ctx.ccb, &cfg);
                self.arm_chnl_timer(ctx.ccb, L2CAP_CHNL_CFG_TIMEOUT_MS);
            }

            CsmEvent::Timeout => {
                let ertm = self.channel(ctx.ccb).map_or(false, |c| {
                    c.peer_cfg.fcr_mode() == RetransmissionMode::EnhancedRetransmission
                });
                if ertm {
                    self.fcr.process_timeout(ctx.lcid);
                }
            }

            CsmEvent::AckTimeout => self.fcr.process_ack_timeout(ctx.lcid),

            CsmEvent::L2caSendFlowControlCredit(credits) => {
                debug!("L2CAP CID 0x{:04X}: sending {} credits", ctx.lcid, credits);
                if let Some(chan) = self.channel_mut(ctx.ccb) {
                    chan.local_conn_cfg.credits = chan.local_conn_cfg.credits.saturating_add(credits);
                }
                self.send_le_flow_control_credit(ctx.ccb, credits);
            }

            CsmEvent::L2capRecvFlowControlCredit(credits) => {
                let Some(chan) = self.channel_mut(ctx.ccb) else {
                    return;
                };
                let total = u32::from(chan.peer_conn_cfg.credits) + u32::from(credits);
                if total > u32::from(L2CAP_LE_CREDIT_MAX) {
                    error!(
                        "L2CAP CID 0x{:04X}: credit overflow ({} + {}), disconnecting",
                        ctx.lcid, chan.peer_conn_cfg.credits, credits
                    );
                    self.begin_local_disconnect(ctx);
                    return;
                }

                chan.peer_conn_cfg.credits = total as u16;
                debug!("L2CAP CID 0x{:04X}: {} credits received, {} now", ctx.lcid, credits, total);
                if ctx.transport.is_le() {
                    ctx.owner.credits_received(ctx.lcid, credits, total as u16);
                }
                self.check_send_pkts(Some(ctx.lcb), None, None);
            }

            _ => {}
        }
    }

    fn csm_w4_l2cap_disconnect_rsp(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::L2capDisconnectRsp => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_cfm(lcid, L2CAP_DISC_OK));
            }

            CsmEvent::L2capDisconnectReq => {
                self.send_disc_rsp_for(ctx);
                self.release_then(ctx, |owner, lcid| owner.disconnect_cfm(lcid, L2CAP_DISC_OK));
            }

            CsmEvent::LpDisconnectInd { .. } | CsmEvent::Timeout => {
                self.release_then(ctx, |owner, lcid| {
                    owner.disconnect_cfm(lcid, L2CAP_DISC_TIMEOUT)
                });
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            _ => {}
        }
    }

    fn csm_w4_l2ca_disconnect_rsp(&mut self, ctx: &ChannelCtx, event: CsmEvent) {
        match event {
            CsmEvent::LpDisconnectInd { .. } => {
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::Timeout => {
                self.send_disc_rsp_for(ctx);
                self.release_then(ctx, |owner, lcid| owner.disconnect_ind(lcid, false));
            }

            CsmEvent::L2caDisconnectReq | CsmEvent::L2caDisconnectRsp => {
                self.send_disc_rsp_for(ctx);
                self.release_ccb(ctx.ccb);
            }

            CsmEvent::L2capData(_) | CsmEvent::L2caDataWrite(_) => {}

            _ => {}
        }
    }

    /// Queues an owner SDU on the channel. Basic mode classic channels get
    /// their L2CAP header here; other modes are framed on the way out.
    pub(crate) fn enqueue_peer_data(&mut self, ccb: CcbHandle, data: Vec<u8>) {
        let Some(chan) = self.channel(ccb) else {
            return;
        };
        let lcb = chan.lcb;
        let Some(transport) = self.link(lcb).map(|l| l.transport) else {
            return;
        };

        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };
        let sdu = if !transport.is_le() && chan.is_basic_mode() {
            build_basic_frame(chan.remote_cid, &data)
        } else {
            data
        };
        chan.xmit_hold_q.push_back(sdu);

        self.check_channel_congestion(ccb);

        if self.link(lcb).map_or(false, |l| l.link_xmit_quota == 0) {
            self.pool_mut(transport).check_round_robin = true;
        }
    }
}
