//! Outbound signaling
//!
//! Builds the commands we send on the signaling channel of a link and hands
//! them to the link transmit queue. LE links use the LE signaling CID and a
//! non-flushable start fragment.

use log::{debug, trace, warn};

use super::ccb::{CcbFlags, CcbHandle};
use super::constants::*;
use super::lcb::LcbHandle;
use super::manager::L2capManager;
use super::packet::build_basic_frame;
use super::signaling::SignalingMessage;
use super::types::*;
use crate::hci::constants::{ACL_PB_START_FLUSHABLE, ACL_PB_START_NON_FLUSHABLE};
use crate::hci::{AclHeader, AclPacket};

impl L2capManager {
    /// Frames a signaling command and queues it on the link
    pub(crate) fn send_signal(&mut self, lcb: LcbHandle, message: SignalingMessage) {
        let Some(link) = self.link(lcb) else {
            warn!("L2CAP dropping {:?}, link gone", message);
            return;
        };

        let (cid, pb) = if link.transport.is_le() {
            (L2CAP_LE_SIGNALING_CID, ACL_PB_START_NON_FLUSHABLE)
        } else {
            (L2CAP_SIGNALING_CID, ACL_PB_START_FLUSHABLE)
        };

        trace!("L2CAP -> {} {:?}", link.bd_addr, message);
        let payload = build_basic_frame(cid, &message.serialize());
        let length = payload.len().min(self.acl_data_size(link.transport) as usize) as u16;
        let packet = AclPacket {
            header: AclHeader::new(link.handle, pb, length),
            payload,
        };

        self.check_send_pkts(Some(lcb), None, Some(packet));
    }

    /// Allocates a fresh identifier on the channel's link
    fn next_local_id(&mut self, ccb: CcbHandle) -> Option<(LcbHandle, u8)> {
        let lcb = self.channel(ccb)?.lcb;
        let id = self.link_mut(lcb)?.next_signal_id();
        let chan = self.channel_mut(ccb)?;
        chan.local_id = id;
        Some((lcb, id))
    }

    pub(crate) fn send_peer_connect_req(&mut self, ccb: CcbHandle) {
        let Some((lcb, identifier)) = self.next_local_id(ccb) else {
            return;
        };
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let message = SignalingMessage::ConnectionRequest {
            identifier,
            psm: chan.psm,
            source_cid: chan.local_cid,
        };
        self.send_signal(lcb, message);
    }

    /// Answers the peer's connect request. A pending result goes out at
    /// most once per channel.
    pub(crate) fn send_peer_connect_rsp(&mut self, ccb: CcbHandle, result: u16, status: u16) {
        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };

        if result == L2CAP_CONN_PENDING {
            if chan.flags.contains(CcbFlags::SENT_PENDING) {
                return;
            }
            chan.flags |= CcbFlags::SENT_PENDING;
        }

        let lcb = chan.lcb;
        let message = SignalingMessage::ConnectionResponse {
            identifier: chan.remote_id,
            destination_cid: chan.local_cid,
            source_cid: chan.remote_cid,
            result,
            status,
        };
        self.send_signal(lcb, message);
    }

    /// Rejects a connect request for which no channel exists
    pub(crate) fn reject_connection(&mut self, lcb: LcbHandle, remote_cid: u16, id: u8, result: u16) {
        let message = SignalingMessage::ConnectionResponse {
            identifier: id,
            destination_cid: 0,
            source_cid: remote_cid,
            result,
            status: L2CAP_CONN_STATUS_NONE,
        };
        self.send_signal(lcb, message);
    }

    pub(crate) fn send_peer_config_req(&mut self, ccb: CcbHandle, config: &ConfigInfo) {
        let Some((lcb, identifier)) = self.next_local_id(ccb) else {
            return;
        };
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let message = SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: chan.remote_cid,
            config: config.clone(),
            unknown_options: Vec::new(),
        };
        self.send_signal(lcb, message);
    }

    pub(crate) fn send_peer_config_rsp(&mut self, ccb: CcbHandle, config: &ConfigInfo) {
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let lcb = chan.lcb;
        let message = SignalingMessage::ConfigureResponse {
            identifier: chan.remote_id,
            source_cid: chan.remote_cid,
            config: config.clone(),
            unknown_options: Vec::new(),
        };
        self.send_signal(lcb, message);
    }

    /// Echoes back the options we did not understand
    pub(crate) fn send_peer_config_rej(&mut self, ccb: CcbHandle, unknown_options: Vec<u8>) {
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let lcb = chan.lcb;
        let message = SignalingMessage::ConfigureResponse {
            identifier: chan.remote_id,
            source_cid: chan.remote_cid,
            config: ConfigInfo {
                result: L2CAP_CFG_UNKNOWN_OPTIONS,
                ..Default::default()
            },
            unknown_options,
        };
        self.send_signal(lcb, message);
    }

    /// Asks the peer to close the channel. Basic mode data still held for
    /// the channel is pushed to the link first so it leaves before the
    /// request.
    pub(crate) fn send_peer_disc_req(&mut self, ccb: CcbHandle) {
        let Some((lcb, identifier)) = self.next_local_id(ccb) else {
            return;
        };
        let Some(transport) = self.link(lcb).map(|l| l.transport) else {
            return;
        };

        let flush = self
            .channel(ccb)
            .map_or(false, |c| !transport.is_le() && c.is_basic_mode());
        if flush {
            let pending: Vec<Vec<u8>> = self
                .channel_mut(ccb)
                .map(|c| c.xmit_hold_q.drain(..).collect())
                .unwrap_or_default();
            let handle = self.link(lcb).map_or(0, |l| l.handle);
            let acl_data_size = self.acl_data_size(transport);
            for payload in pending {
                let length = payload.len().min(acl_data_size as usize) as u16;
                let packet = AclPacket {
                    header: AclHeader::new(handle, ACL_PB_START_FLUSHABLE, length),
                    payload,
                };
                self.check_send_pkts(Some(lcb), Some(ccb), Some(packet));
            }
        }

        let Some(chan) = self.channel(ccb) else {
            return;
        };
        let message = SignalingMessage::DisconnectionRequest {
            identifier,
            destination_cid: chan.remote_cid,
            source_cid: chan.local_cid,
        };
        self.send_signal(lcb, message);
    }

    pub(crate) fn send_peer_disc_rsp(&mut self, lcb: LcbHandle, id: u8, local_cid: u16, remote_cid: u16) {
        let message = SignalingMessage::DisconnectionResponse {
            identifier: id,
            destination_cid: local_cid,
            source_cid: remote_cid,
        };
        self.send_signal(lcb, message);
    }

    pub(crate) fn send_cmd_reject(&mut self, lcb: LcbHandle, reason: u16, id: u8, data: Vec<u8>) {
        let message = SignalingMessage::CommandReject {
            identifier: id,
            reason,
            data,
        };
        self.send_signal(lcb, message);
    }

    /// Rejects a command that names a channel we do not have
    pub(crate) fn send_cmd_reject_invalid_cid(&mut self, lcb: LcbHandle, id: u8, local_cid: u16, remote_cid: u16) {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&local_cid.to_le_bytes());
        data.extend_from_slice(&remote_cid.to_le_bytes());
        self.send_cmd_reject(lcb, L2CAP_CMD_REJ_INVALID_CID, id, data);
    }

    pub(crate) fn send_peer_echo_rsp(&mut self, lcb: LcbHandle, id: u8, data: Vec<u8>) {
        self.send_signal(lcb, SignalingMessage::EchoResponse { identifier: id, data });
    }

    /// Asks for the peer's extended features. Channel setup on the link
    /// waits until the answer arrives or the timer gives up on it.
    pub(crate) fn send_peer_info_req(&mut self, lcb: LcbHandle, info_type: u16) {
        let Some(link) = self.link_mut(lcb) else {
            return;
        };
        if link.transport.is_le() {
            return;
        }

        link.w4_info_rsp = true;
        let identifier = link.next_signal_id();
        debug!("L2CAP info req type {} to {}", info_type, link.bd_addr);

        self.timers.arm(
            super::interfaces::TimerId::InfoRsp(lcb),
            L2CAP_WAIT_INFO_RSP_TIMEOUT_MS,
        );
        self.send_signal(lcb, SignalingMessage::InformationRequest { identifier, info_type });
    }

    pub(crate) fn send_peer_info_rsp(&mut self, lcb: LcbHandle, id: u8, info_type: u16) {
        let (result, data) = match info_type {
            L2CAP_EXTENDED_FEATURES_INFO_TYPE => (
                L2CAP_INFO_RESP_RESULT_SUCCESS,
                L2CAP_EXTFEA_SUPPORTED_MASK.to_le_bytes().to_vec(),
            ),
            L2CAP_FIXED_CHANNELS_INFO_TYPE => (
                L2CAP_INFO_RESP_RESULT_SUCCESS,
                L2CAP_FIXED_CHNL_MASK.to_le_bytes().to_vec(),
            ),
            L2CAP_CONNLESS_MTU_INFO_TYPE => (
                L2CAP_INFO_RESP_RESULT_SUCCESS,
                L2CAP_MTU_SIZE.to_le_bytes().to_vec(),
            ),
            _ => (L2CAP_INFO_RESP_RESULT_NOT_SUPPORTED, Vec::new()),
        };

        let message = SignalingMessage::InformationResponse {
            identifier: id,
            info_type,
            result,
            data,
        };
        self.send_signal(lcb, message);
    }

    /// Opens an LE credit based channel to the peer
    pub(crate) fn send_le_credit_based_conn_req(&mut self, ccb: CcbHandle) {
        let Some((lcb, identifier)) = self.next_local_id(ccb) else {
            return;
        };
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let message = SignalingMessage::LeCreditBasedConnectionRequest {
            identifier,
            le_psm: chan.psm,
            source_cid: chan.local_cid,
            mtu: chan.local_conn_cfg.mtu,
            mps: chan.local_conn_cfg.mps,
            initial_credits: chan.local_conn_cfg.credits,
        };
        self.send_signal(lcb, message);
    }

    pub(crate) fn send_le_credit_based_conn_rsp(&mut self, ccb: CcbHandle, result: u16) {
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let lcb = chan.lcb;
        let message = SignalingMessage::LeCreditBasedConnectionResponse {
            identifier: chan.remote_id,
            destination_cid: chan.local_cid,
            mtu: chan.local_conn_cfg.mtu,
            mps: chan.local_conn_cfg.mps,
            initial_credits: chan.local_conn_cfg.credits,
            result,
        };
        self.send_signal(lcb, message);
    }

    /// Refuses an LE connect request without a channel
    pub(crate) fn reject_ble_connection(&mut self, lcb: LcbHandle, id: u8, result: u16) {
        let message = SignalingMessage::LeCreditBasedConnectionResponse {
            identifier: id,
            destination_cid: 0,
            mtu: 0,
            mps: 0,
            initial_credits: 0,
            result,
        };
        self.send_signal(lcb, message);
    }

    pub(crate) fn send_le_flow_control_credit(&mut self, ccb: CcbHandle, credits: u16) {
        let Some((lcb, identifier)) = self.next_local_id(ccb) else {
            return;
        };
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        let message = SignalingMessage::LeFlowControlCredit {
            identifier,
            cid: chan.local_cid,
            credits,
        };
        self.send_signal(lcb, message);
    }
}
