//! Inbound ACL data
//!
//! Splits what the controller delivers into signaling commands and channel
//! payloads. Signaling is decoded with the codec in `signaling.rs` and
//! turned into link and channel state machine events; payloads on dynamic
//! channels are handed to the owning channel, reassembling LE K-frames and
//! returning credits on the way.

use std::cmp::Ordering;

use log::{debug, error, trace, warn};

use super::ccb::{CcbHandle, LeRxSdu};
use super::constants::*;
use super::csm::CsmEvent;
use super::interfaces::TimerId;
use super::lcb::LcbHandle;
use super::manager::L2capManager;
use super::packet::{L2capCommandHeader, L2capHeader};
use super::signaling::SignalingMessage;
use super::types::ChannelState;
use crate::hci::constants::{ACL_PB_CONTINUING, HCI_DATA_PREAMBLE_SIZE};
use crate::hci::AclHeader;

/// Outcome of feeding one K-frame into a channel's receive SDU
enum LeRx {
    Partial,
    Complete(Vec<u8>),
    Invalid(&'static str),
}

/// Requests the peer expects an answer to; only these are rejected when a
/// packet breaks the signaling MTU
fn is_request(code: u8) -> bool {
    matches!(
        code,
        L2CAP_CMD_CONN_REQ
            | L2CAP_CMD_CONFIG_REQ
            | L2CAP_CMD_DISC_REQ
            | L2CAP_CMD_ECHO_REQ
            | L2CAP_CMD_INFO_REQ
            | L2CAP_CMD_BLE_UPDATE_REQ
            | L2CAP_CMD_BLE_CREDIT_BASED_CONN_REQ
    )
}

impl L2capManager {
    /// One complete ACL packet from the controller, HCI preamble included
    pub fn process_acl_data(&mut self, packet: &[u8]) {
        let Some(header) = AclHeader::parse(packet) else {
            warn!("L2CAP - ACL packet too short ({} bytes)", packet.len());
            return;
        };

        // The transport reassembles; a lone continuation is garbage
        if header.packet_boundary == ACL_PB_CONTINUING {
            warn!("L2CAP - received packet continuation");
            return;
        }

        let payload = &packet[HCI_DATA_PREAMBLE_SIZE..];
        if (header.length as usize) < L2CAP_PKT_OVERHEAD || header.length as usize != payload.len() {
            warn!("L2CAP - got incorrect hci header");
            return;
        }

        let Some(l2cap) = L2capHeader::parse(payload) else {
            return;
        };
        let Some(lcb) = self.find_lcb_by_handle(header.handle) else {
            error!(
                "L2CAP - rcvd ACL for unknown handle: 0x{:04X} cid: 0x{:04X}",
                header.handle, l2cap.channel_id
            );
            return;
        };

        let body = &payload[L2CAP_PKT_OVERHEAD..];
        if l2cap.length as usize != body.len() {
            warn!(
                "L2CAP - bad length in pkt. Exp: {} Act: {}",
                l2cap.length,
                body.len()
            );
            return;
        }

        let is_le = self.link(lcb).map_or(false, |l| l.transport.is_le());
        match l2cap.channel_id {
            L2CAP_SIGNALING_CID if !is_le => self.process_signaling(lcb, body),
            L2CAP_LE_SIGNALING_CID if is_le => self.process_signaling(lcb, body),
            cid if cid >= L2CAP_BASE_APPL_CID => self.process_channel_data(lcb, cid, body.to_vec()),
            cid => trace!("L2CAP dropping {} bytes on CID 0x{:04X}", body.len(), cid),
        }
    }

    /// Walks every command in a signaling PDU
    pub(crate) fn process_signaling(&mut self, lcb: LcbHandle, data: &[u8]) {
        // One reject for the first request, the rest is ignored
        let oversized = data.len() > L2CAP_SIG_MTU;
        if oversized {
            error!("L2CAP SIG MTU pkt_len={} exceeded {}", data.len(), L2CAP_SIG_MTU);
        }

        let mut offset = 0;
        while offset + L2CAP_CMD_OVERHEAD <= data.len() {
            let Some(header) = L2capCommandHeader::parse(&data[offset..]) else {
                break;
            };
            let start = offset + L2CAP_CMD_OVERHEAD;
            let end = start + header.length as usize;
            if end > data.len() {
                warn!(
                    "L2CAP command len bad pkt_len: {} cmd_len: {} code: {}",
                    data.len(),
                    header.length,
                    header.code
                );
                break;
            }
            offset = end;

            trace!(
                "L2CAP <- cmd_code: {}, id: {}, cmd_len: {}",
                header.code, header.identifier, header.length
            );

            if oversized {
                if is_request(header.code) {
                    let mtu = (L2CAP_SIG_MTU as u16).to_le_bytes().to_vec();
                    self.send_cmd_reject(lcb, L2CAP_CMD_REJ_MTU_EXCEEDED, header.identifier, mtu);
                    return;
                }
                continue;
            }

            match SignalingMessage::parse_command(&header, &data[start..end]) {
                Ok(Some(message)) => self.handle_signal(lcb, message),
                Ok(None) => {
                    warn!("L2CAP - bad cmd code: 0x{:02X}", header.code);
                    self.send_cmd_reject(lcb, L2CAP_CMD_REJ_NOT_UNDERSTOOD, header.identifier, Vec::new());
                    return;
                }
                Err(e) => {
                    warn!("L2CAP - dropping signaling packet: {}", e);
                    return;
                }
            }

            // A command may have taken the link down
            if self.link(lcb).is_none() {
                return;
            }
        }
    }

    fn handle_signal(&mut self, lcb: LcbHandle, message: SignalingMessage) {
        let is_le = self.link(lcb).map_or(false, |l| l.transport.is_le());

        match message {
            SignalingMessage::CommandReject { reason, data, .. } if !is_le => {
                self.on_command_reject(lcb, reason, &data);
            }

            SignalingMessage::CommandReject { reason, .. } => {
                debug!("L2CAP LE command reject 0x{:04X}", reason);
            }

            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } if !is_le => self.on_connection_request(lcb, identifier, psm, source_cid),

            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                ..
            } if !is_le => {
                let Some(ccb) = self.find_ccb_by_cid(Some(lcb), source_cid) else {
                    warn!(
                        "L2CAP - no CCB for conn rsp, LCID: 0x{:04X} RCID: 0x{:04X}",
                        source_cid, destination_cid
                    );
                    return;
                };
                if !self.expects_id(ccb, identifier) {
                    return;
                }

                let event = match result {
                    L2CAP_CONN_OK => CsmEvent::L2capConnectRsp {
                        remote_cid: destination_cid,
                    },
                    L2CAP_CONN_PENDING => CsmEvent::L2capConnectRspPnd {
                        remote_cid: destination_cid,
                    },
                    result => CsmEvent::L2capConnectRspNeg { result },
                };
                self.csm_execute(ccb, event);
            }

            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                config,
                unknown_options,
            } if !is_le => {
                let Some(ccb) = self.find_ccb_by_cid(Some(lcb), destination_cid) else {
                    self.send_cmd_reject_invalid_cid(lcb, identifier, destination_cid, 0);
                    return;
                };
                if let Some(chan) = self.channel_mut(ccb) {
                    chan.remote_id = identifier;
                }

                if unknown_options.is_empty() {
                    self.csm_execute(ccb, CsmEvent::L2capConfigReq(config));
                } else {
                    self.send_peer_config_rej(ccb, unknown_options);
                }
            }

            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                config,
                ..
            } if !is_le => {
                let Some(ccb) = self.find_ccb_by_cid(Some(lcb), source_cid) else {
                    warn!("L2CAP - rcvd cfg rsp for unknown CID: 0x{:04X}", source_cid);
                    return;
                };
                if !self.expects_id(ccb, identifier) {
                    return;
                }

                let event = match config.result {
                    L2CAP_CFG_OK | L2CAP_CFG_PENDING => CsmEvent::L2capConfigRsp(config),
                    _ => CsmEvent::L2capConfigRspNeg(config),
                };
                self.csm_execute(ccb, event);
            }

            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => {
                let Some(ccb) = self.find_ccb_by_cid(Some(lcb), destination_cid) else {
                    self.send_cmd_reject_invalid_cid(lcb, identifier, destination_cid, source_cid);
                    return;
                };
                let Some(chan) = self.channel_mut(ccb) else {
                    return;
                };
                if chan.remote_cid != source_cid {
                    warn!(
                        "L2CAP - disc req RCID 0x{:04X} does not match 0x{:04X}",
                        source_cid, chan.remote_cid
                    );
                    return;
                }
                chan.remote_id = identifier;
                self.csm_execute(ccb, CsmEvent::L2capDisconnectReq);
            }

            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            } => {
                let Some(ccb) = self.find_ccb_by_cid(Some(lcb), source_cid) else {
                    return;
                };
                let matches = self
                    .channel(ccb)
                    .map_or(false, |c| c.remote_cid == destination_cid && c.local_id == identifier);
                if matches {
                    self.csm_execute(ccb, CsmEvent::L2capDisconnectRsp);
                }
            }

            SignalingMessage::EchoRequest { identifier, data } if !is_le => {
                self.send_peer_echo_rsp(lcb, identifier, data);
            }

            SignalingMessage::EchoResponse { .. } if !is_le => {
                debug!("L2CAP echo response on {}", lcb);
            }

            SignalingMessage::InformationRequest { identifier, info_type } if !is_le => {
                self.send_peer_info_rsp(lcb, identifier, info_type);
            }

            SignalingMessage::InformationResponse {
                info_type,
                result,
                data,
                ..
            } if !is_le => self.process_info_rsp(lcb, info_type, result, &data),

            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } if is_le => {
                self.on_le_connection_request(lcb, identifier, le_psm, source_cid, mtu, mps, initial_credits)
            }

            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } if is_le => {
                let Some(ccb) = self.link_ccbs(lcb).into_iter().find(|&c| {
                    self.channel(c).map_or(false, |chan| {
                        chan.local_id == identifier && chan.state == ChannelState::W4L2capConnectRsp
                    })
                }) else {
                    debug!("L2CAP LE conn rsp id {} matches no request", identifier);
                    return;
                };

                let Some(chan) = self.channel_mut(ccb) else {
                    return;
                };
                chan.peer_conn_cfg.mtu = mtu;
                chan.peer_conn_cfg.mps = mps;
                chan.peer_conn_cfg.credits = initial_credits;
                chan.tx_mps = mps;
                chan.le_rx_sdu = None;
                chan.le_tx_rest = None;

                let event = if result != L2CAP_LE_RESULT_CONN_OK {
                    CsmEvent::L2capConnectRspNeg { result }
                } else if mtu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
                    error!("L2CAP LE conn rsp with bad params mtu {} mps {}", mtu, mps);
                    CsmEvent::L2capConnectRspNeg {
                        result: L2CAP_LE_RESULT_NO_RESOURCES,
                    }
                } else {
                    CsmEvent::L2capConnectRsp {
                        remote_cid: destination_cid,
                    }
                };
                self.csm_execute(ccb, event);
            }

            SignalingMessage::LeFlowControlCredit { cid, credits, .. } if is_le => {
                match self.find_ccb_by_remote_cid(lcb, cid) {
                    Some(ccb) => self.csm_execute(ccb, CsmEvent::L2capRecvFlowControlCredit(credits)),
                    None => debug!("L2CAP credit received for unknown channel 0x{:04X}", cid),
                }
            }

            other => {
                warn!(
                    "L2CAP - cmd 0x{:02X} not valid on {} link",
                    other.command_code(),
                    if is_le { "LE" } else { "BR/EDR" }
                );
                self.send_cmd_reject(lcb, L2CAP_CMD_REJ_NOT_UNDERSTOOD, other.identifier(), Vec::new());
            }
        }
    }

    /// Responses must carry the identifier of our outstanding request
    fn expects_id(&self, ccb: CcbHandle, identifier: u8) -> bool {
        let Some(chan) = self.channel(ccb) else {
            return false;
        };
        if chan.local_id != identifier {
            warn!(
                "L2CAP - rsp with bad ID. Exp: {} Got: {}",
                chan.local_id, identifier
            );
            return false;
        }
        true
    }

    fn on_command_reject(&mut self, lcb: LcbHandle, reason: u16, data: &[u8]) {
        match reason {
            L2CAP_CMD_REJ_MTU_EXCEEDED => {
                warn!("L2CAP - MTU rej on {}: {:?}", lcb, data);
            }
            L2CAP_CMD_REJ_INVALID_CID if data.len() >= 4 => {
                let remote_cid = u16::from_le_bytes([data[0], data[1]]);
                let local_cid = u16::from_le_bytes([data[2], data[3]]);
                warn!(
                    "L2CAP - rej with CID invalid, LCID: 0x{:04X} RCID: 0x{:04X}",
                    local_cid, remote_cid
                );

                // Peer forgot the channel: treat it as gone
                if let Some(ccb) = self.find_ccb_by_cid(Some(lcb), local_cid) {
                    if self.channel(ccb).map_or(false, |c| c.remote_cid == remote_cid) {
                        self.csm_execute(ccb, CsmEvent::LpDisconnectInd { reason: None });
                    }
                }
            }
            L2CAP_CMD_REJ_NOT_UNDERSTOOD => {
                // Peers that do not know the info request: carry on without it
                let waiting = self.link(lcb).map_or(false, |l| l.w4_info_rsp);
                if waiting {
                    self.timers.cancel(TimerId::InfoRsp(lcb));
                    if let Some(link) = self.link_mut(lcb) {
                        link.w4_info_rsp = false;
                    }
                    for ccb in self.link_ccbs(lcb) {
                        self.csm_execute(ccb, CsmEvent::L2capInfoRsp);
                    }
                }
            }
            _ => debug!("L2CAP command reject 0x{:04X} on {}", reason, lcb),
        }
    }

    fn on_connection_request(&mut self, lcb: LcbHandle, identifier: u8, psm: u16, remote_cid: u16) {
        let Some(rcb) = self.rcbs.get(&psm).cloned() else {
            warn!("L2CAP - rcvd conn req for unknown PSM: 0x{:04X}", psm);
            self.reject_connection(lcb, remote_cid, identifier, L2CAP_CONN_NO_PSM);
            return;
        };

        let Some(ccb) = self.allocate_ccb(lcb) else {
            error!("L2CAP - unable to allocate CCB");
            self.reject_connection(lcb, remote_cid, identifier, L2CAP_CONN_NO_RESOURCES);
            return;
        };

        if let Some(chan) = self.channel_mut(ccb) {
            chan.remote_id = identifier;
            chan.remote_cid = remote_cid;
            chan.psm = rcb.psm;
            chan.owner = Some(rcb.owner);
            chan.security_level = rcb.security_level;
            chan.ertm_info = rcb.ertm_info;
        }
        self.csm_execute(ccb, CsmEvent::L2capConnectReq);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_le_connection_request(
        &mut self,
        lcb: LcbHandle,
        identifier: u8,
        le_psm: u16,
        remote_cid: u16,
        mtu: u16,
        mps: u16,
        credits: u16,
    ) {
        debug!(
            "L2CAP LE conn req psm 0x{:04X} mtu {} mps {} credits {}",
            le_psm, mtu, mps, credits
        );

        if self.find_ccb_by_remote_cid(lcb, remote_cid).is_some() {
            warn!("L2CAP - rcvd conn req for duplicated cid: 0x{:04X}", remote_cid);
            self.reject_ble_connection(lcb, identifier, L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED);
            return;
        }

        let Some(rcb) = self.le_rcbs.get(&le_psm).cloned() else {
            warn!("L2CAP - rcvd conn req for unknown LE PSM: 0x{:04X}", le_psm);
            self.reject_ble_connection(lcb, identifier, L2CAP_LE_RESULT_NO_PSM);
            return;
        };

        if mtu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
            error!("L2CAP LE conn req with bad params mtu {} mps {}", mtu, mps);
            self.reject_ble_connection(lcb, identifier, L2CAP_LE_RESULT_NO_RESOURCES);
            return;
        }

        let Some(ccb) = self.allocate_ccb(lcb) else {
            error!("L2CAP - unable to allocate CCB");
            self.reject_ble_connection(lcb, identifier, L2CAP_LE_RESULT_NO_RESOURCES);
            return;
        };

        if let Some(chan) = self.channel_mut(ccb) {
            chan.remote_id = identifier;
            chan.remote_cid = remote_cid;
            chan.psm = rcb.psm;
            chan.owner = Some(rcb.owner);
            chan.security_level = rcb.security_level;
            chan.peer_conn_cfg.mtu = mtu;
            chan.peer_conn_cfg.mps = mps;
            chan.peer_conn_cfg.credits = credits;
            chan.tx_mps = mps;
        }
        self.csm_execute(ccb, CsmEvent::L2capConnectReq);
    }

    fn process_channel_data(&mut self, lcb: LcbHandle, cid: u16, pdu: Vec<u8>) {
        let Some(ccb) = self.find_ccb_by_cid(Some(lcb), cid) else {
            warn!("L2CAP - unknown CID: 0x{:04X}", cid);
            return;
        };
        let Some(chan) = self.channel(ccb) else {
            return;
        };

        if self.link(lcb).map_or(false, |l| l.transport.is_le()) {
            self.process_le_pdu(ccb, pdu);
            return;
        }

        if chan.is_basic_mode() {
            self.csm_execute(ccb, CsmEvent::L2capData(pdu));
            return;
        }

        // ERTM and streaming only make sense once configuration started
        if !matches!(chan.state, ChannelState::Open | ChannelState::Config) {
            trace!("L2CAP CID 0x{:04X} dropping PDU in {}", cid, chan.state);
            return;
        }
        for sdu in self.fcr.receive_pdu(cid, pdu) {
            self.csm_execute(ccb, CsmEvent::L2capData(sdu));
        }
    }

    /// Feeds one K-frame into the channel, delivers a completed SDU and
    /// tops up the peer's credits when they run low
    fn process_le_pdu(&mut self, ccb: CcbHandle, pdu: Vec<u8>) {
        match self.reassemble_le_sdu(ccb, &pdu) {
            LeRx::Partial => {}
            LeRx::Complete(sdu) => self.csm_execute(ccb, CsmEvent::L2capData(sdu)),
            LeRx::Invalid(why) => {
                error!("L2CAP LE CID 0x{:04X}: {}, disconnecting", ccb.local_cid(), why);
                self.disconnect_chnl(ccb);
                return;
            }
        }

        let Some(chan) = self.channel_mut(ccb) else {
            return;
        };
        chan.local_conn_cfg.credits = chan.local_conn_cfg.credits.saturating_sub(1);
        if chan.local_conn_cfg.credits <= L2CAP_LE_CREDIT_THRESHOLD {
            let credits = L2CAP_LE_CREDIT_DEFAULT - chan.local_conn_cfg.credits;
            self.csm_execute(ccb, CsmEvent::L2caSendFlowControlCredit(credits));
        }
    }

    fn reassemble_le_sdu(&mut self, ccb: CcbHandle, pdu: &[u8]) -> LeRx {
        let Some(chan) = self.channel_mut(ccb) else {
            return LeRx::Partial;
        };
        if pdu.len() > chan.local_conn_cfg.mps as usize {
            chan.le_rx_sdu = None;
            return LeRx::Invalid("K-frame larger than MPS");
        }

        let mut sdu = match chan.le_rx_sdu.take() {
            Some(mut sdu) => {
                sdu.data.extend_from_slice(pdu);
                sdu
            }
            None => {
                if pdu.len() < L2CAP_SDU_LEN_OVERHEAD {
                    return LeRx::Invalid("first K-frame without SDU length");
                }
                let expected = usize::from(u16::from_le_bytes([pdu[0], pdu[1]]));
                if expected > chan.local_conn_cfg.mtu as usize {
                    return LeRx::Invalid("SDU larger than MTU");
                }
                let mut data = Vec::with_capacity(expected);
                data.extend_from_slice(&pdu[L2CAP_SDU_LEN_OVERHEAD..]);
                LeRxSdu { expected, data }
            }
        };

        match sdu.data.len().cmp(&sdu.expected) {
            Ordering::Less => {
                chan.le_rx_sdu = Some(sdu);
                LeRx::Partial
            }
            Ordering::Equal => LeRx::Complete(std::mem::take(&mut sdu.data)),
            Ordering::Greater => LeRx::Invalid("K-frames overran the SDU length"),
        }
    }
}
