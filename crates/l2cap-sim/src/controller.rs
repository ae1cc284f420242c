//! Loopback controller
//!
//! Carries commands and ACL data between two hosts and plays the part of
//! both controllers: pages and LE connections always succeed, feature
//! reads answer with a fixed feature set, and every ACL fragment is
//! acknowledged as soon as it is delivered.

use log::{debug, trace, warn};

use l2cap_engine::hci::constants::{
    ACL_PB_CONTINUING, ACL_PB_START_FLUSHABLE, HCI_ERR_CONN_CAUSE_LOCAL_HOST, HCI_ERR_NO_CONNECTION,
    HCI_INVALID_HANDLE, HCI_SUCCESS,
};
use l2cap_engine::hci::{AclHeader, AclPacket, HciCommand};
use l2cap_engine::l2cap::constants::{L2CAP_LE_SIGNALING_CID, L2CAP_PKT_OVERHEAD, L2CAP_SIGNALING_CID};
use l2cap_engine::l2cap::packet::L2capHeader;
use l2cap_engine::l2cap::SignalingMessage;
use l2cap_engine::{LinkRole, StackConfig};

use crate::side::{Side, Wire};

pub const CLASSIC_HANDLE: u16 = 0x0001;
pub const LE_HANDLE: u16 = 0x0040;

/// LMP features page 0, extended features bit set
const FEATURES_PAGE_0: [u8; 8] = [0xBF, 0xFE, 0xCF, 0xFE, 0xDB, 0xFF, 0x7B, 0x87];
/// Secure simple pairing host support
const FEATURES_PAGE_1: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];
const MAX_FEATURES_PAGE: u8 = 1;
const LE_FEATURES: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];

pub struct Controller {
    acl_data_size: u16,
    ble_acl_data_size: u16,
}

impl Controller {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            acl_data_size: config.acl_data_size,
            ble_acl_data_size: config.ble_acl_data_size,
        }
    }

    /// Delivers everything `from` has queued. Returns true if there was
    /// anything.
    pub fn pump(&self, from: &mut Side, to: &mut Side) -> bool {
        let queued = from.take_outbox();
        let progressed = !queued.is_empty();
        for wire in queued {
            match wire {
                Wire::Command(command) => self.command(from, to, command),
                Wire::Acl(packet, num_segments) => self.acl(from, to, packet, num_segments),
            }
        }
        progressed
    }

    fn command(&self, from: &mut Side, to: &mut Side, command: HciCommand) {
        match command {
            HciCommand::CreateConnection { bd_addr, .. } => {
                if bd_addr != to.addr {
                    warn!("{}: nobody answers the page to {}", from.name, bd_addr);
                    from.l2cap
                        .hci_conn_comp(HCI_ERR_NO_CONNECTION, HCI_INVALID_HANDLE, bd_addr);
                    return;
                }
                to.l2cap.hci_conn_req(from.addr);
            }

            HciCommand::AcceptConnectionRequest { bd_addr, role } => {
                // The acceptor asked to be master: the pager ends up slave
                if role == LinkRole::Master {
                    to.l2cap
                        .role_changed(Some(from.addr), LinkRole::Slave, HCI_SUCCESS);
                }
                from.l2cap.hci_conn_comp(HCI_SUCCESS, CLASSIC_HANDLE, bd_addr);
                to.l2cap.hci_conn_comp(HCI_SUCCESS, CLASSIC_HANDLE, from.addr);
            }

            HciCommand::RejectConnectionRequest { reason, .. } => {
                to.l2cap.hci_conn_comp(reason, HCI_INVALID_HANDLE, from.addr);
            }

            HciCommand::Disconnect { handle, reason } => {
                from.l2cap
                    .hci_disc_comp(handle, HCI_ERR_CONN_CAUSE_LOCAL_HOST);
                to.l2cap.hci_disc_comp(handle, reason);
            }

            HciCommand::LeCreateConnection { peer_addr, .. } => {
                if peer_addr != to.addr {
                    warn!("{}: {} is not advertising", from.name, peer_addr);
                    return;
                }
                to.l2cap.ble_conn_comp(LE_HANDLE, LinkRole::Slave, from.addr);
                from.l2cap.ble_conn_comp(LE_HANDLE, LinkRole::Master, peer_addr);
            }

            HciCommand::ReadRemoteSupportedFeatures { handle } => {
                from.acl
                    .lock()
                    .read_remote_features_complete(HCI_SUCCESS, handle, FEATURES_PAGE_0);
            }

            HciCommand::ReadRemoteExtendedFeatures { handle, page } => {
                let features = if page == 1 { FEATURES_PAGE_1 } else { [0; 8] };
                from.acl
                    .lock()
                    .read_remote_ext_features_complete(handle, page, MAX_FEATURES_PAGE, features);
            }

            HciCommand::LeReadRemoteFeatures { handle } => {
                from.acl
                    .lock()
                    .ble_read_remote_features_complete(HCI_SUCCESS, handle, LE_FEATURES);
            }

            HciCommand::SwitchRole { bd_addr, role } => {
                from.acl.lock().role_changed(HCI_SUCCESS, Some(bd_addr), role);
                from.l2cap.role_changed(Some(bd_addr), role, HCI_SUCCESS);
                to.acl
                    .lock()
                    .role_changed(HCI_SUCCESS, Some(from.addr), role.opposite());
                to.l2cap
                    .role_changed(Some(from.addr), role.opposite(), HCI_SUCCESS);
            }

            other => trace!("{}: {:?}", from.name, other),
        }
    }

    /// Sends the first `num_segments` fragments of `packet`, hands any
    /// remainder back to the sender, and reports the fragments completed
    fn acl(&self, from: &mut Side, to: &mut Side, packet: AclPacket, num_segments: u16) {
        let handle = packet.header.handle;
        let acl_data_size = if handle == LE_HANDLE {
            self.ble_acl_data_size
        } else {
            self.acl_data_size
        };

        let sent = packet
            .payload
            .len()
            .min(usize::from(num_segments) * usize::from(acl_data_size));
        let start = packet.header.packet_boundary != ACL_PB_CONTINUING;

        if let Some(pdu) = to.reassemble(handle, start, &packet.payload[..sent]) {
            log_pdu(from.name, &pdu);
            match u16::try_from(pdu.len()) {
                Ok(length) => {
                    let mut frame = AclHeader::new(handle, ACL_PB_START_FLUSHABLE, length)
                        .to_bytes()
                        .to_vec();
                    frame.extend_from_slice(&pdu);
                    to.l2cap.process_acl_data(&frame);
                }
                Err(_) => warn!("{}: dropping {} byte PDU", to.name, pdu.len()),
            }
        }

        if let Some(remainder) = packet.remainder_after(num_segments, acl_data_size) {
            from.l2cap.segments_xmitted(handle, remainder);
        }
        from.l2cap
            .process_num_completed_pkts(&[(handle, num_segments)]);
    }
}

fn log_pdu(sender: &str, pdu: &[u8]) {
    let Some(header) = L2capHeader::parse(pdu) else {
        return;
    };
    let body = &pdu[L2CAP_PKT_OVERHEAD..];

    match header.channel_id {
        L2CAP_SIGNALING_CID | L2CAP_LE_SIGNALING_CID => match SignalingMessage::parse(body) {
            Ok(message) => debug!("{} -> {:?}", sender, message),
            Err(e) => debug!("{} -> signaling we cannot decode: {}", sender, e),
        },
        cid => trace!("{} -> {} bytes on CID 0x{:04X}", sender, body.len(), cid),
    }
}
