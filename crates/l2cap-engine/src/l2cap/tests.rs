//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::packet::*;
    use super::super::psm::DYNAMIC_PSM_START;
    use super::super::signaling::*;
    use super::super::types::*;
    use super::super::*;
    use crate::acl::BtmStatus;
    use crate::config::StackConfig;
    use crate::gap::{BdAddr, DevClass, LinkRole, Transport};
    use crate::hci::constants::*;
    use crate::hci::{AclHeader, AclPacket, HciCommand, HciInterface};
    use parking_lot::Mutex;
    use std::sync::Arc;

    const PEER_CID: u16 = 0x0050;
    const HANDLE: u16 = 0x0001;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Cmd(HciCommand),
        Acl(AclPacket, u16),
        Arm(TimerId, u64),
        Cancel(TimerId),
        AccessReq { psm: u16, is_originator: bool },
        SecDisconnect(u16),
        AclCreated(BdAddr, Transport),
        AclRemoved(BdAddr),
        SwitchRole(BdAddr),
        ConnectInd { lcid: u16, psm: u16, id: u8 },
        ConnectCfm { lcid: u16, result: u16 },
        ConnectPnd(u16),
        ConfigInd(u16),
        ConfigCfm(u16, u16),
        DisconnectInd { lcid: u16, ack_needed: bool },
        DisconnectCfm { lcid: u16, result: u16 },
        DataInd(u16, Vec<u8>),
        Congestion(u16, bool),
        TxComplete(u16),
        Credits(u16, u16, u16),
    }

    type Log = Arc<Mutex<Vec<Event>>>;

    struct RecordingHci(Log);

    impl HciInterface for RecordingHci {
        fn send_command(&mut self, command: HciCommand) {
            self.0.lock().push(Event::Cmd(command));
        }

        fn send_acl(&mut self, packet: AclPacket, num_segments: u16) {
            self.0.lock().push(Event::Acl(packet, num_segments));
        }
    }

    struct RecordingTimers(Log);

    impl TimerService for RecordingTimers {
        fn arm(&mut self, id: TimerId, timeout_ms: u64) {
            self.0.lock().push(Event::Arm(id, timeout_ms));
        }

        fn cancel(&mut self, id: TimerId) {
            self.0.lock().push(Event::Cancel(id));
        }
    }

    struct ScriptedSecurity {
        log: Log,
        verdict: Arc<Mutex<SecurityStatus>>,
    }

    impl SecurityGate for ScriptedSecurity {
        fn access_req(&mut self, request: &AccessRequest) -> SecurityStatus {
            self.log.lock().push(Event::AccessReq {
                psm: request.psm,
                is_originator: request.is_originator,
            });
            *self.verdict.lock()
        }

        fn abort_access_req(&mut self, _bd_addr: BdAddr) {}

        fn disconnect(&mut self, handle: u16, _reason: u8) -> SecurityStatus {
            self.log.lock().push(Event::SecDisconnect(handle));
            SecurityStatus::CmdStarted
        }
    }

    struct RecordingAcl(Log);

    impl AclLink for RecordingAcl {
        fn acl_created(
            &mut self,
            bd_addr: BdAddr,
            _dev_class: Option<DevClass>,
            _handle: u16,
            _role: LinkRole,
            transport: Transport,
        ) {
            self.0.lock().push(Event::AclCreated(bd_addr, transport));
        }

        fn acl_removed(&mut self, bd_addr: BdAddr, _transport: Transport) {
            self.0.lock().push(Event::AclRemoved(bd_addr));
        }

        fn set_power_mode_active(&mut self, _bd_addr: BdAddr) {}

        fn power_mode_pending(&self, _bd_addr: BdAddr) -> bool {
            false
        }

        fn switch_role(&mut self, bd_addr: BdAddr, _role: LinkRole) -> BtmStatus {
            self.0.lock().push(Event::SwitchRole(bd_addr));
            BtmStatus::CmdStarted
        }

        fn peer_supports_role_switch(&self, _bd_addr: BdAddr) -> bool {
            true
        }
    }

    struct RecordingOwner(Log);

    impl ChannelOwner for RecordingOwner {
        fn connect_ind(&self, _bd_addr: BdAddr, lcid: u16, psm: u16, identifier: u8) {
            self.0.lock().push(Event::ConnectInd {
                lcid,
                psm,
                id: identifier,
            });
        }

        fn connect_cfm(&self, lcid: u16, result: u16) {
            self.0.lock().push(Event::ConnectCfm { lcid, result });
        }

        fn connect_pnd(&self, lcid: u16) {
            self.0.lock().push(Event::ConnectPnd(lcid));
        }

        fn config_ind(&self, lcid: u16, _config: &ConfigInfo) {
            self.0.lock().push(Event::ConfigInd(lcid));
        }

        fn config_cfm(&self, lcid: u16, config: &ConfigInfo) {
            self.0.lock().push(Event::ConfigCfm(lcid, config.result));
        }

        fn disconnect_ind(&self, lcid: u16, ack_needed: bool) {
            self.0.lock().push(Event::DisconnectInd { lcid, ack_needed });
        }

        fn disconnect_cfm(&self, lcid: u16, result: u16) {
            self.0.lock().push(Event::DisconnectCfm { lcid, result });
        }

        fn data_ind(&self, lcid: u16, data: Vec<u8>) {
            self.0.lock().push(Event::DataInd(lcid, data));
        }

        fn congestion_status(&self, lcid: u16, congested: bool) {
            self.0.lock().push(Event::Congestion(lcid, congested));
        }

        fn tx_complete(&self, lcid: u16, _num_sdus: u16) {
            self.0.lock().push(Event::TxComplete(lcid));
        }

        fn credits_received(&self, lcid: u16, credits: u16, credit_count: u16) {
            self.0.lock().push(Event::Credits(lcid, credits, credit_count));
        }
    }

    struct Harness {
        manager: L2capManager,
        log: Log,
        owner: Arc<RecordingOwner>,
        verdict: Arc<Mutex<SecurityStatus>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(StackConfig::default())
        }

        fn with_config(config: StackConfig) -> Self {
            let log: Log = Arc::new(Mutex::new(Vec::new()));
            let verdict = Arc::new(Mutex::new(SecurityStatus::Success));
            let collaborators = Collaborators {
                hci: Box::new(RecordingHci(log.clone())),
                security: Box::new(ScriptedSecurity {
                    log: log.clone(),
                    verdict: verdict.clone(),
                }),
                timers: Box::new(RecordingTimers(log.clone())),
                acl: Box::new(RecordingAcl(log.clone())),
                fcr: Box::new(BasicFcr),
            };

            Self {
                manager: L2capManager::new(&config, collaborators),
                owner: Arc::new(RecordingOwner(log.clone())),
                log,
                verdict,
            }
        }

        fn events(&self) -> Vec<Event> {
            self.log.lock().clone()
        }

        fn clear(&self) {
            self.log.lock().clear();
        }

        fn has(&self, event: &Event) -> bool {
            self.log.lock().contains(event)
        }

        /// Signaling commands sent to the peer, in order
        fn sent_signals(&self) -> Vec<SignalingMessage> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Acl(packet, _) => {
                        let header = L2capHeader::parse(&packet.payload)?;
                        if header.channel_id != L2CAP_SIGNALING_CID
                            && header.channel_id != L2CAP_LE_SIGNALING_CID
                        {
                            return None;
                        }
                        SignalingMessage::parse(&packet.payload[L2CAP_PKT_OVERHEAD..]).ok()
                    }
                    _ => None,
                })
                .collect()
        }

        fn last_signal(&self) -> SignalingMessage {
            self.sent_signals().pop().expect("no signaling sent")
        }

        fn acl_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, Event::Acl(..)))
                .count()
        }

        fn receive(&mut self, handle: u16, cid: u16, payload: &[u8]) {
            let l2cap = build_basic_frame(cid, payload);
            let mut packet = AclHeader::new(handle, ACL_PB_START_FLUSHABLE, l2cap.len() as u16)
                .to_bytes()
                .to_vec();
            packet.extend_from_slice(&l2cap);
            self.manager.process_acl_data(&packet);
        }

        fn receive_signal(&mut self, handle: u16, message: SignalingMessage) {
            self.receive(handle, L2CAP_SIGNALING_CID, &message.serialize());
        }

        fn receive_le_signal(&mut self, handle: u16, message: SignalingMessage) {
            self.receive(handle, L2CAP_LE_SIGNALING_CID, &message.serialize());
        }

        fn ccb(&self, lcid: u16) -> CcbHandle {
            self.manager.find_ccb_by_cid(None, lcid).expect("no such channel")
        }

        fn state(&self, lcid: u16) -> Option<ChannelState> {
            let ccb = self.manager.find_ccb_by_cid(None, lcid)?;
            self.manager.channel(ccb).map(|c| c.state)
        }

        fn local_id(&self, lcid: u16) -> u8 {
            self.manager.channel(self.ccb(lcid)).map_or(0, |c| c.local_id)
        }

        fn register(&mut self, psm: u16) {
            self.manager
                .register_psm(psm, self.owner.clone(), SecurityLevel::None, None)
                .unwrap();
        }

        /// Incoming ACL link, up and past the extended features request
        fn bring_up(&mut self, bd_addr: BdAddr, handle: u16) {
            assert!(self.manager.hci_conn_req(bd_addr));
            assert!(self.manager.hci_conn_comp(HCI_SUCCESS, handle, bd_addr));

            let identifier = match self.last_signal() {
                SignalingMessage::InformationRequest { identifier, .. } => identifier,
                other => panic!("expected info request, got {:?}", other),
            };
            self.receive_signal(
                handle,
                SignalingMessage::InformationResponse {
                    identifier,
                    info_type: L2CAP_EXTENDED_FEATURES_INFO_TYPE,
                    result: L2CAP_INFO_RESP_RESULT_SUCCESS,
                    data: vec![0; 4],
                },
            );
        }

        /// Peer opens a channel to `psm`; returns the local CID once the
        /// owner has been told
        fn incoming(&mut self, handle: u16, psm: u16, identifier: u8) -> u16 {
            self.receive_signal(
                handle,
                SignalingMessage::ConnectionRequest {
                    identifier,
                    psm,
                    source_cid: PEER_CID,
                },
            );
            self.events()
                .into_iter()
                .rev()
                .find_map(|e| match e {
                    Event::ConnectInd { lcid, .. } => Some(lcid),
                    _ => None,
                })
                .expect("no connect_ind")
        }

        /// Accepted incoming channel, configured in basic mode both ways
        fn open_incoming(&mut self, bd_addr: BdAddr, handle: u16, psm: u16) -> u16 {
            let lcid = self.incoming(handle, psm, 0x20);
            self.manager
                .connect_rsp(bd_addr, 0x20, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
                .unwrap();

            self.manager.config_req(lcid, ConfigInfo::with_mtu(L2CAP_DEFAULT_MTU)).unwrap();
            let identifier = self.local_id(lcid);
            self.receive_signal(
                handle,
                SignalingMessage::ConfigureResponse {
                    identifier,
                    source_cid: lcid,
                    config: ConfigInfo::default(),
                    unknown_options: Vec::new(),
                },
            );
            self.receive_signal(
                handle,
                SignalingMessage::ConfigureRequest {
                    identifier: 0x21,
                    destination_cid: lcid,
                    config: ConfigInfo::with_mtu(L2CAP_DEFAULT_MTU),
                    unknown_options: Vec::new(),
                },
            );
            self.manager.config_rsp(lcid, ConfigInfo::default()).unwrap();
            assert_eq!(self.state(lcid), Some(ChannelState::Open));
            lcid
        }
    }

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([last, 0x55, 0x44, 0x33, 0x22, 0x11])
    }

    #[test]
    fn test_l2cap_header() {
        let header = L2capHeader::new(10, 0x0040);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x0A, 0x00, 0x40, 0x00]);

        let parsed = L2capHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(L2capHeader::parse(&bytes[..3]).is_none());

        let frame = build_basic_frame(0x0041, &[1, 2, 3]);
        assert_eq!(frame, vec![0x03, 0x00, 0x41, 0x00, 1, 2, 3]);
    }

    #[test]
    fn test_signaling_message_connection_request() {
        let message = SignalingMessage::ConnectionRequest {
            identifier: 1,
            psm: 0x0003,
            source_cid: 0x0040,
        };

        let bytes = message.serialize();
        assert_eq!(bytes, vec![0x02, 0x01, 0x04, 0x00, 0x03, 0x00, 0x40, 0x00]);
        assert_eq!(SignalingMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn test_signaling_config_request_keeps_unknown_options() {
        // MTU 512, then option 0x20 (not a hint) with two bytes
        let bytes = [
            0x04, 0x03, 0x0C, 0x00, 0x40, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x02, 0x20, 0x02,
            0xAA, 0xBB,
        ];

        match SignalingMessage::parse(&bytes).unwrap() {
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                config,
                unknown_options,
            } => {
                assert_eq!(identifier, 3);
                assert_eq!(destination_cid, 0x0040);
                assert_eq!(config.mtu, Some(512));
                assert_eq!(unknown_options, vec![0x20, 0x02, 0xAA, 0xBB]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_signaling_unknown_code_is_not_an_error() {
        let header = L2capCommandHeader::new(0x20, 7, 0);
        assert_eq!(SignalingMessage::parse_command(&header, &[]), Ok(None));
        assert!(SignalingMessage::parse(&[0x02, 0x01, 0x04, 0x00, 0x03]).is_err());
    }

    #[test]
    fn test_outgoing_channel_lifecycle() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);

        let lcid = h.manager.connect_req(0x1001, peer, None).unwrap();
        assert_eq!(lcid, L2CAP_BASE_APPL_CID);
        assert!(h.events().iter().any(|e| matches!(
            e,
            Event::Cmd(HciCommand::CreateConnection { bd_addr, .. }) if *bd_addr == peer
        )));

        // Link up: the channel waits for the features request
        assert!(h.manager.hci_conn_comp(HCI_SUCCESS, HANDLE, peer));
        assert!(h.has(&Event::AclCreated(peer, Transport::BrEdr)));
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2capConnectRsp));
        assert!(matches!(h.last_signal(), SignalingMessage::InformationRequest { .. }));

        h.receive_signal(
            HANDLE,
            SignalingMessage::InformationResponse {
                identifier: 1,
                info_type: L2CAP_EXTENDED_FEATURES_INFO_TYPE,
                result: L2CAP_INFO_RESP_RESULT_SUCCESS,
                data: L2CAP_EXTFEA_ENH_RETRANS.to_le_bytes().to_vec(),
            },
        );
        assert_eq!(h.manager.peer_features(peer), Some((L2CAP_EXTFEA_ENH_RETRANS, 0)));

        let identifier = match h.last_signal() {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => {
                assert_eq!((psm, source_cid), (0x1001, lcid));
                identifier
            }
            other => panic!("expected connect request, got {:?}", other),
        };

        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: lcid,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            },
        );
        assert!(h.has(&Event::ConnectCfm {
            lcid,
            result: L2CAP_CONN_OK
        }));
        assert_eq!(h.state(lcid), Some(ChannelState::Config));

        h.manager.config_req(lcid, ConfigInfo::with_mtu(L2CAP_DEFAULT_MTU)).unwrap();
        let identifier = h.local_id(lcid);
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid: lcid,
                config: ConfigInfo::default(),
                unknown_options: Vec::new(),
            },
        );
        assert!(h.has(&Event::ConfigCfm(lcid, L2CAP_CFG_OK)));

        h.receive_signal(
            HANDLE,
            SignalingMessage::ConfigureRequest {
                identifier: 0x31,
                destination_cid: lcid,
                config: ConfigInfo::with_mtu(L2CAP_DEFAULT_MTU),
                unknown_options: Vec::new(),
            },
        );
        assert!(h.has(&Event::ConfigInd(lcid)));
        h.manager.config_rsp(lcid, ConfigInfo::default()).unwrap();
        assert_eq!(h.state(lcid), Some(ChannelState::Open));

        // Basic mode data goes out behind an L2CAP header
        h.clear();
        assert_eq!(h.manager.data_write(lcid, vec![1, 2, 3]), DataWriteStatus::Success);
        let sent: Vec<AclPacket> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Acl(packet, _) => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.handle, HANDLE);
        assert_eq!(sent[0].payload, build_basic_frame(PEER_CID, &[1, 2, 3]));
        assert!(h.has(&Event::TxComplete(lcid)));

        h.receive(HANDLE, lcid, &[9, 8, 7]);
        assert!(h.has(&Event::DataInd(lcid, vec![9, 8, 7])));

        h.manager.disconnect_req(lcid).unwrap();
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2capDisconnectRsp));
        let identifier = match h.last_signal() {
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => {
                assert_eq!((destination_cid, source_cid), (PEER_CID, lcid));
                identifier
            }
            other => panic!("expected disconnect request, got {:?}", other),
        };

        h.receive_signal(
            HANDLE,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: lcid,
            },
        );
        assert!(h.has(&Event::DisconnectCfm {
            lcid,
            result: L2CAP_DISC_OK
        }));
        assert_eq!(h.state(lcid), None);

        // Last channel gone: the idle countdown starts
        let lcb = h.manager.find_lcb_by_bd_addr(peer, Transport::BrEdr).unwrap();
        assert!(h.has(&Event::Arm(TimerId::Link(lcb), 4000)));
    }

    #[test]
    fn test_idle_link_goes_down_after_timeout() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.bring_up(peer, HANDLE);
        let lcb = h.manager.find_lcb_by_bd_addr(peer, Transport::BrEdr).unwrap();

        h.manager.set_idle_timeout_by_bd_addr(peer, 2, Transport::BrEdr).unwrap();
        assert!(h.has(&Event::Arm(TimerId::Link(lcb), 2000)));

        h.manager.timer_expired(TimerId::Link(lcb));
        assert!(h.has(&Event::SecDisconnect(HANDLE)));
        assert_eq!(h.manager.link(lcb).map(|l| l.state), Some(LinkState::Disconnecting));

        assert!(h.manager.hci_disc_comp(HANDLE, HCI_ERR_PEER_USER));
        assert!(h.manager.link(lcb).is_none());
        assert!(h.has(&Event::AclRemoved(peer)));
        assert!(!h.manager.hci_disc_comp(HANDLE, HCI_ERR_PEER_USER));
    }

    #[test]
    fn test_incoming_channel_waits_for_owner() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        let lcid = h.incoming(HANDLE, 0x1001, 0x20);
        assert!(h.has(&Event::ConnectInd {
            lcid,
            psm: 0x1001,
            id: 0x20
        }));
        assert!(h.has(&Event::AccessReq {
            psm: 0x1001,
            is_originator: false
        }));
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2caConnectRsp));

        // Wrong identifier or address is refused without touching the channel
        assert!(h
            .manager
            .connect_rsp(peer, 0x21, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .is_err());
        assert!(h
            .manager
            .connect_rsp(addr(2), 0x20, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .is_err());

        h.manager
            .connect_rsp(peer, 0x20, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();
        assert_eq!(
            h.last_signal(),
            SignalingMessage::ConnectionResponse {
                identifier: 0x20,
                destination_cid: lcid,
                source_cid: PEER_CID,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            }
        );
        assert_eq!(h.state(lcid), Some(ChannelState::Config));
    }

    #[test]
    fn test_unknown_psm_rejected_without_channel() {
        let mut h = Harness::new();
        h.bring_up(addr(1), HANDLE);

        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionRequest {
                identifier: 0x11,
                psm: 0x1003,
                source_cid: PEER_CID,
            },
        );
        assert_eq!(
            h.last_signal(),
            SignalingMessage::ConnectionResponse {
                identifier: 0x11,
                destination_cid: 0,
                source_cid: PEER_CID,
                result: L2CAP_CONN_NO_PSM,
                status: L2CAP_CONN_STATUS_NONE,
            }
        );
        assert!(h.manager.find_ccb_by_cid(None, L2CAP_BASE_APPL_CID).is_none());
    }

    #[test]
    fn test_security_pending_sends_pending_response() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        *h.verdict.lock() = SecurityStatus::CmdStarted;
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionRequest {
                identifier: 0x12,
                psm: 0x1001,
                source_cid: PEER_CID,
            },
        );
        let lcid = L2CAP_BASE_APPL_CID;
        assert_eq!(h.state(lcid), Some(ChannelState::TermW4SecComp));
        assert_eq!(
            h.last_signal(),
            SignalingMessage::ConnectionResponse {
                identifier: 0x12,
                destination_cid: lcid,
                source_cid: PEER_CID,
                result: L2CAP_CONN_PENDING,
                status: L2CAP_CONN_STATUS_AUTHENTICATION_PENDING,
            }
        );

        let ccb = h.ccb(lcid);
        h.manager.link_sec_comp(peer, Transport::BrEdr, ccb, SecurityStatus::Success);
        assert!(h.has(&Event::ConnectInd {
            lcid,
            psm: 0x1001,
            id: 0x12
        }));
    }

    #[test]
    fn test_security_failure_blocks_incoming_channel() {
        let mut h = Harness::new();
        h.register(0x1001);
        h.bring_up(addr(1), HANDLE);

        *h.verdict.lock() = SecurityStatus::FailedAuthentication;
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionRequest {
                identifier: 0x13,
                psm: 0x1001,
                source_cid: PEER_CID,
            },
        );
        match h.last_signal() {
            SignalingMessage::ConnectionResponse { result, .. } => {
                assert_eq!(result, L2CAP_CONN_SECURITY_BLOCK)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.manager.find_ccb_by_cid(None, L2CAP_BASE_APPL_CID).is_none());
        assert!(!h.events().iter().any(|e| matches!(e, Event::ConnectInd { .. })));
    }

    #[test]
    fn test_immediate_security_failure_blocks_outgoing_channel() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        let lcb = h.manager.find_lcb_by_bd_addr(peer, Transport::BrEdr).unwrap();
        h.clear();

        *h.verdict.lock() = SecurityStatus::FailedAuthentication;
        let lcid = h.manager.connect_req(0x1001, peer, None).unwrap();

        assert!(h.has(&Event::AccessReq {
            psm: 0x1001,
            is_originator: true
        }));
        assert!(h.has(&Event::ConnectCfm {
            lcid,
            result: L2CAP_CONN_SECURITY_BLOCK
        }));
        assert_eq!(h.state(lcid), None);
        assert!(h.sent_signals().is_empty());

        // The link winds down on its normal idle timer
        assert!(h.has(&Event::Arm(TimerId::Link(lcb), 4000)));
        assert!(!h.has(&Event::SecDisconnect(HANDLE)));
    }

    #[test]
    fn test_pending_outgoing_security_waits_for_verdict() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        h.clear();

        *h.verdict.lock() = SecurityStatus::CmdStarted;
        let lcid = h.manager.connect_req(0x1001, peer, None).unwrap();
        assert_eq!(h.state(lcid), Some(ChannelState::OrigW4SecComp));
        assert!(h.sent_signals().is_empty());

        let ccb = h.ccb(lcid);
        h.manager
            .link_sec_comp(peer, Transport::BrEdr, ccb, SecurityStatus::FailedAuthentication);
        assert!(h.has(&Event::ConnectCfm {
            lcid,
            result: u16::from(HCI_ERR_AUTH_FAILURE)
        }));
        assert_eq!(h.state(lcid), None);
    }

    #[test]
    fn test_pending_connect_response_extends_timer() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        let lcid = h.manager.connect_req(0x1001, peer, None).unwrap();
        let ccb = h.ccb(lcid);
        assert!(h.has(&Event::Arm(TimerId::Channel(ccb), L2CAP_CHNL_CONNECT_TIMEOUT_MS)));

        let identifier = h.local_id(lcid);
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: lcid,
                result: L2CAP_CONN_PENDING,
                status: L2CAP_CONN_STATUS_AUTHENTICATION_PENDING,
            },
        );
        assert!(h.has(&Event::ConnectPnd(lcid)));
        assert!(h.has(&Event::Arm(TimerId::Channel(ccb), L2CAP_CHNL_CONNECT_EXT_TIMEOUT_MS)));
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2capConnectRsp));

        // A response with a stale identifier is ignored
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionResponse {
                identifier: identifier.wrapping_add(1),
                destination_cid: PEER_CID,
                source_cid: lcid,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            },
        );
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2capConnectRsp));

        h.receive_signal(
            HANDLE,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: lcid,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            },
        );
        assert_eq!(h.state(lcid), Some(ChannelState::Config));
    }

    #[test]
    fn test_connect_timeout_reports_to_owner() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        let lcid = h.manager.connect_req(0x1001, peer, None).unwrap();
        let ccb = h.ccb(lcid);
        h.manager.timer_expired(TimerId::Channel(ccb));

        assert!(h.has(&Event::ConnectCfm {
            lcid,
            result: L2CAP_CONN_TIMEOUT
        }));
        assert_eq!(h.state(lcid), None);
    }

    #[test]
    fn test_mismatched_modes_never_open() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        let lcid = h.incoming(HANDLE, 0x1001, 0x20);
        h.manager
            .connect_rsp(peer, 0x20, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();

        // Peer configures its direction in basic mode first
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConfigureRequest {
                identifier: 0x44,
                destination_cid: lcid,
                config: ConfigInfo::with_mtu(L2CAP_DEFAULT_MTU),
                unknown_options: Vec::new(),
            },
        );
        assert!(h.has(&Event::ConfigInd(lcid)));
        h.manager.config_rsp(lcid, ConfigInfo::default()).unwrap();
        assert_eq!(h.state(lcid), Some(ChannelState::Config));

        // We then ask for ERTM and the peer accepts without echoing it
        let ertm = ConfigInfo {
            fcr: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::EnhancedRetransmission,
                tx_window_size: 10,
                max_transmit: 3,
                retransmit_timeout: 0,
                monitor_timeout: 0,
                max_pdu_size: 1000,
            }),
            ..ConfigInfo::with_mtu(L2CAP_DEFAULT_MTU)
        };
        h.manager.config_req(lcid, ertm).unwrap();
        let identifier = h.local_id(lcid);
        h.receive_signal(
            HANDLE,
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid: lcid,
                config: ConfigInfo::default(),
                unknown_options: Vec::new(),
            },
        );

        assert!(matches!(
            h.last_signal(),
            SignalingMessage::DisconnectionRequest { destination_cid: PEER_CID, source_cid, .. }
                if source_cid == lcid
        ));
        assert!(h.has(&Event::DisconnectInd {
            lcid,
            ack_needed: false
        }));
        assert!(!h.has(&Event::ConfigCfm(lcid, L2CAP_CFG_OK)));
        assert_eq!(h.state(lcid), None);
    }

    #[test]
    fn test_incompatible_mode_disconnects_after_retries() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        let lcid = h.incoming(HANDLE, 0x1001, 0x20);
        h.manager
            .connect_rsp(peer, 0x20, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();

        let ertm = ConfigInfo {
            fcr: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::EnhancedRetransmission,
                tx_window_size: 10,
                max_transmit: 3,
                retransmit_timeout: 0,
                monitor_timeout: 0,
                max_pdu_size: 1000,
            }),
            ..Default::default()
        };

        for identifier in [0x40, 0x41] {
            h.receive_signal(
                HANDLE,
                SignalingMessage::ConfigureRequest {
                    identifier,
                    destination_cid: lcid,
                    config: ertm.clone(),
                    unknown_options: Vec::new(),
                },
            );
            match h.last_signal() {
                SignalingMessage::ConfigureResponse { config, .. } => {
                    assert_eq!(config.result, L2CAP_CFG_UNACCEPTABLE_PARAMS);
                    assert_eq!(config.fcr_mode(), RetransmissionMode::Basic);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(h.state(lcid), Some(ChannelState::Config));
        }

        h.receive_signal(
            HANDLE,
            SignalingMessage::ConfigureRequest {
                identifier: 0x42,
                destination_cid: lcid,
                config: ertm,
                unknown_options: Vec::new(),
            },
        );
        assert!(matches!(h.last_signal(), SignalingMessage::DisconnectionRequest { .. }));
        assert!(h.has(&Event::DisconnectInd {
            lcid,
            ack_needed: false
        }));
        assert_eq!(h.state(lcid), None);
    }

    #[test]
    fn test_config_request_with_unknown_option_rejected() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        let lcid = h.incoming(HANDLE, 0x1001, 0x20);
        h.manager
            .connect_rsp(peer, 0x20, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();

        h.receive_signal(
            HANDLE,
            SignalingMessage::ConfigureRequest {
                identifier: 0x43,
                destination_cid: lcid,
                config: ConfigInfo::default(),
                unknown_options: vec![0x20, 0x01, 0xFF],
            },
        );
        match h.last_signal() {
            SignalingMessage::ConfigureResponse {
                identifier,
                config,
                unknown_options,
                ..
            } => {
                assert_eq!(identifier, 0x43);
                assert_eq!(config.result, L2CAP_CFG_UNKNOWN_OPTIONS);
                assert_eq!(unknown_options, vec![0x20, 0x01, 0xFF]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!h.has(&Event::ConfigInd(lcid)));
    }

    #[test]
    fn test_peer_disconnect_of_open_channel() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        let lcid = h.open_incoming(peer, HANDLE, 0x1001);

        h.receive_signal(
            HANDLE,
            SignalingMessage::DisconnectionRequest {
                identifier: 0x50,
                destination_cid: lcid,
                source_cid: PEER_CID,
            },
        );
        assert!(h.has(&Event::DisconnectInd {
            lcid,
            ack_needed: true
        }));
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2caDisconnectRsp));

        h.manager.disconnect_rsp(lcid).unwrap();
        assert_eq!(
            h.last_signal(),
            SignalingMessage::DisconnectionResponse {
                identifier: 0x50,
                destination_cid: lcid,
                source_cid: PEER_CID,
            }
        );
        assert_eq!(h.state(lcid), None);
    }

    #[test]
    fn test_disconnect_request_for_unknown_cid_rejected() {
        let mut h = Harness::new();
        h.bring_up(addr(1), HANDLE);

        h.receive_signal(
            HANDLE,
            SignalingMessage::DisconnectionRequest {
                identifier: 4,
                destination_cid: 0x0077,
                source_cid: PEER_CID,
            },
        );
        assert_eq!(
            h.last_signal(),
            SignalingMessage::CommandReject {
                identifier: 4,
                reason: L2CAP_CMD_REJ_INVALID_CID,
                data: vec![0x77, 0x00, 0x50, 0x00],
            }
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut h = Harness::new();
        h.bring_up(addr(1), HANDLE);

        h.receive(HANDLE, L2CAP_SIGNALING_CID, &[0x20, 0x07, 0x00, 0x00]);
        assert_eq!(
            h.last_signal(),
            SignalingMessage::CommandReject {
                identifier: 7,
                reason: L2CAP_CMD_REJ_NOT_UNDERSTOOD,
                data: Vec::new(),
            }
        );
    }

    #[test]
    fn test_oversized_signaling_rejected_with_mtu() {
        let mut h = Harness::new();
        h.bring_up(addr(1), HANDLE);

        let echo = SignalingMessage::EchoRequest {
            identifier: 9,
            data: vec![0; 700],
        };
        h.receive_signal(HANDLE, echo);
        assert_eq!(
            h.last_signal(),
            SignalingMessage::CommandReject {
                identifier: 9,
                reason: L2CAP_CMD_REJ_MTU_EXCEEDED,
                data: vec![0xA0, 0x02],
            }
        );
    }

    #[test]
    fn test_info_request_answered_with_features() {
        let mut h = Harness::new();
        h.bring_up(addr(1), HANDLE);

        h.receive_signal(
            HANDLE,
            SignalingMessage::InformationRequest {
                identifier: 0x19,
                info_type: L2CAP_EXTENDED_FEATURES_INFO_TYPE,
            },
        );
        assert_eq!(
            h.last_signal(),
            SignalingMessage::InformationResponse {
                identifier: 0x19,
                info_type: L2CAP_EXTENDED_FEATURES_INFO_TYPE,
                result: L2CAP_INFO_RESP_RESULT_SUCCESS,
                data: L2CAP_EXTFEA_SUPPORTED_MASK.to_le_bytes().to_vec(),
            }
        );
    }

    #[test]
    fn test_link_quota_queues_until_completed() {
        let mut h = Harness::with_config(StackConfig {
            num_acl_bufs: 1,
            ..Default::default()
        });
        h.bring_up(addr(1), HANDLE);
        // The features request holds the only buffer
        assert_eq!(h.acl_count(), 1);

        let mut pdu = SignalingMessage::EchoRequest {
            identifier: 0x10,
            data: vec![1],
        }
        .serialize();
        pdu.extend(
            SignalingMessage::EchoRequest {
                identifier: 0x11,
                data: vec![2],
            }
            .serialize(),
        );
        h.receive(HANDLE, L2CAP_SIGNALING_CID, &pdu);
        assert_eq!(h.acl_count(), 1);

        h.manager.process_num_completed_pkts(&[(HANDLE, 1)]);
        assert_eq!(h.acl_count(), 2);
        assert_eq!(
            h.last_signal(),
            SignalingMessage::EchoResponse {
                identifier: 0x10,
                data: vec![1],
            }
        );

        h.manager.process_num_completed_pkts(&[(HANDLE, 1)]);
        assert_eq!(h.acl_count(), 3);
        assert_eq!(
            h.last_signal(),
            SignalingMessage::EchoResponse {
                identifier: 0x11,
                data: vec![2],
            }
        );
        assert_eq!(h.manager.classic_pool().window, 0);

        // Completions never push the window past the buffer count
        h.manager.process_num_completed_pkts(&[(HANDLE, 5)]);
        assert_eq!(h.manager.classic_pool().window, 1);
    }

    #[test]
    fn test_partial_segments_hold_the_link() {
        let mut h = Harness::with_config(StackConfig {
            num_acl_bufs: 5,
            acl_data_size: 100,
            ..Default::default()
        });
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        let lcid = h.open_incoming(peer, HANDLE, 0x1001);
        let lcb = h.manager.find_lcb_by_bd_addr(peer, Transport::BrEdr).unwrap();

        // Everything sent so far is acknowledged, then the link fills up
        h.manager.process_num_completed_pkts(&[(HANDLE, 10)]);
        {
            let link = h.manager.link_mut(lcb).unwrap();
            assert_eq!(link.link_xmit_quota, 5);
            link.sent_not_acked = 5;
        }
        h.clear();

        // 250 bytes plus the L2CAP header take three 100 byte fragments
        assert_eq!(h.manager.data_write(lcid, vec![0xAB; 250]), DataWriteStatus::Success);
        assert_eq!(h.acl_count(), 0);

        h.manager.process_num_completed_pkts(&[(HANDLE, 1)]);
        let sent: Vec<(AclPacket, u16)> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Acl(packet, segs) => Some((packet, segs)),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 1);
        let (packet, segs) = sent[0].clone();
        assert_eq!((packet.payload.len(), segs), (254, 1));
        assert!(h.manager.link(lcb).unwrap().partial_segment_being_sent);
        assert_eq!(h.manager.link(lcb).unwrap().sent_not_acked, 5);

        // The rest goes back on the link and waits for room
        let remainder = packet.remainder_after(1, 100).unwrap();
        h.manager.segments_xmitted(HANDLE, remainder);
        assert!(!h.manager.link(lcb).unwrap().partial_segment_being_sent);
        assert_eq!(h.acl_count(), 1);

        h.manager.process_num_completed_pkts(&[(HANDLE, 2)]);
        let last = h.events().into_iter().rev().find_map(|e| match e {
            Event::Acl(packet, segs) => Some((packet, segs)),
            _ => None,
        });
        let (packet, segs) = last.unwrap();
        assert_eq!(packet.header.packet_boundary, ACL_PB_CONTINUING);
        assert_eq!((packet.payload.len(), segs), (154, 2));
        assert_eq!(h.acl_count(), 2);
        assert!(!h.manager.link(lcb).unwrap().partial_segment_being_sent);
        assert_eq!(h.manager.link(lcb).unwrap().sent_not_acked, 5);
    }

    #[test]
    fn test_quota_allocation_falls_back_to_round_robin() {
        let mut h = Harness::with_config(StackConfig {
            num_acl_bufs: 5,
            ..Default::default()
        });

        let links: Vec<LcbHandle> = (0..5)
            .map(|i| h.manager.allocate_lcb(addr(i), false, Transport::BrEdr).unwrap())
            .collect();
        for &lcb in &links {
            assert_eq!(h.manager.link(lcb).unwrap().link_xmit_quota, 1);
        }
        assert_eq!(h.manager.classic_pool().round_robin_quota, 0);

        // More links than buffers: everyone shares the round-robin pool
        let sixth = h.manager.allocate_lcb(addr(5), false, Transport::BrEdr).unwrap();
        for &lcb in links.iter().chain([&sixth]) {
            assert_eq!(h.manager.link(lcb).unwrap().link_xmit_quota, 0);
        }
        assert_eq!(h.manager.classic_pool().round_robin_quota, 5);

        // A high priority link takes what it can without starving the rest
        assert!(h.manager.set_acl_priority(addr(0), AclPriority::High));
        assert_eq!(h.manager.link(links[0]).unwrap().link_xmit_quota, 4);
        assert_eq!(h.manager.link(links[1]).unwrap().link_xmit_quota, 0);
        assert_eq!(h.manager.classic_pool().round_robin_quota, 1);

        assert!(!h.manager.set_acl_priority(addr(9), AclPriority::High));
    }

    #[test]
    fn test_data_write_congestion_and_failures() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        let lcid = h.open_incoming(peer, HANDLE, 0x1001);

        assert_eq!(h.manager.data_write(0x0077, vec![1]), DataWriteStatus::Failed);
        assert_eq!(
            h.manager.data_write(lcid, vec![0; usize::from(L2CAP_DEFAULT_MTU) + 1]),
            DataWriteStatus::Failed
        );

        // Controller is full, so writes pile up on the channel
        h.manager.classic_pool.window = 0;
        let ccb = h.ccb(lcid);
        h.manager.channel_mut(ccb).unwrap().buff_quota = 2;

        assert_eq!(h.manager.data_write(lcid, vec![1]), DataWriteStatus::Success);
        assert_eq!(h.manager.data_write(lcid, vec![2]), DataWriteStatus::Success);
        assert_eq!(h.manager.data_write(lcid, vec![3]), DataWriteStatus::Congested);
        assert!(h.has(&Event::Congestion(lcid, true)));
        assert_eq!(h.manager.data_write(lcid, vec![4]), DataWriteStatus::Failed);

        for _ in 0..8 {
            h.manager.process_num_completed_pkts(&[(HANDLE, 1)]);
        }
        assert!(h.has(&Event::Congestion(lcid, false)));
        assert_eq!(h.manager.data_write(lcid, vec![5]), DataWriteStatus::Success);
    }

    #[test]
    fn test_deregister_refused_while_channel_uses_psm() {
        let mut h = Harness::new();
        h.register(0x1001);

        assert!(matches!(
            h.manager.register_psm(0x0002, h.owner.clone(), SecurityLevel::None, None),
            Err(L2capError::InvalidParameter(_))
        ));

        let lcid = h.manager.connect_req(0x1001, addr(1), None).unwrap();
        assert_eq!(h.manager.deregister_psm(0x1001), Err(L2capError::PsmInUse(0x1001)));
        assert_eq!(h.manager.deregister_psm(0x1003), Err(L2capError::PsmNotRegistered(0x1003)));

        h.manager.disconnect_req(lcid).unwrap();
        assert_eq!(h.manager.deregister_psm(0x1001), Ok(()));
        assert_eq!(
            h.manager.connect_req(0x1001, addr(1), None),
            Err(L2capError::PsmNotRegistered(0x1001))
        );
    }

    #[test]
    fn test_registration_limit_and_dynamic_psm() {
        let mut h = Harness::with_config(StackConfig {
            max_clients: 2,
            ..Default::default()
        });

        let psm = h
            .manager
            .register_dynamic_psm(h.owner.clone(), SecurityLevel::None, None)
            .unwrap();
        assert_eq!(psm, DYNAMIC_PSM_START);
        h.manager
            .register_le_psm(0x0080, h.owner.clone(), SecurityLevel::None)
            .unwrap();

        assert_eq!(
            h.manager.register_psm(0x1003, h.owner.clone(), SecurityLevel::None, None),
            Err(L2capError::NoResources)
        );
        // Replacing an existing registration needs no new slot
        assert_eq!(
            h.manager.register_psm(psm, h.owner.clone(), SecurityLevel::Authentication, None),
            Ok(psm)
        );
    }

    #[test]
    fn test_stale_channel_handle_is_ignored() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);

        let lcid = h.incoming(HANDLE, 0x1001, 0x20);
        let stale = h.ccb(lcid);
        h.manager
            .connect_rsp(peer, 0x20, lcid, L2CAP_CONN_NO_RESOURCES, L2CAP_CONN_STATUS_NONE)
            .unwrap();
        assert!(h.manager.channel(stale).is_none());

        // The freed slot goes to the back of the free list
        let next = h.incoming(HANDLE, 0x1001, 0x21);
        assert_ne!(next, lcid);

        h.clear();
        h.manager.csm_execute(stale, CsmEvent::Timeout);
        h.manager.timer_expired(TimerId::Channel(stale));
        assert!(h.events().is_empty());
        assert_eq!(h.state(next), Some(ChannelState::W4L2caConnectRsp));
    }

    #[test]
    fn test_link_loss_and_device_reset() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.register(0x1001);
        h.bring_up(peer, HANDLE);
        let lcid = h.incoming(HANDLE, 0x1001, 0x20);

        h.bring_up(addr(2), 0x0002);
        let other = h.open_incoming(addr(2), 0x0002, 0x1001);

        assert!(h.manager.hci_disc_comp(HANDLE, HCI_ERR_CONN_CAUSE_LOCAL_HOST));
        assert!(h.has(&Event::DisconnectInd {
            lcid,
            ack_needed: false
        }));
        assert!(h.manager.find_lcb_by_bd_addr(peer, Transport::BrEdr).is_none());

        h.manager.device_reset();
        assert!(h.has(&Event::DisconnectInd {
            lcid: other,
            ack_needed: false
        }));
        assert_eq!(h.manager.links().count(), 0);
    }

    #[test]
    fn test_connect_waits_for_role_switch_on_slave_link() {
        let mut h = Harness::new();
        let first = addr(1);
        let second = addr(2);
        h.register(0x1001);

        // Incoming link accepted as slave, the configured default
        h.bring_up(first, HANDLE);
        assert!(h.events().iter().any(|e| matches!(
            e,
            Event::Cmd(HciCommand::AcceptConnectionRequest { role: LinkRole::Slave, .. })
        )));

        h.clear();
        h.manager.connect_req(0x1001, second, None).unwrap();
        let lcb = h.manager.find_lcb_by_bd_addr(second, Transport::BrEdr).unwrap();
        assert!(h.has(&Event::SwitchRole(first)));
        assert_eq!(
            h.manager.link(lcb).map(|l| l.state),
            Some(LinkState::ConnectingWaitSwitch)
        );
        assert!(!h
            .events()
            .iter()
            .any(|e| matches!(e, Event::Cmd(HciCommand::CreateConnection { .. }))));

        h.manager.role_changed(Some(first), LinkRole::Master, HCI_SUCCESS);
        assert!(h.events().iter().any(|e| matches!(
            e,
            Event::Cmd(HciCommand::CreateConnection { bd_addr, allow_role_switch: true, .. })
                if *bd_addr == second
        )));
        assert_eq!(h.manager.link(lcb).map(|l| l.state), Some(LinkState::Connecting));
    }

    #[test]
    fn test_le_encryption_failure_reported_as_authentication() {
        let mut h = Harness::new();
        let peer = addr(1);
        h.manager
            .register_le_psm(0x0080, h.owner.clone(), SecurityLevel::None)
            .unwrap();
        h.manager.ble_conn_comp(HANDLE, LinkRole::Slave, peer);

        *h.verdict.lock() = SecurityStatus::FailedEncryption;
        h.receive_le_signal(
            HANDLE,
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier: 6,
                le_psm: 0x0080,
                source_cid: PEER_CID,
                mtu: 100,
                mps: 30,
                initial_credits: 1,
            },
        );
        match h.last_signal() {
            SignalingMessage::LeCreditBasedConnectionResponse { identifier, result, .. } => {
                assert_eq!(identifier, 6);
                assert_eq!(result, L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.manager.find_ccb_by_cid(None, L2CAP_BASE_APPL_CID).is_none());
        assert!(!h.events().iter().any(|e| matches!(e, Event::ConnectInd { .. })));
    }

    /// LE link from an advertising slave with one accepted credit based
    /// channel. Returns the local CID.
    fn open_le_channel(h: &mut Harness, peer: BdAddr, handle: u16, peer_credits: u16) -> u16 {
        h.manager
            .register_le_psm(0x0080, h.owner.clone(), SecurityLevel::None)
            .unwrap();
        h.manager.ble_conn_comp(handle, LinkRole::Slave, peer);
        assert!(h.has(&Event::AclCreated(peer, Transport::Le)));

        h.receive_le_signal(
            handle,
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier: 5,
                le_psm: 0x0080,
                source_cid: PEER_CID,
                mtu: 100,
                mps: 30,
                initial_credits: peer_credits,
            },
        );
        let lcid = L2CAP_BASE_APPL_CID;
        assert!(h.has(&Event::ConnectInd {
            lcid,
            psm: 0x0080,
            id: 5
        }));

        h.manager
            .connect_rsp(peer, 5, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();
        match h.last_signal() {
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                result,
                ..
            } => {
                assert_eq!((identifier, destination_cid), (5, lcid));
                assert_eq!(result, L2CAP_LE_RESULT_CONN_OK);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.state(lcid), Some(ChannelState::Open));
        lcid
    }

    #[test]
    fn test_le_sdu_reassembly_and_credit_return() {
        let mut h = Harness::new();
        let lcid = open_le_channel(&mut h, addr(1), HANDLE, 3);

        let mut first = 10u16.to_le_bytes().to_vec();
        first.extend_from_slice(&[0, 1, 2, 3, 4, 5]);
        h.receive(HANDLE, lcid, &first);
        assert!(!h.events().iter().any(|e| matches!(e, Event::DataInd(..))));

        h.receive(HANDLE, lcid, &[6, 7, 8, 9]);
        assert!(h.has(&Event::DataInd(lcid, (0..10).collect())));

        // Credits running low are topped back up
        let ccb = h.ccb(lcid);
        h.manager.channel_mut(ccb).unwrap().local_conn_cfg.credits = L2CAP_LE_CREDIT_THRESHOLD + 1;
        let mut sdu = 1u16.to_le_bytes().to_vec();
        sdu.push(0xEE);
        h.receive(HANDLE, lcid, &sdu);
        assert!(matches!(
            h.last_signal(),
            SignalingMessage::LeFlowControlCredit { cid, credits, .. }
                if cid == lcid && credits == L2CAP_LE_CREDIT_DEFAULT - L2CAP_LE_CREDIT_THRESHOLD
        ));
    }

    #[test]
    fn test_le_frame_over_mps_disconnects() {
        let mut h = Harness::new();
        let lcid = open_le_channel(&mut h, addr(1), HANDLE, 3);

        let frame = vec![0; usize::from(L2CAP_LE_MIN_MPS) + 1];
        h.receive(HANDLE, lcid, &frame);
        assert!(matches!(h.last_signal(), SignalingMessage::DisconnectionRequest { .. }));
        assert!(h.has(&Event::DisconnectInd {
            lcid,
            ack_needed: false
        }));
        assert_eq!(h.state(lcid), None);
    }

    #[test]
    fn test_le_segmentation_spends_peer_credits() {
        let mut h = Harness::new();
        let lcid = open_le_channel(&mut h, addr(1), HANDLE, 3);
        h.clear();

        // 50 bytes over an MPS of 30 take two K-frames
        assert_eq!(h.manager.data_write(lcid, vec![0xAB; 50]), DataWriteStatus::Success);
        assert_eq!(h.manager.data_write(lcid, vec![0xCD; 10]), DataWriteStatus::Success);
        assert_eq!(h.manager.data_write(lcid, vec![0xEF; 10]), DataWriteStatus::Success);
        assert_eq!(h.acl_count(), 3);
        assert_eq!(h.manager.data_write(lcid, vec![0; 101]), DataWriteStatus::Failed);

        let frames: Vec<Vec<u8>> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Acl(packet, _) => Some(packet.payload),
                _ => None,
            })
            .collect();
        assert_eq!(frames[0].len(), L2CAP_PKT_OVERHEAD + 30);
        assert_eq!(&frames[0][4..6], &50u16.to_le_bytes());
        assert_eq!(frames[1].len(), L2CAP_PKT_OVERHEAD + 22);
        assert_eq!(&frames[2][4..6], &10u16.to_le_bytes());

        h.receive_le_signal(
            HANDLE,
            SignalingMessage::LeFlowControlCredit {
                identifier: 6,
                cid: PEER_CID,
                credits: 1,
            },
        );
        assert!(h.has(&Event::Credits(lcid, 1, 1)));
        assert_eq!(h.acl_count(), 4);
    }

    #[test]
    fn test_le_credit_overflow_disconnects() {
        let mut h = Harness::new();
        let lcid = open_le_channel(&mut h, addr(1), HANDLE, 3);

        h.receive_le_signal(
            HANDLE,
            SignalingMessage::LeFlowControlCredit {
                identifier: 6,
                cid: PEER_CID,
                credits: L2CAP_LE_CREDIT_MAX,
            },
        );
        assert!(matches!(
            h.last_signal(),
            SignalingMessage::DisconnectionRequest { destination_cid: PEER_CID, source_cid, .. }
                if source_cid == lcid
        ));
        assert_eq!(h.state(lcid), Some(ChannelState::W4L2capDisconnectRsp));
        assert!(!h.events().iter().any(|e| matches!(e, Event::Credits(..))));
    }

    #[test]
    fn test_le_connect_with_duplicate_source_cid_rejected() {
        let mut h = Harness::new();
        open_le_channel(&mut h, addr(1), HANDLE, 3);

        h.receive_le_signal(
            HANDLE,
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier: 8,
                le_psm: 0x0080,
                source_cid: PEER_CID,
                mtu: 100,
                mps: 30,
                initial_credits: 1,
            },
        );
        match h.last_signal() {
            SignalingMessage::LeCreditBasedConnectionResponse { identifier, result, .. } => {
                assert_eq!(identifier, 8);
                assert_eq!(result, L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Classic only commands are not understood on LE
        h.receive_le_signal(
            HANDLE,
            SignalingMessage::EchoRequest {
                identifier: 9,
                data: Vec::new(),
            },
        );
        assert_eq!(
            h.last_signal(),
            SignalingMessage::CommandReject {
                identifier: 9,
                reason: L2CAP_CMD_REJ_NOT_UNDERSTOOD,
                data: Vec::new(),
            }
        );
    }
}
