//! Unit tests for the ACL manager

use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::config::StackConfig;
use crate::gap::{BdAddr, LinkRole, Transport};
use crate::hci::constants::*;
use crate::hci::{AclPacket, HciCommand, HciInterface};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    Cmd(HciCommand),
    LinkUp(BdAddr, u16),
    LinkDown(BdAddr, u16),
    RoleChanged(BdAddr, LinkRole, u8),
    FeaturesRead(BdAddr, usize),
    SwitchDone(RoleSwitchResult),
}

type Log = Arc<Mutex<Vec<Record>>>;

struct RecordingHci(Log);

impl HciInterface for RecordingHci {
    fn send_command(&mut self, command: HciCommand) {
        self.0.lock().push(Record::Cmd(command));
    }

    fn send_acl(&mut self, _packet: AclPacket, _num_segments: u16) {}
}

struct RecordingObserver(Log);

impl AclObserver for RecordingObserver {
    fn link_up(&mut self, bd_addr: BdAddr, handle: u16, _transport: Transport, _features: &[u8; 8]) {
        self.0.lock().push(Record::LinkUp(bd_addr, handle));
    }

    fn link_down(&mut self, bd_addr: BdAddr, handle: u16, _transport: Transport) {
        self.0.lock().push(Record::LinkDown(bd_addr, handle));
    }

    fn role_changed(&mut self, bd_addr: BdAddr, new_role: LinkRole, hci_status: u8) {
        self.0.lock().push(Record::RoleChanged(bd_addr, new_role, hci_status));
    }

    fn remote_features_read(&mut self, bd_addr: BdAddr, pages: &[[u8; 8]]) {
        self.0.lock().push(Record::FeaturesRead(bd_addr, pages.len()));
    }
}

const PEER: BdAddr = BdAddr {
    bytes: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
};
const HANDLE: u16 = 0x0042;
const EXT_FEATURES: [u8; 8] = [0x20, 0, 0, 0, 0, 0, 0, 0x80];
const AUDIO_CLASS: [u8; 3] = [0x20, 0x24, 0x04];

fn setup_with(config: StackConfig) -> (AclManager, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut acl = AclManager::new(
        config.controller_info(),
        config.max_links,
        Box::new(RecordingHci(log.clone())),
    );
    acl.set_observer(Box::new(RecordingObserver(log.clone())));
    (acl, log)
}

fn setup() -> (AclManager, Log) {
    setup_with(StackConfig::default())
}

/// Brings a classic link up with page 0 only
fn connect(acl: &mut AclManager, log: &Log) {
    acl.acl_created(PEER, None, HANDLE, LinkRole::Slave, Transport::BrEdr);
    acl.read_remote_features_complete(HCI_SUCCESS, HANDLE, [0x20, 0, 0, 0, 0, 0, 0, 0]);
    log.lock().clear();
}

fn commands(log: &Log) -> Vec<HciCommand> {
    log.lock()
        .iter()
        .filter_map(|r| match r {
            Record::Cmd(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

fn count(log: &Log, pred: impl Fn(&Record) -> bool) -> usize {
    log.lock().iter().filter(|r| pred(r)).count()
}

#[test]
fn test_acl_created_starts_feature_discovery() {
    let (mut acl, log) = setup();

    acl.acl_created(PEER, None, HANDLE, LinkRole::Slave, Transport::BrEdr);

    let cmds = commands(&log);
    assert!(cmds.contains(&HciCommand::ReadClockOffset { handle: HANDLE }));
    assert!(cmds.contains(&HciCommand::ReadRemoteVersionInformation { handle: HANDLE }));
    assert!(cmds.contains(&HciCommand::ReadRemoteSupportedFeatures { handle: HANDLE }));
    assert!(acl.is_acl_up(PEER, Transport::BrEdr));
    assert_eq!(count(&log, |r| matches!(r, Record::LinkUp(..))), 0);
}

#[test]
fn test_duplicate_acl_created_merges() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);

    acl.acl_created(PEER, None, HANDLE, LinkRole::Master, Transport::BrEdr);

    assert_eq!(acl.num_acl_links(), 1);
    assert_eq!(acl.get_role(PEER), Some(LinkRole::Master));
    assert!(commands(&log)
        .iter()
        .any(|c| matches!(c, HciCommand::WriteLinkPolicySettings { handle: HANDLE, .. })));
    assert!(!commands(&log)
        .iter()
        .any(|c| matches!(c, HciCommand::ReadRemoteSupportedFeatures { .. })));
}

#[test]
fn test_feature_pages_read_in_sequence() {
    let (mut acl, log) = setup();
    acl.acl_created(PEER, None, HANDLE, LinkRole::Slave, Transport::BrEdr);
    log.lock().clear();

    acl.read_remote_features_complete(HCI_SUCCESS, HANDLE, EXT_FEATURES);
    assert_eq!(
        commands(&log),
        vec![HciCommand::ReadRemoteExtendedFeatures { handle: HANDLE, page: 1 }]
    );

    acl.read_remote_ext_features_complete(HANDLE, 1, 2, [0x01; 8]);
    assert_eq!(
        commands(&log).last(),
        Some(&HciCommand::ReadRemoteExtendedFeatures { handle: HANDLE, page: 2 })
    );
    assert_eq!(count(&log, |r| matches!(r, Record::LinkUp(..))), 0);

    acl.read_remote_ext_features_complete(HANDLE, 2, 2, [0x02; 8]);

    assert_eq!(count(&log, |r| matches!(r, Record::LinkUp(..))), 1);
    assert_eq!(count(&log, |r| *r == Record::FeaturesRead(PEER, 3)), 1);
    let conn = acl.conn(PEER, Transport::BrEdr).expect("link");
    assert_eq!(conn.num_read_pages, 3);
    assert_eq!(conn.feature_pages[2], [0x02; 8]);
    assert_eq!(acl.device(PEER).map(|d| d.feature_pages.len()), Some(3));
}

#[test]
fn test_ext_features_failure_still_brings_link_up() {
    let (mut acl, log) = setup();
    acl.acl_created(PEER, None, HANDLE, LinkRole::Slave, Transport::BrEdr);
    acl.read_remote_features_complete(HCI_SUCCESS, HANDLE, EXT_FEATURES);

    acl.read_remote_ext_features_failed(HCI_ERR_UNSUPPORTED_VALUE, HANDLE);

    assert_eq!(count(&log, |r| matches!(r, Record::LinkUp(..))), 1);
    assert_eq!(acl.conn(PEER, Transport::BrEdr).map(|c| c.num_read_pages), Some(1));
}

#[test]
fn test_bad_feature_page_still_brings_link_up_once() {
    let (mut acl, log) = setup();
    acl.acl_created(PEER, None, HANDLE, LinkRole::Slave, Transport::BrEdr);
    acl.read_remote_features_complete(HCI_SUCCESS, HANDLE, EXT_FEATURES);

    acl.read_remote_ext_features_complete(HANDLE, 1, 9, [0xFF; 8]);
    acl.establish_continue(HANDLE);

    assert_eq!(count(&log, |r| matches!(r, Record::LinkUp(..))), 1);
}

#[test]
fn test_page_zero_failure_still_brings_link_up() {
    let (mut acl, log) = setup();
    acl.acl_created(PEER, None, HANDLE, LinkRole::Slave, Transport::BrEdr);
    log.lock().clear();

    acl.read_remote_features_complete(HCI_ERR_UNSPECIFIED, HANDLE, [0xFF; 8]);

    assert_eq!(count(&log, |r| *r == Record::LinkUp(PEER, HANDLE)), 1);
    assert!(!commands(&log)
        .iter()
        .any(|c| matches!(c, HciCommand::ReadRemoteExtendedFeatures { .. })));
    assert_eq!(acl.conn(PEER, Transport::BrEdr).map(|c| c.feature_pages[0]), Some([0; 8]));
    // A failed read is not remembered for the next connection
    assert_eq!(acl.device(PEER).map_or(0, |d| d.feature_pages.len()), 0);
}

#[test]
fn test_cached_features_skip_discovery() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);
    acl.acl_removed(PEER, Transport::BrEdr);
    log.lock().clear();

    acl.acl_created(PEER, None, HANDLE + 1, LinkRole::Slave, Transport::BrEdr);

    assert!(!commands(&log)
        .iter()
        .any(|c| matches!(c, HciCommand::ReadRemoteSupportedFeatures { .. })));
    assert_eq!(count(&log, |r| *r == Record::LinkUp(PEER, HANDLE + 1)), 1);
}

#[test]
fn test_acl_removed_reports_link_down() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);

    acl.acl_removed(PEER, Transport::BrEdr);

    assert_eq!(count(&log, |r| *r == Record::LinkDown(PEER, HANDLE)), 1);
    assert!(!acl.is_acl_up(PEER, Transport::BrEdr));
    assert_eq!(acl.get_role(PEER), None);
}

#[test]
fn test_switch_role_from_sniff_wakes_link_first() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);
    acl.power_mode_changed(HANDLE, PowerMode::Sniff);

    let status = acl.switch_role(PEER, LinkRole::Master, None);

    assert_eq!(status, BtmStatus::CmdStarted);
    assert_eq!(commands(&log), vec![HciCommand::ExitSniffMode { handle: HANDLE }]);
    let conn = acl.conn(PEER, Transport::BrEdr).expect("link");
    assert_eq!(conn.switch_role_state, SwitchRoleState::ModeChange);

    acl.power_mode_changed(HANDLE, PowerMode::Active);

    assert_eq!(
        commands(&log).last(),
        Some(&HciCommand::SwitchRole {
            bd_addr: PEER,
            role: LinkRole::Master
        })
    );
    let conn = acl.conn(PEER, Transport::BrEdr).expect("link");
    assert_eq!(conn.switch_role_state, SwitchRoleState::InProgress);
}

#[test]
fn test_switch_role_toggles_encryption() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);
    acl.set_link_encrypted(PEER, true);

    let results = log.clone();
    let status = acl.switch_role(
        PEER,
        LinkRole::Master,
        Some(Box::new(move |result| results.lock().push(Record::SwitchDone(result)))),
    );
    assert_eq!(status, BtmStatus::CmdStarted);
    assert_eq!(
        commands(&log),
        vec![HciCommand::SetConnectionEncryption {
            handle: HANDLE,
            enable: false
        }]
    );
    assert_eq!(
        acl.conn(PEER, Transport::BrEdr).map(|c| c.switch_role_state),
        Some(SwitchRoleState::EncryptionOff)
    );

    acl.encrypt_change(HANDLE, HCI_SUCCESS, false);
    assert_eq!(
        acl.conn(PEER, Transport::BrEdr).map(|c| c.switch_role_state),
        Some(SwitchRoleState::Switching)
    );

    acl.role_changed(HCI_SUCCESS, Some(PEER), LinkRole::Master);
    assert_eq!(
        commands(&log).last(),
        Some(&HciCommand::SetConnectionEncryption {
            handle: HANDLE,
            enable: true
        })
    );
    // Not reported until encryption is back
    assert_eq!(count(&log, |r| matches!(r, Record::SwitchDone(_))), 0);

    acl.encrypt_change(HANDLE, HCI_SUCCESS, true);

    let conn = acl.conn(PEER, Transport::BrEdr).expect("link");
    assert_eq!(conn.switch_role_state, SwitchRoleState::Idle);
    assert_eq!(conn.encrypt_state, EncryptState::Idle);
    assert_eq!(conn.role, LinkRole::Master);
    assert_eq!(
        count(&log, |r| *r
            == Record::SwitchDone(RoleSwitchResult {
                bd_addr: PEER,
                role: LinkRole::Master,
                hci_status: HCI_SUCCESS,
            })),
        1
    );
    assert_eq!(
        count(&log, |r| *r == Record::RoleChanged(PEER, LinkRole::Master, HCI_SUCCESS)),
        1
    );
}

#[test]
fn test_switch_role_refusals() {
    let (mut acl, log) = setup();
    assert_eq!(acl.switch_role(PEER, LinkRole::Master, None), BtmStatus::UnknownAddr);

    connect(&mut acl, &log);
    assert_eq!(acl.switch_role(PEER, LinkRole::Slave, None), BtmStatus::Success);

    assert_eq!(
        acl.switch_role(PEER, LinkRole::Master, Some(Box::new(|_| {}))),
        BtmStatus::CmdStarted
    );
    // One switch per link, one callback overall
    assert_eq!(acl.switch_role(PEER, LinkRole::Master, None), BtmStatus::Busy);
    assert_eq!(
        acl.switch_role(PEER, LinkRole::Master, Some(Box::new(|_| {}))),
        BtmStatus::Busy
    );

    let config = StackConfig {
        controller_supports_role_switch: false,
        ..StackConfig::default()
    };
    let (mut acl, log) = setup_with(config);
    connect(&mut acl, &log);
    assert_eq!(acl.switch_role(PEER, LinkRole::Master, None), BtmStatus::ModeUnsupported);
}

#[test]
fn test_role_switch_failure_reports_old_role() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);
    let results = log.clone();
    acl.switch_role(
        PEER,
        LinkRole::Master,
        Some(Box::new(move |result| results.lock().push(Record::SwitchDone(result)))),
    );

    acl.role_changed(HCI_ERR_UNSUPPORTED_VALUE, Some(PEER), LinkRole::Master);

    assert_eq!(acl.get_role(PEER), Some(LinkRole::Slave));
    assert_eq!(
        count(&log, |r| *r == Record::RoleChanged(PEER, LinkRole::Slave, HCI_ERR_UNSUPPORTED_VALUE)),
        1
    );
    assert_eq!(
        count(&log, |r| matches!(r, Record::SwitchDone(res) if res.hci_status == HCI_ERR_UNSUPPORTED_VALUE)),
        1
    );
    assert_eq!(
        acl.conn(PEER, Transport::BrEdr).map(|c| c.switch_role_state),
        Some(SwitchRoleState::Idle)
    );
}

#[test]
fn test_audio_device_blacklisted_after_repeated_failures() {
    let (mut acl, log) = setup();
    acl.add_device(PEER, AUDIO_CLASS);
    connect(&mut acl, &log);

    for _ in 0..MAX_SW_ROLE_FAILED_ATTEMPTS {
        assert_eq!(acl.switch_role(PEER, LinkRole::Master, None), BtmStatus::CmdStarted);
        acl.role_changed(HCI_ERR_UNSUPPORTED_VALUE, Some(PEER), LinkRole::Master);
    }

    assert!(acl.is_role_switch_blacklisted(PEER));
    assert_eq!(acl.switch_role(PEER, LinkRole::Master, None), BtmStatus::DevBlacklisted);
}

#[test]
fn test_non_audio_device_never_blacklisted() {
    let (mut acl, log) = setup();
    acl.add_device(PEER, [0x00, 0x01, 0x0C]);
    connect(&mut acl, &log);

    for _ in 0..5 {
        acl.switch_role(PEER, LinkRole::Master, None);
        acl.role_changed(HCI_ERR_UNSUPPORTED_VALUE, Some(PEER), LinkRole::Master);
    }

    assert!(!acl.is_role_switch_blacklisted(PEER));
}

#[test]
fn test_acl_removed_fails_pending_switch() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);
    let results = log.clone();
    acl.switch_role(
        PEER,
        LinkRole::Master,
        Some(Box::new(move |result| results.lock().push(Record::SwitchDone(result)))),
    );

    acl.acl_removed(PEER, Transport::BrEdr);

    assert_eq!(
        count(&log, |r| matches!(r, Record::SwitchDone(res) if res.hci_status == HCI_ERR_NO_CONNECTION)),
        1
    );
}

#[test]
fn test_disconnect_waits_for_role_switch() {
    let (mut acl, log) = setup();
    connect(&mut acl, &log);
    acl.switch_role(PEER, LinkRole::Master, None);

    assert_eq!(acl.remove_acl(PEER, Transport::BrEdr), BtmStatus::Success);
    assert!(!commands(&log)
        .iter()
        .any(|c| matches!(c, HciCommand::Disconnect { .. })));

    acl.role_changed(HCI_SUCCESS, Some(PEER), LinkRole::Master);

    assert_eq!(
        commands(&log).last(),
        Some(&HciCommand::Disconnect {
            handle: HANDLE,
            reason: HCI_ERR_PEER_USER
        })
    );
}

#[test]
fn test_link_policy_masks_unsupported_modes() {
    let config = StackConfig {
        controller_supports_sniff_mode: false,
        ..StackConfig::default()
    };
    let (mut acl, log) = setup_with(config);

    acl.set_default_link_policy(LinkPolicy::MASTER_SLAVE_SWITCH | LinkPolicy::SNIFF_MODE);

    assert_eq!(acl.default_link_policy(), LinkPolicy::MASTER_SLAVE_SWITCH);
    assert_eq!(
        commands(&log),
        vec![HciCommand::WriteDefaultLinkPolicySettings { settings: 0x0001 }]
    );
    assert_eq!(
        acl.set_link_policy(PEER, LinkPolicy::HOLD_MODE),
        BtmStatus::UnknownAddr
    );
}

#[test]
fn test_le_link_reads_le_features_as_master() {
    let (mut acl, log) = setup();

    acl.acl_created(PEER, None, HANDLE, LinkRole::Master, Transport::Le);
    assert_eq!(commands(&log), vec![HciCommand::LeReadRemoteFeatures { handle: HANDLE }]);

    acl.ble_read_remote_features_complete(HCI_SUCCESS, HANDLE, [0x01; 8]);
    assert_eq!(count(&log, |r| *r == Record::LinkUp(PEER, HANDLE)), 1);
}

#[test]
fn test_le_features_failure_still_brings_link_up() {
    let (mut acl, log) = setup();
    acl.acl_created(PEER, None, HANDLE, LinkRole::Master, Transport::Le);

    acl.ble_read_remote_features_complete(HCI_ERR_UNSPECIFIED, HANDLE, [0xFF; 8]);

    assert_eq!(count(&log, |r| *r == Record::LinkUp(PEER, HANDLE)), 1);
    assert_eq!(acl.conn(PEER, Transport::Le).map(|c| c.feature_pages[0]), Some([0; 8]));
}

#[test]
fn test_peer_role_switch_support_from_features() {
    let (mut acl, log) = setup();
    // Unknown device
    assert!(!acl.peer_supports_role_switch(PEER));

    acl.add_device(PEER, [0; 3]);
    // Known device, features never read
    assert!(acl.peer_supports_role_switch(PEER));

    connect(&mut acl, &log);
    assert!(acl.peer_supports_role_switch(PEER));
}
