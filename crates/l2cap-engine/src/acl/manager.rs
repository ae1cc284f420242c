use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use super::*;
use crate::config::ControllerInfo;
use crate::gap::{BdAddr, DevClass, LinkRole, Transport};
use crate::hci::constants::{HCI_ERR_NO_CONNECTION, HCI_ERR_PEER_USER, HCI_ERR_UNSUPPORTED_VALUE, HCI_SUCCESS};
use crate::hci::{HciCommand, HciInterface};
use crate::l2cap::AclLink;

/// Highest extended feature page we keep
pub const HCI_EXT_FEATURES_PAGE_MAX: u8 = 2;
const NUM_FEATURE_PAGES: usize = HCI_EXT_FEATURES_PAGE_MAX as usize + 1;

/// Role switch failures before an audio device is blacklisted
pub const MAX_SW_ROLE_FAILED_ATTEMPTS: u8 = 3;

// LMP feature bits, page 0
const LMP_SWITCH_BYTE: usize = 0;
const LMP_SWITCH_MASK: u8 = 0x20;
const LMP_PAUSE_ENCRYPTION_BYTE: usize = 5;
const LMP_PAUSE_ENCRYPTION_MASK: u8 = 0x04;
const LMP_EXTENDED_FEATURES_BYTE: usize = 7;
const LMP_EXTENDED_FEATURES_MASK: u8 = 0x80;

/// Audio service class together with the audio major device class
const COD_AUDIO_DEVICE: u32 = (0x0020 | 0x0004) << 8;

/// Packet types allowed on new BR/EDR links: DM1, DH1, DM3, DH3, DM5, DH5
const DEFAULT_ACL_PACKET_TYPES: u16 = 0xCC18;

/// Whether a disconnect has to wait for a running role switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum RsDisc {
    #[default]
    NotPending,
    /// A switch is running, disconnects are postponed
    RsPending,
    /// A disconnect was postponed and goes out when the switch ends
    DiscPending,
}

/// One ACL link
#[derive(Debug, Clone)]
pub struct AclConn {
    pub bd_addr: BdAddr,
    pub handle: u16,
    pub transport: Transport,
    pub role: LinkRole,
    pub link_up_issued: bool,
    pub switch_role_state: SwitchRoleState,
    pub encrypt_state: EncryptState,
    pub switch_role_failed_attempts: u8,
    pub power_mode: PowerMode,
    /// An exit from sniff or park is in flight
    pub mode_change_pending: bool,
    pub feature_pages: [[u8; 8]; NUM_FEATURE_PAGES],
    pub num_read_pages: u8,
    rs_disc: RsDisc,
}

impl AclConn {
    fn new(bd_addr: BdAddr, handle: u16, role: LinkRole, transport: Transport) -> Self {
        Self {
            bd_addr,
            handle,
            transport,
            role,
            link_up_issued: false,
            switch_role_state: SwitchRoleState::Idle,
            encrypt_state: EncryptState::Idle,
            switch_role_failed_attempts: 0,
            power_mode: PowerMode::Active,
            mode_change_pending: false,
            feature_pages: [[0; 8]; NUM_FEATURE_PAGES],
            num_read_pages: 0,
            rs_disc: RsDisc::NotPending,
        }
    }
}

/// What we remember about a peer across connections
#[derive(Debug, Clone, Default)]
pub struct DeviceRecord {
    pub dev_class: DevClass,
    pub encrypted: bool,
    pub feature_pages: Vec<[u8; 8]>,
}

impl DeviceRecord {
    fn is_audio_device(&self) -> bool {
        let [major, minor, service] = self.dev_class;
        let cod = (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(service);
        cod & COD_AUDIO_DEVICE == COD_AUDIO_DEVICE
    }
}

/// Pending switch role completion and the result reported to it
struct SwitchRoleRequest {
    result: RoleSwitchResult,
    callback: SwitchRoleCallback,
}

/// ACL connection manager
pub struct AclManager {
    controller: ControllerInfo,
    max_links: usize,
    conns: Vec<AclConn>,
    devices: HashMap<BdAddr, DeviceRecord>,
    default_link_policy: LinkPolicy,
    /// Only one switch role callback is honored at a time
    switch_role_req: Option<SwitchRoleRequest>,
    /// Devices that keep failing role switches
    role_switch_blacklist: HashSet<BdAddr>,
    hci: Box<dyn HciInterface>,
    observer: Option<Box<dyn AclObserver>>,
}

impl AclManager {
    pub fn new(controller: ControllerInfo, max_links: usize, hci: Box<dyn HciInterface>) -> Self {
        Self {
            controller,
            max_links,
            conns: Vec::with_capacity(max_links),
            devices: HashMap::new(),
            default_link_policy: LinkPolicy::empty(),
            switch_role_req: None,
            role_switch_blacklist: HashSet::new(),
            hci,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn AclObserver>) {
        self.observer = Some(observer);
    }

    pub fn conn(&self, bd_addr: BdAddr, transport: Transport) -> Option<&AclConn> {
        self.conns
            .iter()
            .find(|c| c.bd_addr == bd_addr && c.transport == transport)
    }

    fn index_by_addr(&self, bd_addr: BdAddr, transport: Transport) -> Option<usize> {
        self.conns
            .iter()
            .position(|c| c.bd_addr == bd_addr && c.transport == transport)
    }

    fn index_by_handle(&self, handle: u16) -> Option<usize> {
        self.conns.iter().position(|c| c.handle == handle)
    }

    pub fn device(&self, bd_addr: BdAddr) -> Option<&DeviceRecord> {
        self.devices.get(&bd_addr)
    }

    /// Records a peer known from inquiry or bonding
    pub fn add_device(&mut self, bd_addr: BdAddr, dev_class: DevClass) {
        self.devices.entry(bd_addr).or_default().dev_class = dev_class;
    }

    /// Security manager reports the link encryption state
    pub fn set_link_encrypted(&mut self, bd_addr: BdAddr, encrypted: bool) {
        self.devices.entry(bd_addr).or_default().encrypted = encrypted;
    }

    pub fn is_acl_up(&self, bd_addr: BdAddr, transport: Transport) -> bool {
        self.conn(bd_addr, transport).is_some()
    }

    pub fn num_acl_links(&self) -> usize {
        self.conns.len()
    }

    /// Current role on the BR/EDR link to `bd_addr`
    pub fn get_role(&self, bd_addr: BdAddr) -> Option<LinkRole> {
        self.conn(bd_addr, Transport::BrEdr).map(|c| c.role)
    }

    pub fn power_mode(&self, bd_addr: BdAddr) -> Option<PowerMode> {
        self.conn(bd_addr, Transport::BrEdr).map(|c| c.power_mode)
    }

    pub fn is_role_switch_blacklisted(&self, bd_addr: BdAddr) -> bool {
        self.role_switch_blacklist.contains(&bd_addr)
    }

    /// A link came up. A second report for the same peer only refreshes
    /// the entry.
    pub fn acl_created(
        &mut self,
        bd_addr: BdAddr,
        dev_class: Option<DevClass>,
        handle: u16,
        role: LinkRole,
        transport: Transport,
    ) {
        debug!(
            "ACL created: peer {} handle=0x{:04X} role={:?} transport={:?}",
            bd_addr, handle, role, transport
        );

        if let Some(idx) = self.index_by_addr(bd_addr, transport) {
            let conn = &mut self.conns[idx];
            conn.handle = handle;
            conn.role = role;
            debug!("Duplicate acl_created for {}", bd_addr);
            let policy = self.default_link_policy;
            self.set_link_policy(bd_addr, policy);
            return;
        }

        if self.conns.len() >= self.max_links {
            error!("ACL table full, dropping link to {}", bd_addr);
            return;
        }

        let mut conn = AclConn::new(bd_addr, handle, role, transport);
        if let Some(dev_class) = dev_class {
            self.devices.entry(bd_addr).or_default().dev_class = dev_class;
        }

        if transport.is_le() {
            self.conns.push(conn);
            if role == LinkRole::Master {
                self.hci.send_command(HciCommand::LeReadRemoteFeatures { handle });
            } else {
                self.establish_continue(handle);
            }
            return;
        }

        self.hci.send_command(HciCommand::ReadClockOffset { handle });
        self.hci
            .send_command(HciCommand::ReadRemoteVersionInformation { handle });

        // Features already known from an earlier connection
        let cached = self
            .devices
            .get(&bd_addr)
            .map(|d| d.feature_pages.clone())
            .filter(|pages| !pages.is_empty() && pages.len() <= NUM_FEATURE_PAGES);
        if let Some(pages) = cached {
            for (slot, page) in conn.feature_pages.iter_mut().zip(&pages) {
                *slot = *page;
            }
            conn.num_read_pages = pages.len() as u8;
            self.conns.push(conn);
            self.establish_continue(handle);
            return;
        }

        self.conns.push(conn);
        self.read_remote_features(handle);
    }

    pub fn acl_removed(&mut self, bd_addr: BdAddr, transport: Transport) {
        let Some(idx) = self.index_by_addr(bd_addr, transport) else {
            return;
        };
        let conn = self.conns.remove(idx);
        debug!("ACL removed: {} handle=0x{:04X}", bd_addr, conn.handle);

        // A switch on this link will never finish
        self.report_role_change(HCI_ERR_NO_CONNECTION, Some(bd_addr));

        if conn.link_up_issued {
            if let Some(observer) = self.observer.as_mut() {
                observer.link_down(bd_addr, conn.handle, transport);
            }
        }

        if let Some(dev) = self.devices.get_mut(&bd_addr) {
            dev.encrypted = false;
        }
    }

    /// Starts switching the BR/EDR link to `bd_addr` to `new_role`.
    /// `callback` hears the outcome once the switch resolves.
    pub fn switch_role(
        &mut self,
        bd_addr: BdAddr,
        new_role: LinkRole,
        callback: Option<SwitchRoleCallback>,
    ) -> BtmStatus {
        info!("switch_role: peer {} new_role={:?}", bd_addr, new_role);

        if !self.controller.supports_role_switch {
            return BtmStatus::ModeUnsupported;
        }
        if self.switch_role_req.is_some() && callback.is_some() {
            debug!("Role switch on another device is in progress");
            return BtmStatus::Busy;
        }

        let Some(idx) = self.index_by_addr(bd_addr, Transport::BrEdr) else {
            return BtmStatus::UnknownAddr;
        };
        if self.conns[idx].role == new_role {
            return BtmStatus::Success;
        }
        if self.role_switch_blacklist.contains(&bd_addr) {
            return BtmStatus::DevBlacklisted;
        }
        if self.conns[idx].switch_role_state != SwitchRoleState::Idle {
            debug!("switch_role busy: {:?}", self.conns[idx].switch_role_state);
            return BtmStatus::Busy;
        }

        let encrypted = self.devices.get(&bd_addr).map_or(false, |d| d.encrypted);
        let epr = self.epr_available(&self.conns[idx]);
        let conn = &mut self.conns[idx];
        let handle = conn.handle;

        match conn.power_mode {
            // Wake the link first
            PowerMode::Sniff | PowerMode::Park => {
                let command = if conn.power_mode == PowerMode::Sniff {
                    HciCommand::ExitSniffMode { handle }
                } else {
                    HciCommand::ExitParkState { handle }
                };
                conn.mode_change_pending = true;
                conn.switch_role_state = SwitchRoleState::ModeChange;
                self.hci.send_command(command);
            }
            // Some devices refuse to switch while encrypted
            _ if encrypted && !epr => {
                if conn.encrypt_state != EncryptState::EncryptOff {
                    conn.encrypt_state = EncryptState::EncryptOff;
                    self.hci.send_command(HciCommand::SetConnectionEncryption {
                        handle,
                        enable: false,
                    });
                }
                conn.switch_role_state = SwitchRoleState::EncryptionOff;
            }
            _ => {
                conn.switch_role_state = SwitchRoleState::InProgress;
                conn.rs_disc = RsDisc::RsPending;
                self.hci.send_command(HciCommand::SwitchRole {
                    bd_addr,
                    role: new_role,
                });
            }
        }

        if let Some(callback) = callback {
            self.switch_role_req = Some(SwitchRoleRequest {
                result: RoleSwitchResult {
                    bd_addr,
                    role: new_role,
                    hci_status: HCI_ERR_UNSUPPORTED_VALUE,
                },
                callback,
            });
        }
        BtmStatus::CmdStarted
    }

    /// Pause encryption is available on both ends
    fn epr_available(&self, conn: &AclConn) -> bool {
        self.controller.supports_encryption_pause
            && conn.feature_pages[0][LMP_PAUSE_ENCRYPTION_BYTE] & LMP_PAUSE_ENCRYPTION_MASK != 0
    }

    /// Picks a role switch up again once the link is active
    pub fn cont_rswitch(&mut self, handle: u16) {
        let Some(idx) = self.index_by_handle(handle) else {
            return;
        };
        if self.conns[idx].switch_role_state != SwitchRoleState::ModeChange {
            return;
        }

        let bd_addr = self.conns[idx].bd_addr;
        let encrypted = self.devices.get(&bd_addr).map_or(false, |d| d.encrypted);
        let epr = self.epr_available(&self.conns[idx]);
        let conn = &mut self.conns[idx];

        if encrypted && !epr {
            conn.encrypt_state = EncryptState::EncryptOff;
            conn.switch_role_state = SwitchRoleState::EncryptionOff;
            self.hci.send_command(HciCommand::SetConnectionEncryption {
                handle,
                enable: false,
            });
        } else {
            conn.switch_role_state = SwitchRoleState::InProgress;
            conn.rs_disc = RsDisc::RsPending;
            let role = conn.role.opposite();
            self.hci.send_command(HciCommand::SwitchRole { bd_addr, role });
        }
    }

    /// Mode change event from the controller
    pub fn power_mode_changed(&mut self, handle: u16, mode: PowerMode) {
        let Some(idx) = self.index_by_handle(handle) else {
            return;
        };
        let conn = &mut self.conns[idx];
        debug!("ACL 0x{:04X} power mode {:?} -> {:?}", handle, conn.power_mode, mode);
        conn.power_mode = mode;
        conn.mode_change_pending = false;

        if mode == PowerMode::Active {
            self.cont_rswitch(handle);
        }
    }

    /// Encryption change event. Drives the encryption half of a role
    /// switch.
    pub fn encrypt_change(&mut self, handle: u16, status: u8, enabled: bool) {
        debug!(
            "encrypt_change handle=0x{:04X} status=0x{:02X} enabled={}",
            handle, status, enabled
        );
        let Some(idx) = self.index_by_handle(handle) else {
            return;
        };

        let bd_addr = self.conns[idx].bd_addr;
        if status == HCI_SUCCESS {
            self.devices.entry(bd_addr).or_default().encrypted = enabled;
        }

        let conn = &mut self.conns[idx];
        match conn.switch_role_state {
            SwitchRoleState::EncryptionOff => {
                // Switch anyway, even if encryption stayed on
                if enabled {
                    conn.switch_role_state = SwitchRoleState::Idle;
                    conn.encrypt_state = EncryptState::Idle;
                } else {
                    conn.switch_role_state = SwitchRoleState::Switching;
                    conn.encrypt_state = EncryptState::TempFunc;
                }
                conn.rs_disc = RsDisc::RsPending;
                let role = conn.role.opposite();
                self.hci.send_command(HciCommand::SwitchRole { bd_addr, role });
            }
            SwitchRoleState::EncryptionOn => {
                conn.switch_role_state = SwitchRoleState::Idle;
                conn.encrypt_state = EncryptState::Idle;

                let (role, hci_status) = self
                    .switch_role_req
                    .as_ref()
                    .map_or((conn.role, status), |req| (req.result.role, req.result.hci_status));
                self.report_role_change(hci_status, Some(bd_addr));
                if let Some(observer) = self.observer.as_mut() {
                    observer.role_changed(bd_addr, role, hci_status);
                }
                self.issue_postponed_disconnect(idx);
            }
            _ => {}
        }
    }

    /// Role change event, or a failed switch role command status.
    /// `bd_addr` is `None` when the controller did not say which link.
    pub fn role_changed(&mut self, hci_status: u8, bd_addr: Option<BdAddr>, new_role: LinkRole) {
        let peer = bd_addr.or_else(|| self.switch_role_req.as_ref().map(|r| r.result.bd_addr));
        debug!(
            "role_changed: peer {:?} hci_status=0x{:02X} new_role={:?}",
            peer, hci_status, new_role
        );

        let Some(idx) = peer.and_then(|p| self.index_by_addr(p, Transport::BrEdr)) else {
            if hci_status != HCI_SUCCESS {
                self.report_role_change(hci_status, bd_addr);
            }
            return;
        };
        let peer = self.conns[idx].bd_addr;

        self.blacklist_role_change_device(peer, hci_status);

        if let Some(req) = self.switch_role_req.as_mut() {
            req.result.hci_status = hci_status;
        }
        let new_role = if hci_status == HCI_SUCCESS {
            if let Some(req) = self.switch_role_req.as_mut() {
                req.result.role = new_role;
                req.result.bd_addr = peer;
            }
            self.conns[idx].role = new_role;
            new_role
        } else {
            // Report the role we kept
            self.conns[idx].role
        };

        let conn = &mut self.conns[idx];
        if conn.switch_role_state == SwitchRoleState::Switching {
            conn.encrypt_state = EncryptState::EncryptOn;
            conn.switch_role_state = SwitchRoleState::EncryptionOn;
            let handle = conn.handle;
            self.hci.send_command(HciCommand::SetConnectionEncryption {
                handle,
                enable: true,
            });
            return;
        }

        if conn.switch_role_state == SwitchRoleState::InProgress {
            conn.switch_role_state = SwitchRoleState::Idle;
            conn.encrypt_state = EncryptState::Idle;
        }

        self.report_role_change(hci_status, bd_addr);
        if let Some(observer) = self.observer.as_mut() {
            observer.role_changed(peer, new_role, hci_status);
        }
        self.issue_postponed_disconnect(idx);
    }

    /// Hands the switch role result to its callback, if the callback is
    /// waiting on this peer
    fn report_role_change(&mut self, hci_status: u8, bd_addr: Option<BdAddr>) {
        let matches = match (&self.switch_role_req, bd_addr) {
            (Some(req), Some(bd_addr)) => req.result.bd_addr == bd_addr,
            _ => false,
        };
        if !matches {
            return;
        }
        if let Some(req) = self.switch_role_req.take() {
            let mut result = req.result;
            result.hci_status = hci_status;
            (req.callback)(result);
        }
    }

    fn issue_postponed_disconnect(&mut self, idx: usize) {
        let conn = &mut self.conns[idx];
        if conn.rs_disc == RsDisc::DiscPending {
            warn!("Issuing delayed HCI disconnect to {}", conn.bd_addr);
            let handle = conn.handle;
            self.hci.send_command(HciCommand::Disconnect {
                handle,
                reason: HCI_ERR_PEER_USER,
            });
        }
        self.conns[idx].rs_disc = RsDisc::NotPending;
    }

    /// Counts failed switches of audio devices; enough of them and the
    /// device is never asked to switch again
    pub fn blacklist_role_change_device(&mut self, bd_addr: BdAddr, hci_status: u8) {
        let Some(idx) = self.index_by_addr(bd_addr, Transport::BrEdr) else {
            return;
        };
        let Some(dev) = self.devices.get(&bd_addr) else {
            return;
        };
        let audio = dev.is_audio_device();

        let conn = &mut self.conns[idx];
        if hci_status == HCI_SUCCESS {
            conn.switch_role_failed_attempts = 0;
            return;
        }

        let switching = matches!(
            conn.switch_role_state,
            SwitchRoleState::Switching | SwitchRoleState::InProgress
        );
        if switching && audio && !self.role_switch_blacklist.contains(&bd_addr) {
            conn.switch_role_failed_attempts += 1;
            if conn.switch_role_failed_attempts == MAX_SW_ROLE_FAILED_ATTEMPTS {
                warn!(
                    "Device {} blacklisted for role switching - multiple role switch failed attempts: {}",
                    bd_addr, conn.switch_role_failed_attempts
                );
                self.role_switch_blacklist.insert(bd_addr);
            }
        }
    }

    /// Drops the link, waiting for a running role switch to end first
    pub fn remove_acl(&mut self, bd_addr: BdAddr, transport: Transport) -> BtmStatus {
        let Some(idx) = self.index_by_addr(bd_addr, transport) else {
            return BtmStatus::UnknownAddr;
        };
        let conn = &mut self.conns[idx];
        if conn.rs_disc == RsDisc::RsPending {
            conn.rs_disc = RsDisc::DiscPending;
            return BtmStatus::Success;
        }

        let handle = conn.handle;
        self.hci.send_command(HciCommand::Disconnect {
            handle,
            reason: HCI_ERR_PEER_USER,
        });
        BtmStatus::Success
    }

    fn read_remote_features(&mut self, handle: u16) {
        let Some(idx) = self.index_by_handle(handle) else {
            error!("read_remote_features handle=0x{:04X} invalid", handle);
            return;
        };
        let conn = &mut self.conns[idx];
        conn.num_read_pages = 0;
        conn.feature_pages = [[0; 8]; NUM_FEATURE_PAGES];

        // Page 0 first, it says whether extended pages exist
        self.hci
            .send_command(HciCommand::ReadRemoteSupportedFeatures { handle });
    }

    pub fn read_remote_features_complete(&mut self, status: u8, handle: u16, features: [u8; 8]) {
        let Some(idx) = self.index_by_handle(handle) else {
            error!("read_remote_features_complete handle=0x{:04X} invalid", handle);
            return;
        };
        if status != HCI_SUCCESS {
            error!(
                "read_remote_features_complete failed (status 0x{:02X}) for handle 0x{:04X}",
                status, handle
            );
            // Nothing worth caching; the link comes up without peer features
            self.conns[idx].num_read_pages = 0;
            self.establish_continue(handle);
            return;
        }
        self.conns[idx].feature_pages[0] = features;

        if features[LMP_EXTENDED_FEATURES_BYTE] & LMP_EXTENDED_FEATURES_MASK != 0
            && self.controller.supports_remote_ext_features
        {
            debug!("Start reading remote extended features");
            self.hci
                .send_command(HciCommand::ReadRemoteExtendedFeatures { handle, page: 1 });
            return;
        }

        self.process_remote_ext_features(idx, 1);
        self.establish_continue(handle);
    }

    /// One extended features page arrived; asks for the next or finishes
    /// discovery
    pub fn read_remote_ext_features_complete(&mut self, handle: u16, page: u8, max_page: u8, features: [u8; 8]) {
        let Some(idx) = self.index_by_handle(handle) else {
            error!("read_remote_ext_features_complete handle=0x{:04X} invalid", handle);
            return;
        };

        if max_page > HCI_EXT_FEATURES_PAGE_MAX || page > HCI_EXT_FEATURES_PAGE_MAX {
            error!(
                "read_remote_ext_features_complete page={} max_page={} unexpected",
                page, max_page
            );
            self.process_remote_ext_features(idx, 1);
            self.establish_continue(handle);
            return;
        }
        if page > max_page {
            warn!(
                "read_remote_ext_features_complete page={}, max_page={} invalid",
                page, max_page
            );
        }

        self.conns[idx].feature_pages[usize::from(page)] = features;

        if page < max_page && page < HCI_EXT_FEATURES_PAGE_MAX {
            debug!("Reading next remote extended features page ({})", page + 1);
            self.hci.send_command(HciCommand::ReadRemoteExtendedFeatures {
                handle,
                page: page + 1,
            });
            return;
        }

        debug!("Reached last remote extended features page ({})", page);
        self.process_remote_ext_features(idx, page + 1);
        self.establish_continue(handle);
    }

    /// Extended features could not be read: go on with page 0
    pub fn read_remote_ext_features_failed(&mut self, status: u8, handle: u16) {
        warn!(
            "read_remote_ext_features_failed (status 0x{:02X}) for handle 0x{:04X}",
            status, handle
        );
        let Some(idx) = self.index_by_handle(handle) else {
            error!("read_remote_ext_features_failed handle=0x{:04X} invalid", handle);
            return;
        };
        self.process_remote_ext_features(idx, 1);
        self.establish_continue(handle);
    }

    /// LE remote features arrived, or could not be read
    pub fn ble_read_remote_features_complete(&mut self, status: u8, handle: u16, features: [u8; 8]) {
        let Some(idx) = self.index_by_handle(handle) else {
            return;
        };
        if status != HCI_SUCCESS {
            warn!(
                "ble_read_remote_features_complete failed (status 0x{:02X}) for handle 0x{:04X}",
                status, handle
            );
            self.establish_continue(handle);
            return;
        }
        self.conns[idx].feature_pages[0] = features;
        self.conns[idx].num_read_pages = 1;
        self.establish_continue(handle);
    }

    fn process_remote_ext_features(&mut self, idx: usize, num_read_pages: u8) {
        let num_read_pages = num_read_pages.min(NUM_FEATURE_PAGES as u8);
        let conn = &mut self.conns[idx];
        conn.num_read_pages = num_read_pages;

        let pages = conn.feature_pages[..usize::from(num_read_pages)].to_vec();
        let bd_addr = conn.bd_addr;
        self.devices.entry(bd_addr).or_default().feature_pages = pages.clone();

        if let Some(observer) = self.observer.as_mut() {
            observer.remote_features_read(bd_addr, &pages);
        }
    }

    /// Last step of link setup: default packet types and policy, then the
    /// link is reported up. Runs once per link.
    pub fn establish_continue(&mut self, handle: u16) {
        let Some(idx) = self.index_by_handle(handle) else {
            return;
        };
        let (bd_addr, transport) = (self.conns[idx].bd_addr, self.conns[idx].transport);

        if !transport.is_le() {
            self.hci.send_command(HciCommand::ChangeConnectionPacketType {
                handle,
                packet_type: DEFAULT_ACL_PACKET_TYPES,
            });
            if !self.default_link_policy.is_empty() {
                let policy = self.default_link_policy;
                self.set_link_policy(bd_addr, policy);
            }
        }

        let conn = &mut self.conns[idx];
        if conn.link_up_issued {
            error!("establish_continue: link to {} is already up", bd_addr);
            return;
        }
        conn.link_up_issued = true;

        let features = conn.feature_pages[0];
        info!("ACL link up: {} handle=0x{:04X}", bd_addr, handle);
        if let Some(observer) = self.observer.as_mut() {
            observer.link_up(bd_addr, handle, transport, &features);
        }
    }

    /// Drops the policy bits the controller cannot do
    fn mask_link_policy(&self, mut settings: LinkPolicy) -> LinkPolicy {
        let unsupported = [
            (LinkPolicy::MASTER_SLAVE_SWITCH, self.controller.supports_role_switch),
            (LinkPolicy::HOLD_MODE, self.controller.supports_hold_mode),
            (LinkPolicy::SNIFF_MODE, self.controller.supports_sniff_mode),
            (LinkPolicy::PARK_MODE, self.controller.supports_park_mode),
        ];
        for (bit, supported) in unsupported {
            if settings.contains(bit) && !supported {
                settings.remove(bit);
                debug!("link policy {:?} not supported (settings: 0x{:04X})", bit, settings.bits());
            }
        }
        settings
    }

    pub fn set_link_policy(&mut self, bd_addr: BdAddr, settings: LinkPolicy) -> BtmStatus {
        let settings = self.mask_link_policy(settings);
        let Some(conn) = self.conn(bd_addr, Transport::BrEdr) else {
            return BtmStatus::UnknownAddr;
        };
        let handle = conn.handle;
        self.hci.send_command(HciCommand::WriteLinkPolicySettings {
            handle,
            settings: settings.bits(),
        });
        BtmStatus::CmdStarted
    }

    /// Policy applied to links created from now on
    pub fn set_default_link_policy(&mut self, settings: LinkPolicy) {
        let settings = self.mask_link_policy(settings);
        debug!("Set default link policy: 0x{:04X}", settings.bits());
        self.default_link_policy = settings;
        self.hci.send_command(HciCommand::WriteDefaultLinkPolicySettings {
            settings: settings.bits(),
        });
    }

    pub fn default_link_policy(&self) -> LinkPolicy {
        self.default_link_policy
    }

    /// Role switch support of the peer, as far as we know it
    pub fn peer_supports_role_switch(&self, bd_addr: BdAddr) -> bool {
        if !self.controller.supports_role_switch {
            return false;
        }
        let Some(dev) = self.devices.get(&bd_addr) else {
            return false;
        };
        match dev.feature_pages.first() {
            Some(page0) => page0[LMP_SWITCH_BYTE] & LMP_SWITCH_MASK != 0,
            // Features never read: assume it can
            None => true,
        }
    }

    fn set_power_mode_active(&mut self, bd_addr: BdAddr) {
        let Some(idx) = self.index_by_addr(bd_addr, Transport::BrEdr) else {
            return;
        };
        let conn = &mut self.conns[idx];
        if conn.mode_change_pending {
            return;
        }
        let handle = conn.handle;
        let command = match conn.power_mode {
            PowerMode::Sniff => HciCommand::ExitSniffMode { handle },
            PowerMode::Park => HciCommand::ExitParkState { handle },
            _ => return,
        };
        conn.mode_change_pending = true;
        self.hci.send_command(command);
    }
}

/// The ACL manager shared between the host event loop and the L2CAP engine
#[derive(Clone)]
pub struct SharedAclManager(Arc<Mutex<AclManager>>);

impl SharedAclManager {
    pub fn new(manager: AclManager) -> Self {
        Self(Arc::new(Mutex::new(manager)))
    }

    /// Observer and switch role callbacks run with this lock held and must
    /// not take it again
    pub fn lock(&self) -> MutexGuard<'_, AclManager> {
        self.0.lock()
    }
}

impl AclLink for SharedAclManager {
    fn acl_created(
        &mut self,
        bd_addr: BdAddr,
        dev_class: Option<DevClass>,
        handle: u16,
        role: LinkRole,
        transport: Transport,
    ) {
        self.lock().acl_created(bd_addr, dev_class, handle, role, transport);
    }

    fn acl_removed(&mut self, bd_addr: BdAddr, transport: Transport) {
        self.lock().acl_removed(bd_addr, transport);
    }

    fn set_power_mode_active(&mut self, bd_addr: BdAddr) {
        self.lock().set_power_mode_active(bd_addr);
    }

    fn power_mode_pending(&self, bd_addr: BdAddr) -> bool {
        self.lock()
            .conn(bd_addr, Transport::BrEdr)
            .map_or(false, |c| c.mode_change_pending)
    }

    fn switch_role(&mut self, bd_addr: BdAddr, role: LinkRole) -> BtmStatus {
        self.lock().switch_role(bd_addr, role, None)
    }

    fn peer_supports_role_switch(&self, bd_addr: BdAddr) -> bool {
        self.lock().peer_supports_role_switch(bd_addr)
    }
}
