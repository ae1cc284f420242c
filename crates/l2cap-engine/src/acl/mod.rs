//! ACL connection manager
//!
//! Keeps the table of ACL links below L2CAP and runs the procedures that
//! gate channel setup on them: remote feature discovery, role switches
//! (with the power mode and encryption dance some controllers need) and
//! link policy.

mod manager;

#[cfg(test)]
mod tests;

use std::fmt;

use bitflags::bitflags;

use crate::gap::{BdAddr, LinkRole, Transport};

pub use manager::{
    AclConn, AclManager, DeviceRecord, SharedAclManager, HCI_EXT_FEATURES_PAGE_MAX, MAX_SW_ROLE_FAILED_ATTEMPTS,
};

/// Status of an ACL manager request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtmStatus {
    Success,
    /// Command went to the controller, completion arrives as an event
    CmdStarted,
    Busy,
    NoResources,
    ModeUnsupported,
    IllegalValue,
    WrongMode,
    UnknownAddr,
    DevBlacklisted,
}

impl fmt::Display for BtmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::CmdStarted => "CMD_STARTED",
            Self::Busy => "BUSY",
            Self::NoResources => "NO_RESOURCES",
            Self::ModeUnsupported => "MODE_UNSUPPORTED",
            Self::IllegalValue => "ILLEGAL_VALUE",
            Self::WrongMode => "WRONG_MODE",
            Self::UnknownAddr => "UNKNOWN_ADDR",
            Self::DevBlacklisted => "DEV_BLACKLISTED",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// HCI link policy settings
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkPolicy: u16 {
        const MASTER_SLAVE_SWITCH = 0x0001;
        const HOLD_MODE = 0x0002;
        const SNIFF_MODE = 0x0004;
        const PARK_MODE = 0x0008;
    }
}

/// Progress of a role switch on one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchRoleState {
    #[default]
    Idle,
    /// Waiting for the link to leave sniff or park
    ModeChange,
    /// Waiting for encryption to go off before switching
    EncryptionOff,
    /// Switch running, nothing to restore afterwards
    InProgress,
    /// Switch running, encryption goes back on afterwards
    Switching,
    /// Waiting for encryption to come back on
    EncryptionOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptState {
    #[default]
    Idle,
    EncryptOff,
    /// Encryption is temporarily off for a role switch
    TempFunc,
    EncryptOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Active,
    Hold,
    Sniff,
    Park,
}

/// Outcome handed to the switch role completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSwitchResult {
    pub bd_addr: BdAddr,
    pub role: LinkRole,
    pub hci_status: u8,
}

pub type SwitchRoleCallback = Box<dyn FnOnce(RoleSwitchResult) + Send>;

/// Link level news for whoever sits above the ACL manager
#[allow(unused_variables)]
pub trait AclObserver: Send {
    /// Feature discovery finished and the link is usable
    fn link_up(&mut self, bd_addr: BdAddr, handle: u16, transport: Transport, features: &[u8; 8]) {}

    fn link_down(&mut self, bd_addr: BdAddr, handle: u16, transport: Transport) {}

    fn role_changed(&mut self, bd_addr: BdAddr, new_role: LinkRole, hci_status: u8) {}

    /// Remote feature pages are known; security requests parked on them
    /// can go ahead
    fn remote_features_read(&mut self, bd_addr: BdAddr, pages: &[[u8; 8]]) {}
}
