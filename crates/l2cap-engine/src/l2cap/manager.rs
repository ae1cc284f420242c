//! L2CAP manager
//!
//! The manager owns every link and channel control block and the shared
//! transmit pools. All entry points run on one logical context: the HCI
//! event handlers, the timer callbacks and the upper API all take
//! `&mut self`, so there is no locking inside the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use super::arena::Arena;
use super::ccb::{CcbHandle, ChannelControlBlock, ErtmInfo};
use super::interfaces::{AclLink, ChannelOwner, FcrHandler, SecurityGate, TimerService};
use super::lcb::{LcbHandle, LinkControlBlock};
use super::psm::DynamicPsmAllocator;
use super::types::SecurityLevel;
use crate::config::{ControllerInfo, StackConfig};
use crate::gap::{LinkRole, Transport};
use crate::hci::HciInterface;

/// A service registered on a PSM
#[derive(Clone)]
pub struct RegistrationRecord {
    pub psm: u16,
    pub owner: Arc<dyn ChannelOwner>,
    pub security_level: SecurityLevel,
    /// Retransmission modes offered on channels to this PSM
    pub ertm_info: ErtmInfo,
}

impl fmt::Debug for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRecord")
            .field("psm", &format_args!("0x{:04X}", self.psm))
            .field("security_level", &self.security_level)
            .field("ertm_info", &self.ertm_info)
            .finish()
    }
}

/// Controller buffer accounting for one transport.
///
/// `window` counts buffers the controller can still take. Links whose
/// quota is zero share `round_robin_quota` buffers between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmitPool {
    pub num_bufs: u16,
    pub window: u16,
    pub round_robin_quota: u16,
    pub round_robin_unacked: u16,
    pub check_round_robin: bool,
}

impl XmitPool {
    pub fn new(num_bufs: u16) -> Self {
        Self {
            num_bufs,
            window: num_bufs,
            ..Default::default()
        }
    }

    /// Round-robin links may send right now
    pub fn round_robin_open(&self) -> bool {
        self.window > 0 && self.round_robin_unacked < self.round_robin_quota
    }
}

/// Everything the engine drives outside itself
pub struct Collaborators {
    pub hci: Box<dyn HciInterface>,
    pub security: Box<dyn SecurityGate>,
    pub timers: Box<dyn TimerService>,
    pub acl: Box<dyn AclLink>,
    pub fcr: Box<dyn FcrHandler>,
}

/// L2CAP manager responsible for links, channels and flow control
pub struct L2capManager {
    pub(crate) controller: ControllerInfo,

    /// Physical links
    pub(crate) lcbs: Arena<LinkControlBlock>,
    /// Dynamic channels, the slot index gives the local CID
    pub(crate) ccbs: Arena<ChannelControlBlock>,

    /// Classic services by PSM
    pub(crate) rcbs: HashMap<u16, RegistrationRecord>,
    /// LE credit based services by LE PSM
    pub(crate) le_rcbs: HashMap<u16, RegistrationRecord>,
    pub(crate) max_clients: usize,
    pub(crate) psm_allocator: DynamicPsmAllocator,

    pub(crate) classic_pool: XmitPool,
    pub(crate) ble_pool: XmitPool,

    /// Role we ask for when accepting or creating links
    pub(crate) desired_role: LinkRole,
    /// Default idle timeout for new links, in seconds
    pub(crate) idle_timeout: u16,
    /// Refuse role switches while creating new links
    pub(crate) disallow_switch: bool,

    pub(crate) hci: Box<dyn HciInterface>,
    pub(crate) security: Box<dyn SecurityGate>,
    pub(crate) timers: Box<dyn TimerService>,
    pub(crate) acl: Box<dyn AclLink>,
    pub(crate) fcr: Box<dyn FcrHandler>,
}

impl fmt::Debug for L2capManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capManager")
            .field("links", &self.lcbs.len())
            .field("channels", &self.ccbs.len())
            .field("classic_pool", &self.classic_pool)
            .field("ble_pool", &self.ble_pool)
            .finish()
    }
}

impl L2capManager {
    pub fn new(config: &StackConfig, collaborators: Collaborators) -> Self {
        let controller = config.controller_info();
        info!(
            "L2CAP init: {} links, {} channels, {} ACL buffers of {} bytes",
            config.max_links, config.max_channels, controller.num_acl_bufs, controller.acl_data_size
        );

        Self {
            classic_pool: XmitPool::new(controller.num_acl_bufs),
            ble_pool: XmitPool::new(controller.num_ble_bufs),
            controller,
            lcbs: Arena::with_capacity(config.max_links),
            ccbs: Arena::with_capacity(config.max_channels),
            rcbs: HashMap::new(),
            le_rcbs: HashMap::new(),
            max_clients: config.max_clients,
            psm_allocator: DynamicPsmAllocator::default(),
            desired_role: config.desired_link_role,
            idle_timeout: config.idle_timeout_secs,
            disallow_switch: false,
            hci: collaborators.hci,
            security: collaborators.security,
            timers: collaborators.timers,
            acl: collaborators.acl,
            fcr: collaborators.fcr,
        }
    }

    pub fn controller(&self) -> &ControllerInfo {
        &self.controller
    }

    /// LE links draw from the classic pool when the controller has no
    /// dedicated LE buffers.
    pub(crate) fn uses_ble_pool(&self, transport: Transport) -> bool {
        transport.is_le() && !self.controller.ble_shares_acl_bufs()
    }

    pub(crate) fn pool(&self, transport: Transport) -> &XmitPool {
        if self.uses_ble_pool(transport) {
            &self.ble_pool
        } else {
            &self.classic_pool
        }
    }

    pub(crate) fn pool_mut(&mut self, transport: Transport) -> &mut XmitPool {
        if self.uses_ble_pool(transport) {
            &mut self.ble_pool
        } else {
            &mut self.classic_pool
        }
    }

    pub(crate) fn acl_data_size(&self, transport: Transport) -> u16 {
        if transport.is_le() {
            self.controller.ble_acl_data_size
        } else {
            self.controller.acl_data_size
        }
    }

    pub fn classic_pool(&self) -> &XmitPool {
        &self.classic_pool
    }

    pub fn ble_pool(&self) -> &XmitPool {
        &self.ble_pool
    }

    pub fn link(&self, lcb: LcbHandle) -> Option<&LinkControlBlock> {
        self.lcbs.get(lcb.0)
    }

    pub(crate) fn link_mut(&mut self, lcb: LcbHandle) -> Option<&mut LinkControlBlock> {
        self.lcbs.get_mut(lcb.0)
    }

    pub fn channel(&self, ccb: CcbHandle) -> Option<&ChannelControlBlock> {
        self.ccbs.get(ccb.0)
    }

    pub(crate) fn channel_mut(&mut self, ccb: CcbHandle) -> Option<&mut ChannelControlBlock> {
        self.ccbs.get_mut(ccb.0)
    }

    /// Every live link, in pool order
    pub fn links(&self) -> impl Iterator<Item = (LcbHandle, &LinkControlBlock)> {
        self.lcbs.iter().map(|(handle, lcb)| (LcbHandle(handle), lcb))
    }

    /// Channels of a link in service order
    pub(crate) fn link_ccbs(&self, lcb: LcbHandle) -> Vec<CcbHandle> {
        self.link(lcb).map(|l| l.ccbs.clone()).unwrap_or_default()
    }

    /// Stops accepting role switches on new outgoing links
    pub fn set_disallow_switch(&mut self, disallow: bool) {
        debug!("L2CAP disallow role switch: {}", disallow);
        self.disallow_switch = disallow;
    }

    pub fn set_desired_role(&mut self, role: LinkRole) {
        self.desired_role = role;
    }
}
