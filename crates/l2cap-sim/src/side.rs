//! One simulated host: an L2CAP engine, its ACL manager and the
//! collaborators they drive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use l2cap_engine::acl::{AclManager, AclObserver, SharedAclManager};
use l2cap_engine::hci::{AclPacket, HciCommand, HciInterface};
use l2cap_engine::l2cap::constants::{
    L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE, L2CAP_MTU_SIZE, L2CAP_PKT_OVERHEAD,
};
use l2cap_engine::l2cap::{
    AccessRequest, BasicFcr, ChannelOwner, ChannelState, Collaborators, ConfigInfo, L2capManager,
    L2capResult, SecurityGate, SecurityLevel, SecurityStatus, TimerId, TimerService,
};
use l2cap_engine::{BdAddr, LinkRole, StackConfig, Transport};

/// Something a host hands its controller
#[derive(Debug)]
pub enum Wire {
    Command(HciCommand),
    Acl(AclPacket, u16),
}

pub type Outbox = Arc<Mutex<VecDeque<Wire>>>;

/// Simulated time in milliseconds, shared by both hosts
pub type Clock = Arc<Mutex<u64>>;

struct LoopbackHci(Outbox);

impl HciInterface for LoopbackHci {
    fn send_command(&mut self, command: HciCommand) {
        self.0.lock().push_back(Wire::Command(command));
    }

    fn send_acl(&mut self, packet: AclPacket, num_segments: u16) {
        self.0.lock().push_back(Wire::Acl(packet, num_segments));
    }
}

/// Grants every channel and tears links down through HCI
struct OpenSecurity(Outbox);

impl SecurityGate for OpenSecurity {
    fn access_req(&mut self, request: &AccessRequest) -> SecurityStatus {
        debug!(
            "access granted to {} for PSM 0x{:04X} ({:?})",
            request.bd_addr, request.psm, request.security_level
        );
        SecurityStatus::Success
    }

    fn abort_access_req(&mut self, _bd_addr: BdAddr) {}

    fn disconnect(&mut self, handle: u16, reason: u8) -> SecurityStatus {
        self.0
            .lock()
            .push_back(Wire::Command(HciCommand::Disconnect { handle, reason }));
        SecurityStatus::CmdStarted
    }
}

struct SimTimers {
    clock: Clock,
    deadlines: Arc<Mutex<HashMap<TimerId, u64>>>,
}

impl TimerService for SimTimers {
    fn arm(&mut self, id: TimerId, timeout_ms: u64) {
        let now = *self.clock.lock();
        self.deadlines.lock().insert(id, now + timeout_ms);
    }

    fn cancel(&mut self, id: TimerId) {
        self.deadlines.lock().remove(&id);
    }
}

/// Links the ACL manager finished setting up
struct LinkWatcher(Arc<Mutex<VecDeque<(BdAddr, Transport)>>>);

impl AclObserver for LinkWatcher {
    fn link_up(&mut self, bd_addr: BdAddr, _handle: u16, transport: Transport, _features: &[u8; 8]) {
        self.0.lock().push_back((bd_addr, transport));
    }

    fn role_changed(&mut self, bd_addr: BdAddr, new_role: LinkRole, hci_status: u8) {
        debug!("role towards {} now {:?} (status 0x{:02X})", bd_addr, new_role, hci_status);
    }
}

#[derive(Debug)]
enum OwnerEvent {
    ConnectInd { bd_addr: BdAddr, lcid: u16, identifier: u8, le: bool },
    ConnectCfm { lcid: u16, result: u16, le: bool },
    ConfigInd { lcid: u16 },
    ConfigCfm { lcid: u16, result: u16 },
    DisconnectInd { lcid: u16, ack_needed: bool },
    DisconnectCfm { lcid: u16, result: u16 },
    Data { lcid: u16, data: Vec<u8> },
}

/// Service owner that queues its callbacks; the host answers them once
/// the engine has returned
struct QueueingOwner {
    le: bool,
    events: Arc<Mutex<VecDeque<OwnerEvent>>>,
}

impl QueueingOwner {
    fn push(&self, event: OwnerEvent) {
        self.events.lock().push_back(event);
    }
}

impl ChannelOwner for QueueingOwner {
    fn connect_ind(&self, bd_addr: BdAddr, lcid: u16, _psm: u16, identifier: u8) {
        self.push(OwnerEvent::ConnectInd { bd_addr, lcid, identifier, le: self.le });
    }

    fn connect_cfm(&self, lcid: u16, result: u16) {
        self.push(OwnerEvent::ConnectCfm { lcid, result, le: self.le });
    }

    fn config_ind(&self, lcid: u16, _config: &ConfigInfo) {
        self.push(OwnerEvent::ConfigInd { lcid });
    }

    fn config_cfm(&self, lcid: u16, config: &ConfigInfo) {
        self.push(OwnerEvent::ConfigCfm { lcid, result: config.result });
    }

    fn disconnect_ind(&self, lcid: u16, ack_needed: bool) {
        self.push(OwnerEvent::DisconnectInd { lcid, ack_needed });
    }

    fn disconnect_cfm(&self, lcid: u16, result: u16) {
        self.push(OwnerEvent::DisconnectCfm { lcid, result });
    }

    fn data_ind(&self, lcid: u16, data: Vec<u8>) {
        self.push(OwnerEvent::Data { lcid, data });
    }

    fn congestion_status(&self, lcid: u16, congested: bool) {
        debug!("channel 0x{:04X} congested: {}", lcid, congested);
    }

    fn credits_received(&self, lcid: u16, credits: u16, credit_count: u16) {
        debug!("channel 0x{:04X} got {} credits, now {}", lcid, credits, credit_count);
    }
}

/// Per-host totals printed at the end of a run
#[derive(Debug, Default)]
pub struct Stats {
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub sdus_received: usize,
    pub bytes_received: usize,
}

pub struct Side {
    pub name: &'static str,
    pub addr: BdAddr,
    pub l2cap: L2capManager,
    pub acl: SharedAclManager,
    pub stats: Stats,
    outbox: Outbox,
    owner_events: Arc<Mutex<VecDeque<OwnerEvent>>>,
    links_up: Arc<Mutex<VecDeque<(BdAddr, Transport)>>>,
    deadlines: Arc<Mutex<HashMap<TimerId, u64>>>,
    opened: HashSet<u16>,
    /// Inbound ACL reassembly per handle
    rx: HashMap<u16, Vec<u8>>,
}

impl Side {
    pub fn new(name: &'static str, addr: BdAddr, config: &StackConfig, clock: Clock) -> Self {
        let outbox: Outbox = Arc::default();
        let links_up = Arc::default();
        let deadlines = Arc::default();

        let mut acl = AclManager::new(
            config.controller_info(),
            config.max_links,
            Box::new(LoopbackHci(outbox.clone())),
        );
        acl.set_observer(Box::new(LinkWatcher(Arc::clone(&links_up))));
        let acl = SharedAclManager::new(acl);

        let l2cap = L2capManager::new(
            config,
            Collaborators {
                hci: Box::new(LoopbackHci(outbox.clone())),
                security: Box::new(OpenSecurity(outbox.clone())),
                timers: Box::new(SimTimers {
                    clock,
                    deadlines: Arc::clone(&deadlines),
                }),
                acl: Box::new(acl.clone()),
                fcr: Box::new(BasicFcr),
            },
        );

        Self {
            name,
            addr,
            l2cap,
            acl,
            stats: Stats::default(),
            outbox,
            owner_events: Arc::default(),
            links_up,
            deadlines,
            opened: HashSet::new(),
            rx: HashMap::new(),
        }
    }

    pub fn register(&mut self, psm: u16, le_psm: u16) -> L2capResult<()> {
        let classic = Arc::new(QueueingOwner {
            le: false,
            events: Arc::clone(&self.owner_events),
        });
        let le = Arc::new(QueueingOwner {
            le: true,
            events: Arc::clone(&self.owner_events),
        });
        self.l2cap.register_psm(psm, classic, SecurityLevel::None, None)?;
        self.l2cap.register_le_psm(le_psm, le, SecurityLevel::None)?;
        Ok(())
    }

    pub fn take_outbox(&self) -> Vec<Wire> {
        self.outbox.lock().drain(..).collect()
    }

    /// Appends one fragment and returns the PDU once it is whole
    pub fn reassemble(&mut self, handle: u16, start: bool, fragment: &[u8]) -> Option<Vec<u8>> {
        let buf = self.rx.entry(handle).or_default();
        if start {
            if !buf.is_empty() {
                warn!("{}: dropping {} unfinished bytes on 0x{:04X}", self.name, buf.len(), handle);
            }
            buf.clear();
        } else if buf.is_empty() {
            warn!("{}: continuation without start on 0x{:04X}", self.name, handle);
            return None;
        }
        buf.extend_from_slice(fragment);

        let needed = match buf.get(..2) {
            Some(len) => usize::from(u16::from_le_bytes([len[0], len[1]])) + L2CAP_PKT_OVERHEAD,
            None => return None,
        };
        if buf.len() < needed {
            return None;
        }
        Some(std::mem::take(buf))
    }

    pub fn is_open(&self, lcid: u16) -> bool {
        self.l2cap
            .find_ccb_by_cid(None, lcid)
            .and_then(|ccb| self.l2cap.channel(ccb))
            .map_or(false, |chan| chan.state == ChannelState::Open)
    }

    pub fn next_deadline(&self) -> Option<(TimerId, u64)> {
        self.deadlines
            .lock()
            .iter()
            .min_by_key(|&(_, &at)| at)
            .map(|(&id, &at)| (id, at))
    }

    pub fn fire(&mut self, id: TimerId) {
        self.deadlines.lock().remove(&id);
        debug!("{}: timer {:?} expired", self.name, id);
        self.l2cap.timer_expired(id);
    }

    /// Answers whatever the engine and the ACL manager reported since the
    /// last call. Returns true if there was anything.
    pub fn react(&mut self) -> bool {
        let links: Vec<_> = self.links_up.lock().drain(..).collect();
        let events: Vec<_> = self.owner_events.lock().drain(..).collect();
        let progressed = !links.is_empty() || !events.is_empty();

        for (bd_addr, transport) in links {
            // A slave LE link is already up in L2CAP
            if transport.is_le() && self.le_role(bd_addr) == Some(LinkRole::Master) {
                self.l2cap.ble_link_up(bd_addr);
            }
        }
        for event in events {
            self.handle_owner_event(event);
        }
        progressed
    }

    fn le_role(&self, bd_addr: BdAddr) -> Option<LinkRole> {
        let lcb = self.l2cap.find_lcb_by_bd_addr(bd_addr, Transport::Le)?;
        self.l2cap.link(lcb).map(|link| link.role)
    }

    fn handle_owner_event(&mut self, event: OwnerEvent) {
        if let Err(e) = self.answer(event) {
            warn!("{}: {}", self.name, e);
        }
    }

    fn answer(&mut self, event: OwnerEvent) -> L2capResult<()> {
        let name = self.name;
        match event {
            OwnerEvent::ConnectInd { bd_addr, lcid, identifier, le } => {
                info!("{}: accepting channel 0x{:04X} from {}", name, lcid, bd_addr);
                self.l2cap
                    .connect_rsp(bd_addr, identifier, lcid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)?;
                if le {
                    self.note_open(lcid);
                } else {
                    self.l2cap.config_req(lcid, ConfigInfo::with_mtu(L2CAP_MTU_SIZE))?;
                }
            }
            OwnerEvent::ConnectCfm { lcid, result, le } => {
                if result != L2CAP_CONN_OK {
                    warn!("{}: channel 0x{:04X} refused: 0x{:04X}", name, lcid, result);
                } else if le {
                    self.note_open(lcid);
                } else {
                    self.l2cap.config_req(lcid, ConfigInfo::with_mtu(L2CAP_MTU_SIZE))?;
                }
            }
            OwnerEvent::ConfigInd { lcid } => {
                self.l2cap.config_rsp(lcid, ConfigInfo::default())?;
                self.note_open(lcid);
            }
            OwnerEvent::ConfigCfm { lcid, result } => {
                debug!("{}: our config on 0x{:04X} answered 0x{:04X}", name, lcid, result);
                self.note_open(lcid);
            }
            OwnerEvent::DisconnectInd { lcid, ack_needed } => {
                info!("{}: channel 0x{:04X} closed by peer", name, lcid);
                self.stats.channels_closed += 1;
                self.opened.remove(&lcid);
                if ack_needed {
                    self.l2cap.disconnect_rsp(lcid)?;
                }
            }
            OwnerEvent::DisconnectCfm { lcid, result } => {
                info!("{}: channel 0x{:04X} closed (0x{:04X})", name, lcid, result);
                self.stats.channels_closed += 1;
                self.opened.remove(&lcid);
            }
            OwnerEvent::Data { lcid, data } => {
                info!(
                    "{}: {} bytes on 0x{:04X}: {:?}",
                    name,
                    data.len(),
                    lcid,
                    String::from_utf8_lossy(&data)
                );
                self.stats.sdus_received += 1;
                self.stats.bytes_received += data.len();
            }
        }
        Ok(())
    }

    /// Counts a channel the first time it is seen open
    fn note_open(&mut self, lcid: u16) {
        if self.is_open(lcid) && self.opened.insert(lcid) {
            info!("{}: channel 0x{:04X} open", self.name, lcid);
            self.stats.channels_opened += 1;
        }
    }
}
