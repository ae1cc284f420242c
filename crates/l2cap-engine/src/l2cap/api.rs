//! Upper layer API
//!
//! What services call: registering PSMs, opening and closing channels,
//! answering the peer and writing data. Misuse (unknown CID, unregistered
//! PSM, no free slot) comes back as an [`L2capError`]; everything the peer
//! does arrives later through the owner's [`ChannelOwner`] callbacks.

use std::sync::Arc;

use log::{debug, info, warn};

use super::ccb::{CcbHandle, ErtmInfo};
use super::constants::*;
use super::csm::CsmEvent;
use super::interfaces::ChannelOwner;
use super::lcb::{LcbHandle, LinkState};
use super::manager::{L2capManager, RegistrationRecord};
use super::psm::{is_valid_classic_psm, is_valid_le_psm};
use super::types::*;
use crate::gap::{BdAddr, Transport};

impl L2capManager {
    /// Registers a classic service. Registering a PSM again replaces its
    /// owner.
    pub fn register_psm(
        &mut self,
        psm: u16,
        owner: Arc<dyn ChannelOwner>,
        security_level: SecurityLevel,
        ertm_info: Option<ErtmInfo>,
    ) -> L2capResult<u16> {
        if !is_valid_classic_psm(psm) {
            return Err(L2capError::InvalidParameter(format!("invalid PSM 0x{:04X}", psm)));
        }
        if !self.rcbs.contains_key(&psm) && self.rcbs.len() + self.le_rcbs.len() >= self.max_clients {
            warn!("L2CAP register: no free RCB for PSM 0x{:04X}", psm);
            return Err(L2capError::NoResources);
        }

        info!("L2CAP registered PSM 0x{:04X}", psm);
        self.rcbs.insert(
            psm,
            RegistrationRecord {
                psm,
                owner,
                security_level,
                ertm_info: ertm_info.unwrap_or_default(),
            },
        );
        Ok(psm)
    }

    /// Registers a service on the next free dynamic PSM
    pub fn register_dynamic_psm(
        &mut self,
        owner: Arc<dyn ChannelOwner>,
        security_level: SecurityLevel,
        ertm_info: Option<ErtmInfo>,
    ) -> L2capResult<u16> {
        let rcbs = &self.rcbs;
        let psm = self
            .psm_allocator
            .allocate(|value| rcbs.contains_key(&value))
            .ok_or(L2capError::NoResources)?;
        self.register_psm(psm, owner, security_level, ertm_info)
    }

    pub fn register_le_psm(
        &mut self,
        le_psm: u16,
        owner: Arc<dyn ChannelOwner>,
        security_level: SecurityLevel,
    ) -> L2capResult<u16> {
        if !is_valid_le_psm(le_psm) {
            return Err(L2capError::InvalidParameter(format!("invalid LE PSM 0x{:04X}", le_psm)));
        }
        if !self.le_rcbs.contains_key(&le_psm) && self.rcbs.len() + self.le_rcbs.len() >= self.max_clients {
            warn!("L2CAP register: no free RCB for LE PSM 0x{:04X}", le_psm);
            return Err(L2capError::NoResources);
        }

        info!("L2CAP registered LE PSM 0x{:04X}", le_psm);
        self.le_rcbs.insert(
            le_psm,
            RegistrationRecord {
                psm: le_psm,
                owner,
                security_level,
                ertm_info: ErtmInfo::default(),
            },
        );
        Ok(le_psm)
    }

    /// Removes a classic registration. Fails while any channel still uses
    /// the PSM.
    pub fn deregister_psm(&mut self, psm: u16) -> L2capResult<()> {
        self.deregister(psm, Transport::BrEdr)
    }

    pub fn deregister_le_psm(&mut self, le_psm: u16) -> L2capResult<()> {
        self.deregister(le_psm, Transport::Le)
    }

    fn deregister(&mut self, psm: u16, transport: Transport) -> L2capResult<()> {
        let table = if transport.is_le() { &self.le_rcbs } else { &self.rcbs };
        if !table.contains_key(&psm) {
            return Err(L2capError::PsmNotRegistered(psm));
        }

        let in_use = self.ccbs.iter().any(|(_, chan)| {
            chan.psm == psm
                && self
                    .link(chan.lcb)
                    .map_or(false, |l| l.transport.is_le() == transport.is_le())
        });
        if in_use {
            return Err(L2capError::PsmInUse(psm));
        }

        info!("L2CAP deregistered PSM 0x{:04X}", psm);
        if transport.is_le() {
            self.le_rcbs.remove(&psm);
        } else {
            self.rcbs.remove(&psm);
        }
        Ok(())
    }

    /// Opens a classic channel to `psm` on the peer, bringing the link up
    /// first if needed. Returns the local CID; the outcome arrives through
    /// `connect_cfm`.
    pub fn connect_req(&mut self, psm: u16, bd_addr: BdAddr, ertm_info: Option<ErtmInfo>) -> L2capResult<u16> {
        let rcb = self.rcbs.get(&psm).cloned().ok_or(L2capError::PsmNotRegistered(psm))?;
        let ertm_info = ertm_info.unwrap_or(rcb.ertm_info);

        let ccb = self.open_channel(bd_addr, Transport::BrEdr, rcb, |chan| {
            chan.ertm_info = ertm_info;
        })?;
        Ok(ccb.local_cid())
    }

    /// Opens an LE credit based channel. `local` is what we can receive:
    /// MTU, MPS and the credits handed to the peer up front.
    pub fn connect_le_req(
        &mut self,
        le_psm: u16,
        bd_addr: BdAddr,
        local: LeCreditBasedConfig,
    ) -> L2capResult<u16> {
        if local.mtu < L2CAP_LE_MIN_MTU || local.mps < L2CAP_LE_MIN_MPS || local.mps > L2CAP_LE_MAX_MPS {
            return Err(L2capError::InvalidParameter(format!(
                "LE mtu {} mps {} out of range",
                local.mtu, local.mps
            )));
        }
        let rcb = self
            .le_rcbs
            .get(&le_psm)
            .cloned()
            .ok_or(L2capError::PsmNotRegistered(le_psm))?;

        let ccb = self.open_channel(bd_addr, Transport::Le, rcb, |chan| {
            chan.local_conn_cfg = local;
        })?;
        Ok(ccb.local_cid())
    }

    fn open_channel(
        &mut self,
        bd_addr: BdAddr,
        transport: Transport,
        rcb: RegistrationRecord,
        setup: impl FnOnce(&mut super::ccb::ChannelControlBlock),
    ) -> L2capResult<CcbHandle> {
        debug!("L2CAP connect PSM 0x{:04X} to {} ({:?})", rcb.psm, bd_addr, transport);

        let (lcb, fresh) = match self.find_lcb_by_bd_addr(bd_addr, transport) {
            Some(lcb) => (lcb, false),
            None => {
                let lcb = self
                    .allocate_lcb(bd_addr, false, transport)
                    .ok_or(L2capError::NoResources)?;
                (lcb, true)
            }
        };

        let Some(ccb) = self.allocate_ccb(lcb) else {
            warn!("L2CAP connect: no CCB for {}", bd_addr);
            if fresh {
                self.release_lcb(lcb);
            }
            return Err(L2capError::NoResources);
        };

        if let Some(chan) = self.channel_mut(ccb) {
            chan.psm = rcb.psm;
            chan.owner = Some(rcb.owner);
            chan.security_level = rcb.security_level;
            setup(chan);
        }

        if fresh {
            if !self.create_conn(lcb) {
                warn!("L2CAP connect: could not create link to {}", bd_addr);
                self.release_lcb(lcb);
                return Err(L2capError::NoResources);
            }
            return Ok(ccb);
        }

        match self.link(lcb).map(|l| l.state) {
            Some(LinkState::Connected) => self.csm_execute(ccb, CsmEvent::L2caConnectReq),
            // Picked up once the old link is gone and a new one comes up
            Some(LinkState::Disconnecting) => {
                if let Some(link) = self.link_mut(lcb) {
                    link.pending_ccb = Some(ccb);
                }
            }
            // Connecting: LpConnectCfm starts the channel
            _ => {}
        }
        Ok(ccb)
    }

    /// Answers a `connect_ind`. OK and pending go ahead; any other result
    /// refuses the channel.
    pub fn connect_rsp(
        &mut self,
        bd_addr: BdAddr,
        identifier: u8,
        lcid: u16,
        result: u16,
        status: u16,
    ) -> L2capResult<()> {
        let ccb = self.find_ccb_by_cid(None, lcid).ok_or(L2capError::UnknownCid(lcid))?;
        let Some(chan) = self.channel(ccb) else {
            return Err(L2capError::UnknownCid(lcid));
        };
        if chan.remote_id != identifier {
            return Err(L2capError::InvalidParameter(format!(
                "identifier {} does not match {}",
                identifier, chan.remote_id
            )));
        }
        if self.link(chan.lcb).map(|l| l.bd_addr) != Some(bd_addr) {
            return Err(L2capError::InvalidParameter(format!("CID 0x{:04X} is not on {}", lcid, bd_addr)));
        }

        let event = if result == L2CAP_CONN_OK || result == L2CAP_CONN_PENDING {
            CsmEvent::L2caConnectRsp { result, status }
        } else {
            CsmEvent::L2caConnectRspNeg { result, status }
        };
        self.csm_execute(ccb, event);
        Ok(())
    }

    pub fn config_req(&mut self, lcid: u16, config: ConfigInfo) -> L2capResult<()> {
        let ccb = self.api_channel(lcid)?;
        if let Some(mtu) = config.mtu {
            if mtu < L2CAP_MIN_MTU {
                return Err(L2capError::InvalidParameter(format!("MTU {} below minimum", mtu)));
            }
        }
        self.csm_execute(ccb, CsmEvent::L2caConfigReq(config));
        Ok(())
    }

    pub fn config_rsp(&mut self, lcid: u16, config: ConfigInfo) -> L2capResult<()> {
        let ccb = self.api_channel(lcid)?;
        let event = if config.result == L2CAP_CFG_OK || config.result == L2CAP_CFG_PENDING {
            CsmEvent::L2caConfigRsp(config)
        } else {
            CsmEvent::L2caConfigRspNeg(config)
        };
        self.csm_execute(ccb, event);
        Ok(())
    }

    pub fn disconnect_req(&mut self, lcid: u16) -> L2capResult<()> {
        let ccb = self.api_channel(lcid)?;
        self.csm_execute(ccb, CsmEvent::L2caDisconnectReq);
        Ok(())
    }

    pub fn disconnect_rsp(&mut self, lcid: u16) -> L2capResult<()> {
        let ccb = self.api_channel(lcid)?;
        self.csm_execute(ccb, CsmEvent::L2caDisconnectRsp);
        Ok(())
    }

    /// Queues one SDU. A congested channel refuses new data until the
    /// owner hears `congestion_status(false)`.
    pub fn data_write(&mut self, lcid: u16, data: Vec<u8>) -> DataWriteStatus {
        let Some(ccb) = self.find_ccb_by_cid(None, lcid) else {
            warn!("L2CAP - no CCB for L2CA_DataWrite, CID: 0x{:04X} {} bytes", lcid, data.len());
            return DataWriteStatus::Failed;
        };
        let Some(chan) = self.channel(ccb) else {
            return DataWriteStatus::Failed;
        };
        let is_le = self.link(chan.lcb).map_or(false, |l| l.transport.is_le());

        let peer_mtu = if is_le { chan.peer_conn_cfg.mtu } else { chan.peer_mtu };
        if data.len() > usize::from(peer_mtu) {
            warn!(
                "L2CAP - CID: 0x{:04X} cannot send message bigger than peer's mtu size: len={} mtu={}",
                lcid,
                data.len(),
                peer_mtu
            );
            return DataWriteStatus::Failed;
        }

        if chan.cong_sent {
            debug!(
                "L2CAP - CID: 0x{:04X} cannot send, already congested xmit_hold_q.count: {} buff_quota: {}",
                lcid,
                chan.xmit_hold_q.len(),
                chan.buff_quota
            );
            return DataWriteStatus::Failed;
        }

        self.csm_execute(ccb, CsmEvent::L2caDataWrite(data));

        match self.channel(ccb) {
            Some(chan) if chan.cong_sent => DataWriteStatus::Congested,
            _ => DataWriteStatus::Success,
        }
    }

    /// Returns credits to the peer of an LE channel
    pub fn send_flow_control_credit(&mut self, lcid: u16, credits: u16) -> L2capResult<()> {
        let ccb = self.api_channel(lcid)?;
        self.csm_execute(ccb, CsmEvent::L2caSendFlowControlCredit(credits));
        Ok(())
    }

    /// Idle timeout in seconds. `global` sets the default for links created
    /// later; otherwise it applies to the link carrying `lcid`.
    pub fn set_idle_timeout(&mut self, lcid: u16, timeout_secs: u16, global: bool) -> L2capResult<()> {
        if global {
            self.idle_timeout = timeout_secs;
            return Ok(());
        }

        let ccb = self.api_channel(lcid)?;
        let lcb = self.channel(ccb).map(|c| c.lcb).ok_or(L2capError::UnknownCid(lcid))?;
        let link = self.link_mut(lcb).ok_or(L2capError::InvalidState)?;
        if !link.is_connected() {
            warn!("L2CAP set_idle_timeout on {} in {}", lcb, link.state);
            return Err(L2capError::InvalidState);
        }
        link.idle_timeout = timeout_secs;
        Ok(())
    }

    /// Idle timeout for the link to `bd_addr`
    pub fn set_idle_timeout_by_bd_addr(
        &mut self,
        bd_addr: BdAddr,
        timeout_secs: u16,
        transport: Transport,
    ) -> L2capResult<()> {
        let lcb = self
            .find_lcb_by_bd_addr(bd_addr, transport)
            .ok_or(L2capError::InvalidState)?;
        let link = self.link_mut(lcb).ok_or(L2capError::InvalidState)?;
        if !link.is_connected() {
            return Err(L2capError::InvalidState);
        }
        link.idle_timeout = timeout_secs;

        // Already idle: restart the countdown with the new value
        if link.ccbs.is_empty() {
            self.no_dynamic_ccbs(lcb);
        }
        Ok(())
    }

    /// Marks later SDUs of the channel flushable or not
    pub fn set_chnl_flushability(&mut self, lcid: u16, is_flushable: bool) -> L2capResult<()> {
        let ccb = self.api_channel(lcid)?;
        if let Some(chan) = self.channel_mut(ccb) {
            chan.is_flushable = is_flushable;
        }
        Ok(())
    }

    /// Peer extended features and fixed channel mask of a connected link
    pub fn peer_features(&self, bd_addr: BdAddr) -> Option<(u32, u64)> {
        let lcb: LcbHandle = self.find_lcb_by_bd_addr(bd_addr, Transport::BrEdr)?;
        let link = self.link(lcb)?;
        link.is_connected().then_some((link.peer_ext_fea, link.peer_chnl_mask))
    }

    fn api_channel(&self, lcid: u16) -> L2capResult<CcbHandle> {
        self.find_ccb_by_cid(None, lcid).ok_or_else(|| {
            warn!("L2CAP - no CCB for CID: 0x{:04X}", lcid);
            L2capError::UnknownCid(lcid)
        })
    }
}
