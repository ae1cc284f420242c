//! L2CAP (Logical Link Control and Adaptation Protocol) engine
//!
//! This module multiplexes logical channels onto ACL links:
//! - Link and channel control blocks and their registries
//! - The per-channel state machine and configuration negotiation
//! - Controller buffer sharing between links and channels
//! - Inbound signaling and the upper layer API

pub mod arena;
pub mod ccb;
pub mod constants;
pub mod interfaces;
pub mod lcb;
pub mod manager;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod types;

mod api;
mod cfg;
mod csm;
mod dispatch;
mod flow;
mod link;
mod peer;
mod registry;

#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::ccb::{CcbHandle, ChannelControlBlock, ErtmInfo};
pub use self::csm::CsmEvent;
pub use self::interfaces::{
    AccessRequest, AclLink, BasicFcr, ChannelOwner, FcrHandler, SecurityGate, SecurityStatus, TimerId,
    TimerService,
};
pub use self::lcb::{LcbHandle, LinkControlBlock, LinkState};
pub use self::manager::{Collaborators, L2capManager, RegistrationRecord, XmitPool};
pub use self::registry::L2CAP_NO_IDLE_TIMEOUT;
pub use self::signaling::SignalingMessage;
pub use self::types::*;
