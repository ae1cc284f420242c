//! l2cap-engine - the L2CAP channel and link engine of a Bluetooth host stack
//!
//! This library multiplexes L2CAP channels onto ACL links: the per-channel
//! state machine, configuration negotiation, controller buffer sharing
//! between links, inbound signaling and the ACL manager that runs role
//! switches and remote feature discovery underneath.
//!
//! The engine is synchronous. The host feeds it HCI events, ACL data, timer
//! expiries and API calls from one context; it answers through the
//! collaborator traits in [`l2cap::interfaces`] and [`hci::HciInterface`].

pub mod acl;
pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod l2cap;

// Re-export common types for convenience
pub use acl::{AclManager, BtmStatus, SharedAclManager};
pub use config::StackConfig;
pub use error::StackError;
pub use gap::{BdAddr, LinkRole, Transport};
pub use hci::{HciCommand, HciInterface};
pub use l2cap::{ChannelOwner, Collaborators, L2capError, L2capManager};
