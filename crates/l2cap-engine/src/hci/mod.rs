//! Bluetooth HCI (Host Controller Interface) framing
//!
//! Only the slice of HCI the link layer drives: the commands it issues to
//! the controller and the ACL data header it stamps on outbound PDUs.
//! Event parsing and the transport itself live outside this crate.

pub mod constants;
pub mod packet;


pub use packet::{AclHeader, AclPacket, HciCommand};

/// Sink for everything the host sends to the controller.
///
/// `send_acl` receives one stamped L2CAP PDU together with the number of
/// ACL fragments the link layer accounted for; the transport cuts the
/// payload into that many `acl_data_size` pieces, continuation flag set on
/// all but the first.
pub trait HciInterface: Send {
    fn send_command(&mut self, command: HciCommand);

    fn send_acl(&mut self, packet: AclPacket, num_segments: u16);
}
