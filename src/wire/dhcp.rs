//! BOOTP/DHCP (RFC 2131) packet codec.
//!
//! This is codec-only: encode and decode a DHCP message. No DORA state
//! machine, lease table, or client/server role lives here.

use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, EthernetAddress, Ipv4Address, Result};

mod field {
    use crate::wire::field::*;

    pub const OP: usize = 0;
    pub const HTYPE: usize = 1;
    pub const HLEN: usize = 2;
    pub const HOPS: usize = 3;
    pub const XID: Field = 4..8;
    pub const SECS: Field = 8..10;
    pub const FLAGS: Field = 10..12;
    pub const CIADDR: Field = 12..16;
    pub const YIADDR: Field = 16..20;
    pub const SIADDR: Field = 20..24;
    pub const GIADDR: Field = 24..28;
    pub const CHADDR: Field = 28..44;
    pub const SNAME: Field = 44..108;
    pub const FILE: Field = 108..236;
    pub const MAGIC_COOKIE: Field = 236..240;
    pub const OPTIONS: Rest = 240..;
}

pub const HEADER_LEN: usize = field::OPTIONS.start;
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const OPT_END: u8 = 255;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_PARAMETER_REQUEST_LIST: u8 = 55;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

enum_with_unknown! {
    pub enum MessageType(u8) {
        Discover = 1,
        Offer    = 2,
        Request  = 3,
        Decline  = 4,
        Ack      = 5,
        Nak      = 6,
        Release  = 7,
        Inform   = 8
    }
}

/// A read/write wrapper around a BOOTP/DHCP message buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let data = self.buffer.as_ref();
        if data.len() < HEADER_LEN {
            return Err(Error);
        }
        if data[field::MAGIC_COOKIE] != MAGIC_COOKIE {
            return Err(Error);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn is_reply(&self) -> bool {
        self.buffer.as_ref()[field::OP] == BOOTREPLY
    }

    pub fn transaction_id(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::XID])
    }

    pub fn client_hardware_addr(&self) -> EthernetAddress {
        EthernetAddress::from_bytes(&self.buffer.as_ref()[field::CHADDR][..6])
    }

    pub fn client_ip(&self) -> Ipv4Address {
        Ipv4Address::from_bytes(&self.buffer.as_ref()[field::CIADDR])
    }

    pub fn your_ip(&self) -> Ipv4Address {
        Ipv4Address::from_bytes(&self.buffer.as_ref()[field::YIADDR])
    }

    pub fn server_ip(&self) -> Ipv4Address {
        Ipv4Address::from_bytes(&self.buffer.as_ref()[field::SIADDR])
    }

    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[field::OPTIONS]
    }

    /// Find a DHCP option by kind, returning its value bytes.
    pub fn option(&self, kind: u8) -> Option<&[u8]> {
        let mut options = self.options();
        while let Some(&opt_kind) = options.first() {
            if opt_kind == OPT_END {
                break;
            }
            if options.len() < 2 {
                break;
            }
            let len = options[1] as usize;
            if options.len() < 2 + len {
                break;
            }
            let value = &options[2..2 + len];
            if opt_kind == kind {
                return Some(value);
            }
            options = &options[2 + len..];
        }
        None
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(OPT_MESSAGE_TYPE)
            .and_then(|v| v.first())
            .map(|&b| MessageType::from(b))
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_is_reply(&mut self, value: bool) {
        self.buffer.as_mut()[field::OP] = if value { BOOTREPLY } else { BOOTREQUEST };
    }

    pub fn set_hardware_type_ethernet(&mut self) {
        let data = self.buffer.as_mut();
        data[field::HTYPE] = 1;
        data[field::HLEN] = 6;
        data[field::HOPS] = 0;
    }

    pub fn set_transaction_id(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::XID], value);
    }

    pub fn set_client_hardware_addr(&mut self, value: EthernetAddress) {
        let data = self.buffer.as_mut();
        data[field::CHADDR].fill(0);
        data[field::CHADDR.start..field::CHADDR.start + 6].copy_from_slice(value.as_bytes());
    }

    pub fn set_client_ip(&mut self, value: Ipv4Address) {
        self.buffer.as_mut()[field::CIADDR].copy_from_slice(value.as_bytes());
    }

    pub fn set_your_ip(&mut self, value: Ipv4Address) {
        self.buffer.as_mut()[field::YIADDR].copy_from_slice(value.as_bytes());
    }

    pub fn set_server_ip(&mut self, value: Ipv4Address) {
        self.buffer.as_mut()[field::SIADDR].copy_from_slice(value.as_bytes());
    }

    pub fn set_magic_cookie(&mut self) {
        self.buffer.as_mut()[field::MAGIC_COOKIE].copy_from_slice(&MAGIC_COOKIE);
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[field::OPTIONS]
    }
}

/// A high-level representation of a DHCP message, restricted to the fields
/// and options this stack needs to originate or recognize.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Repr {
    pub message_type: MessageType,
    pub transaction_id: u32,
    pub client_hardware_addr: EthernetAddress,
    pub client_ip: Ipv4Address,
    pub your_ip: Ipv4Address,
    pub server_ip: Ipv4Address,
    pub parameter_request_list: Vec<u8>,
}

impl Repr {
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&T>) -> Result<Repr> {
        let message_type = packet.message_type().ok_or(Error)?;
        Ok(Repr {
            message_type,
            transaction_id: packet.transaction_id(),
            client_hardware_addr: packet.client_hardware_addr(),
            client_ip: packet.client_ip(),
            your_ip: packet.your_ip(),
            server_ip: packet.server_ip(),
            parameter_request_list: packet
                .option(OPT_PARAMETER_REQUEST_LIST)
                .map(|v| v.to_vec())
                .unwrap_or_default(),
        })
    }

    pub fn buffer_len(&self) -> usize {
        // header + message-type option (3) + optional PRL option + end (1)
        let prl_len = if self.parameter_request_list.is_empty() {
            0
        } else {
            2 + self.parameter_request_list.len()
        };
        HEADER_LEN + 3 + prl_len + 1
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_is_reply(matches!(
            self.message_type,
            MessageType::Offer | MessageType::Ack | MessageType::Nak
        ));
        packet.set_hardware_type_ethernet();
        packet.set_transaction_id(self.transaction_id);
        packet.set_client_hardware_addr(self.client_hardware_addr);
        packet.set_client_ip(self.client_ip);
        packet.set_your_ip(self.your_ip);
        packet.set_server_ip(self.server_ip);
        packet.set_magic_cookie();

        let options = packet.options_mut();
        let mut pos = 0;
        options[pos] = OPT_MESSAGE_TYPE;
        options[pos + 1] = 1;
        options[pos + 2] = self.message_type.into();
        pos += 3;

        if !self.parameter_request_list.is_empty() {
            options[pos] = OPT_PARAMETER_REQUEST_LIST;
            options[pos + 1] = self.parameter_request_list.len() as u8;
            let start = pos + 2;
            options[start..start + self.parameter_request_list.len()]
                .copy_from_slice(&self.parameter_request_list);
            pos = start + self.parameter_request_list.len();
        }

        options[pos] = OPT_END;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_discover() {
        let repr = Repr {
            message_type: MessageType::Discover,
            transaction_id: 0xdead_beef,
            client_hardware_addr: EthernetAddress::new([0x02, 0, 0, 0, 0, 7]),
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip: Ipv4Address::UNSPECIFIED,
            server_ip: Ipv4Address::UNSPECIFIED,
            parameter_request_list: vec![1, 3, 6],
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet);

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert!(!packet.is_reply());
        assert_eq!(Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn rejects_missing_magic_cookie() {
        let buffer = vec![0u8; HEADER_LEN];
        assert_eq!(Packet::new_checked(&buffer[..]), Err(Error));
    }
}
