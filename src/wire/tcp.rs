use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::ip::{checksum, Protocol};
use super::{Error, Ipv4Address, Result};
use crate::seq::SeqNumber;

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WINDOW: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
}

pub const HEADER_LEN: usize = field::URGENT.end;
pub const MIN_MSS_OPTION_LEN: usize = 4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
    }
}

/// A read/write wrapper around a TCP segment buffer.
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
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let header_len = self.header_len() as usize;
        if header_len < HEADER_LEN || header_len > len {
            return Err(Error);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    pub fn header_len(&self) -> u8 {
        (self.buffer.as_ref()[field::FLAGS.start] >> 4) * 4
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.buffer.as_ref()[field::FLAGS.start + 1])
    }

    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WINDOW])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// The one TCP option this stack parses: maximum segment size.
    pub fn mss_option(&self) -> Option<u16> {
        let data = self.buffer.as_ref();
        let header_len = self.header_len() as usize;
        let mut options = &data[HEADER_LEN..header_len];
        while !options.is_empty() {
            match options[0] {
                field::OPT_END => break,
                field::OPT_NOP => options = &options[1..],
                field::OPT_MSS if options.len() >= MIN_MSS_OPTION_LEN => {
                    return Some(NetworkEndian::read_u16(&options[2..4]));
                }
                _ if options.len() >= 2 => {
                    let len = options[1].max(2) as usize;
                    if len > options.len() {
                        break;
                    }
                    options = &options[len..];
                }
                _ => break,
            }
        }
        None
    }

    pub fn payload(&self) -> &[u8] {
        let header_len = self.header_len() as usize;
        &self.buffer.as_ref()[header_len..]
    }

    pub fn verify_checksum(&self, src_addr: Ipv4Address, dst_addr: Ipv4Address) -> bool {
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header_v4(&src_addr, &dst_addr, Protocol::Tcp, data.len() as u32),
            checksum::data(data),
        ]) == !0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value)
    }

    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value)
    }

    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0)
    }

    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0)
    }

    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::FLAGS.start] = ((value / 4) << 4) | (data[field::FLAGS.start] & 0x0f);
    }

    pub fn set_flags(&mut self, value: Flags) {
        self.buffer.as_mut()[field::FLAGS.start + 1] = value.bits();
    }

    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WINDOW], value)
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], value)
    }

    pub fn set_mss_option(&mut self, mss: u16) {
        let data = self.buffer.as_mut();
        data[HEADER_LEN] = field::OPT_MSS;
        data[HEADER_LEN + 1] = MIN_MSS_OPTION_LEN as u8;
        NetworkEndian::write_u16(&mut data[HEADER_LEN + 2..HEADER_LEN + 4], mss);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[header_len..]
    }

    pub fn fill_checksum(&mut self, src_addr: Ipv4Address, dst_addr: Ipv4Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header_v4(
                    &src_addr,
                    &dst_addr,
                    Protocol::Tcp,
                    data.len() as u32,
                ),
                checksum::data(data),
            ])
        };
        self.set_checksum(checksum);
    }
}

/// A high-level representation of a TCP segment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub flags: Flags,
    pub window_len: u16,
    /// Present only on SYN and SYN+ACK segments.
    pub max_seg_size: Option<u16>,
    pub payload_len: usize,
}

impl Repr {
    pub fn parse<T: AsRef<[u8]> + ?Sized>(
        packet: &Packet<&T>,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
    ) -> Result<Repr> {
        if packet.dst_port() == 0 {
            return Err(Error);
        }
        if !packet.verify_checksum(src_addr, dst_addr) {
            return Err(Error);
        }
        let flags = packet.flags();
        let ack_number = flags
            .contains(Flags::ACK)
            .then(|| packet.ack_number());
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number,
            flags,
            window_len: packet.window_len(),
            max_seg_size: packet.mss_option(),
            payload_len: packet.payload().len(),
        })
    }

    pub fn header_len(&self) -> usize {
        if self.max_seg_size.is_some() {
            HEADER_LEN + MIN_MSS_OPTION_LEN
        } else {
            HEADER_LEN
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        packet: &mut Packet<T>,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        emit_payload: impl FnOnce(&mut [u8]),
    ) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_header_len(self.header_len() as u8);
        packet.set_flags(self.flags);
        packet.set_window_len(self.window_len);
        packet.set_urgent_at(0);
        if let Some(mss) = self.max_seg_size {
            packet.set_mss_option(mss);
        }
        emit_payload(packet.payload_mut());
        packet.fill_checksum(src_addr, dst_addr);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={} ack={:?} flags={:?} win={} len={}",
            self.src_port,
            self.dst_port,
            self.seq_number,
            self.ack_number,
            self.flags,
            self.window_len,
            self.payload_len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_syn_with_mss() {
        let src = Ipv4Address::new([10, 0, 0, 1]);
        let dst = Ipv4Address::new([10, 0, 0, 2]);
        let repr = Repr {
            src_port: 49152,
            dst_port: 80,
            seq_number: SeqNumber(1000),
            ack_number: None,
            flags: Flags::SYN,
            window_len: 65535,
            max_seg_size: Some(1460),
            payload_len: 0,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet, src, dst, |_| {});

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.mss_option(), Some(1460));
        let parsed = Repr::parse(&packet, src, dst).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn round_trip_data_segment() {
        let src = Ipv4Address::new([10, 0, 0, 1]);
        let dst = Ipv4Address::new([10, 0, 0, 2]);
        let payload = b"hello";
        let repr = Repr {
            src_port: 1234,
            dst_port: 5678,
            seq_number: SeqNumber(u32::MAX - 2),
            ack_number: Some(SeqNumber(500)),
            flags: Flags::ACK | Flags::PSH,
            window_len: 4096,
            max_seg_size: None,
            payload_len: payload.len(),
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet, src, dst, |buf| buf.copy_from_slice(payload));

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.payload(), payload);
        assert_eq!(Repr::parse(&packet, src, dst).unwrap(), repr);
    }
}
