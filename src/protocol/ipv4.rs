//! Zero-copy IPv4 header parser.
//!
//! Only the fields the flow decoder needs are exposed: addresses, protocol,
//! total length (to clamp the payload away from Ethernet padding) and the
//! fragment offset.

use super::{IpProtocol, ParseError};
use std::net::Ipv4Addr;

/// Minimum IPv4 header length (no options)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Zero-copy IPv4 header.
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    /// Parse an IPv4 header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: IPV4_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(ParseError::InvalidHeader(format!(
                "expected IPv4 (version 4), got version {}",
                version
            )));
        }

        let header_len = (data[0] & 0x0F) as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "IHL too small: {} bytes",
                header_len
            )));
        }
        if data.len() < header_len {
            return Err(ParseError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(Ipv4Header { data, header_len })
    }

    /// Header length in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Total length of the IP packet (header + payload) in bytes.
    #[inline]
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Fragment offset in 8-byte units.
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.data[6] & 0x1F, self.data[7]])
    }

    #[inline]
    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.data[9])
    }

    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    /// Payload after the IPv4 header, clamped to `total_length` so Ethernet
    /// trailer padding is never handed to the transport parser.
    ///
    /// A zero total length (segmentation offload on the capturing host) means
    /// the captured bytes are the whole datagram.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let end = match self.total_length() as usize {
            0 => self.data.len(),
            total => total.clamp(self.header_len, self.data.len()),
        };
        &self.data[self.header_len..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with_options() -> Vec<u8> {
        let mut pkt = vec![0u8; 24];
        pkt[0] = 0x46; // IHL=6, one word of options
        pkt[2..4].copy_from_slice(&34u16.to_be_bytes());
        pkt[8] = 32;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&[172, 16, 0, 9]);
        pkt[16..20].copy_from_slice(&[172, 16, 0, 10]);
        // 10 bytes of payload followed by 6 bytes of link-layer padding
        pkt.extend_from_slice(&[0xAA; 10]);
        pkt.extend_from_slice(&[0x00; 6]);
        pkt
    }

    #[test]
    fn parse_header_with_options() {
        let pkt = header_with_options();
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert_eq!(hdr.header_len(), 24);
        assert_eq!(hdr.protocol(), IpProtocol::Udp);
        assert_eq!(hdr.src_addr(), Ipv4Addr::new(172, 16, 0, 9));
        assert_eq!(hdr.dst_addr(), Ipv4Addr::new(172, 16, 0, 10));
        assert_eq!(hdr.fragment_offset(), 0);
    }

    #[test]
    fn payload_excludes_trailer_padding() {
        let pkt = header_with_options();
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert_eq!(hdr.payload().len(), 10);
        assert!(hdr.payload().iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn zero_total_length_uses_captured_bytes() {
        let mut pkt = header_with_options();
        pkt[2..4].copy_from_slice(&0u16.to_be_bytes());
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert_eq!(hdr.payload().len(), 16);
    }

    #[test]
    fn reject_short_and_wrong_version() {
        assert!(Ipv4Header::parse(&[0x45; 19]).is_err());
        let mut pkt = [0u8; 20];
        pkt[0] = 0x65;
        assert!(Ipv4Header::parse(&pkt).is_err());
        pkt[0] = 0x44; // IHL below minimum
        assert!(Ipv4Header::parse(&pkt).is_err());
    }
}
