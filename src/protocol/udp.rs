//! Zero-copy UDP header parser. The header is a fixed 8 bytes:
//! source port, destination port, length, checksum.

use super::ParseError;

/// UDP header is always exactly 8 bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// Zero-copy UDP header.
#[derive(Debug)]
pub struct UdpHeader<'a> {
    data: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(UdpHeader { data })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Datagram length (header + payload) as declared in the header.
    #[inline]
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }
}
