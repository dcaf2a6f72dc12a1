//! Zero-copy TCP header parser.
//!
//! Byte 12 carries the data offset (upper nibble, in 32-bit words) and byte
//! 13 the control bits `CWR ECE URG ACK PSH RST SYN FIN`.

use super::ParseError;
use std::fmt;

/// Minimum TCP header length (no options)
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// TCP flags bitmask constants
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Zero-copy TCP header.
#[derive(Debug)]
pub struct TcpHeader<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    /// Parse a TCP header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: TCP_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let header_len = (data[12] >> 4) as usize * 4;
        if header_len < TCP_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "TCP data offset too small: {} bytes",
                header_len
            )));
        }
        if data.len() < header_len {
            return Err(ParseError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(TcpHeader { data, header_len })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Header length in bytes (data offset * 4).
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    #[inline]
    pub fn flags_raw(&self) -> u8 {
        self.data[13]
    }
}

/// The six control bits the flow record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_bits(bits: u8) -> Self {
        TcpFlags {
            fin: bits & flags::FIN != 0,
            syn: bits & flags::SYN != 0,
            rst: bits & flags::RST != 0,
            psh: bits & flags::PSH != 0,
            ack: bits & flags::ACK != 0,
            urg: bits & flags::URG != 0,
        }
    }

    pub fn from_header(header: &TcpHeader<'_>) -> Self {
        Self::from_bits(header.flags_raw())
    }
}

impl fmt::Display for TcpFlags {
    /// Formats as e.g. `[SYN, ACK]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.urg, "URG"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(", "))
    }
}
