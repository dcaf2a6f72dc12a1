//! Zero-copy Ethernet / IPv4 / TCP / UDP decoding.
//!
//! [`parse_packet`] gives a layered, borrowed view of a frame.
//! [`decode_frame`] reduces that view to the owned 5-tuple observation the
//! flow table consumes, or `None` for traffic that is not modelled.

pub mod ethernet;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use std::net::Ipv4Addr;

use thiserror::Error;

pub use tcp::TcpFlags;

/// EtherType constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Arp,
    VlanTagged,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x0806 => EtherType::Arp,
            0x8100 => EtherType::VlanTagged,
            other => EtherType::Unknown(other),
        }
    }
}

/// IANA protocol numbers carried in the IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            Self::TCP => IpProtocol::Tcp,
            Self::UDP => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

/// Errors from protocol parsing
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not enough bytes to parse the header
    #[error("packet too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    /// Invalid header values
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// A parsed frame, referencing the original byte slice
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub ethernet: ethernet::EthernetHeader<'a>,
    pub vlan: Option<VlanTag>,
    pub ipv4: Option<ipv4::Ipv4Header<'a>>,
    pub transport: Option<TransportHeader<'a>>,
}

/// VLAN tag (802.1Q)
#[derive(Debug, Clone, Copy)]
pub struct VlanTag {
    pub vlan_id: u16,
}

/// Transport layer header
#[derive(Debug)]
pub enum TransportHeader<'a> {
    Tcp(tcp::TcpHeader<'a>),
    Udp(udp::UdpHeader<'a>),
}

/// Parse a frame from raw bytes.
///
/// Only malformed Ethernet / VLAN / IPv4 headers are errors. Traffic that is
/// simply not IPv4, or whose transport is neither TCP nor UDP, parses with the
/// corresponding layer set to `None`.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    let eth = ethernet::EthernetHeader::parse(data)?;
    let mut remaining = eth.payload();
    let mut ether_type = eth.ether_type();
    let mut vlan = None;

    if ether_type == EtherType::VlanTagged {
        if remaining.len() < 4 {
            return Err(ParseError::TooShort {
                expected: 4,
                actual: remaining.len(),
            });
        }
        let tci = u16::from_be_bytes([remaining[0], remaining[1]]);
        vlan = Some(VlanTag {
            vlan_id: tci & 0x0FFF,
        });
        ether_type = EtherType::from(u16::from_be_bytes([remaining[2], remaining[3]]));
        remaining = &remaining[4..];
    }

    let ipv4 = match ether_type {
        EtherType::Ipv4 => Some(ipv4::Ipv4Header::parse(remaining)?),
        _ => None,
    };

    // Non-first fragments carry no transport header.
    let transport = match &ipv4 {
        Some(hdr) if hdr.fragment_offset() == 0 => {
            let l4 = hdr.payload();
            match hdr.protocol() {
                IpProtocol::Tcp => tcp::TcpHeader::parse(l4).ok().map(TransportHeader::Tcp),
                IpProtocol::Udp => udp::UdpHeader::parse(l4).ok().map(TransportHeader::Udp),
                IpProtocol::Other(_) => None,
            }
        }
        _ => None,
    };

    Ok(ParsedPacket {
        ethernet: eth,
        vlan,
        ipv4,
        transport,
    })
}

/// One decoded packet observation: the 5-tuple plus what the flow record
/// accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    /// Capture timestamp, microseconds since the Unix epoch.
    pub ts_us: i64,
    /// Total frame length on the wire.
    pub wire_len: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IANA protocol number, 6 or 17.
    pub protocol: u8,
    /// Transport header length in bytes (TCP data offset * 4, or 8 for UDP).
    pub header_len: u16,
    /// All false for UDP.
    pub flags: TcpFlags,
}

/// Decode a captured frame into a flow observation.
///
/// Returns `None` for anything that is not IPv4 carrying TCP or UDP,
/// including frames too short or malformed to parse.
pub fn decode_frame(data: &[u8], ts_us: i64, wire_len: u32) -> Option<DecodedPacket> {
    let parsed = parse_packet(data).ok()?;
    let ip = parsed.ipv4.as_ref()?;

    let (src_port, dst_port, protocol, header_len, flags) = match parsed.transport.as_ref()? {
        TransportHeader::Tcp(hdr) => (
            hdr.src_port(),
            hdr.dst_port(),
            IpProtocol::TCP,
            hdr.header_len() as u16,
            TcpFlags::from_header(hdr),
        ),
        TransportHeader::Udp(hdr) => (
            hdr.src_port(),
            hdr.dst_port(),
            IpProtocol::UDP,
            udp::UDP_HEADER_LEN as u16,
            TcpFlags::default(),
        ),
    };

    Some(DecodedPacket {
        ts_us,
        wire_len,
        src_ip: ip.src_addr(),
        dst_ip: ip.dst_addr(),
        src_port,
        dst_port,
        protocol,
        header_len,
        flags,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Frame builders shared by the tests of several modules.

    /// Ethernet + IPv4 + TCP frame with the given flags byte and payload size.
    pub fn tcp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        flags: u8,
        payload_len: usize,
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; 14 + 20 + 20 + payload_len];
        pkt[12] = 0x08;
        pkt[13] = 0x00;

        let ip_total = (20 + 20 + payload_len) as u16;
        let ip = &mut pkt[14..34];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&ip_total.to_be_bytes());
        ip[8] = 64;
        ip[9] = 6;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);

        let tcp = &mut pkt[34..54];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = flags;
        tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
        pkt
    }

    /// Ethernet + IPv4 + UDP frame.
    pub fn udp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload_len: usize,
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; 14 + 20 + 8 + payload_len];
        pkt[12] = 0x08;
        pkt[13] = 0x00;

        let ip_total = (20 + 8 + payload_len) as u16;
        let ip = &mut pkt[14..34];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&ip_total.to_be_bytes());
        ip[8] = 64;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);

        let udp = &mut pkt[34..42];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        pkt
    }
}
