//! Bidirectional flow records and their snapshots.
//!
//! A flow is identified by the 5-tuple of the packet that created it. Later
//! packets matching that tuple are forward; packets matching its exact
//! reverse are backward. [`table::FlowTable`] decides which is which; this
//! module only holds the per-flow state.

pub mod export;
pub mod features;
pub mod table;

use crate::protocol::{DecodedPacket, TcpFlags};
use features::{ActiveIdleStats, BulkStats, LengthStats, SpanStats};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

pub use table::FlowTable;

/// The 5-tuple a flow was created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn from_packet(pkt: &DecodedPacket) -> Self {
        FlowKey {
            src_ip: pkt.src_ip,
            dst_ip: pkt.dst_ip,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
        }
    }

    /// The same tuple seen from the other end.
    pub fn reversed(&self) -> Self {
        FlowKey {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for FlowKey {
    /// `src-dst-sport-dport-proto`, the persisted `flow_id`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.src_ip, self.dst_ip, self.src_port, self.dst_port, self.protocol
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Backward => write!(f, "backward"),
        }
    }
}

/// Per-direction TCP control-flag tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpFlagCounts {
    pub fin: u64,
    pub syn: u64,
    pub rst: u64,
    pub psh: u64,
    pub ack: u64,
    pub urg: u64,
}

impl TcpFlagCounts {
    fn record(&mut self, flags: &TcpFlags) {
        self.fin += flags.fin as u64;
        self.syn += flags.syn as u64;
        self.rst += flags.rst as u64;
        self.psh += flags.psh as u64;
        self.ack += flags.ack as u64;
        self.urg += flags.urg as u64;
    }
}

/// One direction of a flow. The three sequences are index-aligned.
#[derive(Debug, Clone, Default)]
pub struct DirectionRecord {
    pub bytes: u64,
    pub packets: u64,
    pub header_bytes: u64,
    pub packet_lengths: Vec<u32>,
    pub timestamps: Vec<i64>,
    pub header_lengths: Vec<u16>,
    pub flags: TcpFlagCounts,
    pub bulk: BulkStats,
}

impl DirectionRecord {
    fn push(&mut self, pkt: &DecodedPacket) {
        self.bytes += pkt.wire_len as u64;
        self.packets += 1;
        self.header_bytes += pkt.header_len as u64;
        self.packet_lengths.push(pkt.wire_len);
        self.timestamps.push(pkt.ts_us);
        self.header_lengths.push(pkt.header_len);
        self.flags.record(&pkt.flags);
    }

    pub fn length_stats(&self) -> LengthStats {
        features::length_stats(&self.packet_lengths)
    }
}

/// Live state of one flow.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub start_us: i64,
    pub end_us: i64,
    pub forward: DirectionRecord,
    pub backward: DirectionRecord,
    /// Both directions' timestamps, ascending, ties in arrival order.
    merged: Vec<i64>,
    pub active_idle: ActiveIdleStats,
}

impl FlowRecord {
    pub fn new(key: FlowKey, ts_us: i64) -> Self {
        FlowRecord {
            key,
            start_us: ts_us,
            end_us: ts_us,
            forward: DirectionRecord::default(),
            backward: DirectionRecord::default(),
            merged: Vec::new(),
            active_idle: ActiveIdleStats::default(),
        }
    }

    pub fn direction(&self, direction: Direction) -> &DirectionRecord {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionRecord {
        match direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        }
    }

    /// Fold one packet into the given direction. Only raw counters and
    /// sequences are touched; see [`FlowRecord::update_features`].
    pub fn observe(&mut self, direction: Direction, pkt: &DecodedPacket) {
        self.direction_mut(direction).push(pkt);
        self.start_us = self.start_us.min(pkt.ts_us);
        self.end_us = self.end_us.max(pkt.ts_us);
    }

    /// Recompute derived statistics after a packet at `ts_us` was folded into
    /// `direction`.
    pub fn update_features(&mut self, direction: Direction, ts_us: i64) {
        features::insert_sorted(&mut self.merged, ts_us);
        let dir = self.direction_mut(direction);
        dir.bulk = features::bulk_stats(&dir.timestamps, &dir.packet_lengths);
        self.active_idle = features::active_idle(&self.merged);
    }

    pub fn total_packets(&self) -> u64 {
        self.forward.packets + self.backward.packets
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            flow_id: self.key.to_string(),
            src_ip: self.key.src_ip,
            dst_ip: self.key.dst_ip,
            src_port: self.key.src_port,
            dst_port: self.key.dst_port,
            protocol: self.key.protocol,
            start_time: self.start_us as f64 / 1e6,
            end_time: self.end_us as f64 / 1e6,
            duration_secs: (self.end_us - self.start_us) as f64 / 1e6,
            fwd_packets: self.forward.packets,
            bwd_packets: self.backward.packets,
            fwd_bytes: self.forward.bytes,
            bwd_bytes: self.backward.bytes,
            fwd_header_bytes: self.forward.header_bytes,
            bwd_header_bytes: self.backward.header_bytes,
            fwd_flags: self.forward.flags,
            bwd_flags: self.backward.flags,
            fwd_bulk: self.forward.bulk,
            bwd_bulk: self.backward.bulk,
            fwd_length: self.forward.length_stats(),
            bwd_length: self.backward.length_stats(),
            active: self.active_idle.active,
            idle: self.active_idle.idle,
        }
    }
}

/// Aggregate state of a flow at one point in time, as persisted and exported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub flow_id: String,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// Seconds since the Unix epoch.
    pub start_time: f64,
    pub end_time: f64,
    pub duration_secs: f64,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,
    pub fwd_header_bytes: u64,
    pub bwd_header_bytes: u64,
    pub fwd_flags: TcpFlagCounts,
    pub bwd_flags: TcpFlagCounts,
    pub fwd_bulk: BulkStats,
    pub bwd_bulk: BulkStats,
    pub fwd_length: LengthStats,
    pub bwd_length: LengthStats,
    pub active: SpanStats,
    pub idle: SpanStats,
}

impl FlowSnapshot {
    pub fn total_packets(&self) -> u64 {
        self.fwd_packets + self.bwd_packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd_bytes + self.bwd_bytes
    }
}
