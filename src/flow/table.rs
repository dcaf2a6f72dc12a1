//! Sharded, concurrently updated flow table.
//!
//! ```text
//! observe(pkt)
//!   |-- shard = ahash(min(a, b), max(a, b), proto) % N
//!   |-- lock shard
//!   |     resolve forward key, else reverse key, else create
//!   |     lock record, fold packet into one direction
//!   |-- unlock shard
//!   |-- recompute features under the record lock
//!   |-- build snapshot, unlock record
//!   `-- return snapshot (caller enqueues it with no lock held)
//! ```
//!
//! A tuple and its reverse always hash to the same shard, so the forward /
//! reverse lookup and the insert happen in one critical section and two
//! packets of a brand-new flow can never create two records.

use super::{Direction, FlowKey, FlowRecord, FlowSnapshot};
use crate::protocol::DecodedPacket;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::Arc;

type Shard = Mutex<AHashMap<FlowKey, Arc<Mutex<FlowRecord>>>>;

pub struct FlowTable {
    shards: Box<[Shard]>,
}

impl FlowTable {
    /// Create a table with `shards` shards (0 = four per CPU).
    pub fn new(shards: usize) -> Self {
        let n = if shards == 0 {
            num_cpus::get() * 4
        } else {
            shards
        };
        let shards = (0..n.max(1))
            .map(|_| Mutex::new(AHashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        FlowTable { shards }
    }

    /// Fold a decoded packet into its flow and return the flow's updated
    /// snapshot.
    pub fn observe(&self, pkt: &DecodedPacket) -> FlowSnapshot {
        let key = FlowKey::from_packet(pkt);
        let shard = &self.shards[self.shard_index(&key)];

        let mut map = shard.lock();
        let (record, direction) = resolve(&mut map, key, pkt.ts_us);
        let mut flow = record.lock();
        flow.observe(direction, pkt);
        drop(map);

        flow.update_features(direction, pkt.ts_us);
        flow.snapshot()
    }

    /// Current snapshot of the flow created under `key` or its reverse.
    pub fn get(&self, key: &FlowKey) -> Option<FlowSnapshot> {
        let map = self.shards[self.shard_index(key)].lock();
        let record = map.get(key).or_else(|| map.get(&key.reversed()))?;
        let snapshot = record.lock().snapshot();
        Some(snapshot)
    }

    /// Remove flows whose last packet is more than `ttl_us` older than
    /// `now_us`. Returns how many were removed.
    pub fn evict_idle(&self, now_us: i64, ttl_us: i64) -> usize {
        let cutoff = now_us - ttl_us;
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, record| record.lock().end_us >= cutoff);
            removed += before - map.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every live flow, busiest first.
    pub fn snapshots(&self) -> Vec<FlowSnapshot> {
        let mut flows: Vec<FlowSnapshot> = Vec::new();
        for shard in self.shards.iter() {
            let map = shard.lock();
            flows.extend(map.values().map(|record| record.lock().snapshot()));
        }
        flows.sort_by(|a, b| {
            b.total_bytes()
                .cmp(&a.total_bytes())
                .then_with(|| a.flow_id.cmp(&b.flow_id))
        });
        flows
    }

    fn shard_index(&self, key: &FlowKey) -> usize {
        (canonical_hash(key) as usize) % self.shards.len()
    }
}

/// Look the packet's key up forward, then reversed, else insert a new record.
fn resolve(
    map: &mut AHashMap<FlowKey, Arc<Mutex<FlowRecord>>>,
    key: FlowKey,
    ts_us: i64,
) -> (Arc<Mutex<FlowRecord>>, Direction) {
    if let Some(record) = map.get(&key) {
        return (Arc::clone(record), Direction::Forward);
    }
    if let Some(record) = map.get(&key.reversed()) {
        return (Arc::clone(record), Direction::Backward);
    }
    let record = Arc::new(Mutex::new(FlowRecord::new(key, ts_us)));
    map.insert(key, Arc::clone(&record));
    (record, Direction::Forward)
}

/// Order-independent hash of the 5-tuple: both directions map to the same
/// value.
fn canonical_hash(key: &FlowKey) -> u64 {
    let a: (Ipv4Addr, u16) = (key.src_ip, key.src_port);
    let b: (Ipv4Addr, u16) = (key.dst_ip, key.dst_port);
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

    let mut hasher = ahash::AHasher::default();
    key.protocol.hash(&mut hasher);
    lo.hash(&mut hasher);
    hi.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{tcp::flags, IpProtocol, TcpFlags};
    use std::thread;

    fn pkt(
        ts_us: i64,
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        flag_bits: u8,
    ) -> DecodedPacket {
        DecodedPacket {
            ts_us,
            wire_len: 60,
            src_ip: Ipv4Addr::from(src),
            dst_ip: Ipv4Addr::from(dst),
            src_port: sport,
            dst_port: dport,
            protocol: IpProtocol::TCP,
            header_len: 20,
            flags: TcpFlags::from_bits(flag_bits),
        }
    }

    const CLIENT: [u8; 4] = [192, 168, 0, 10];
    const SERVER: [u8; 4] = [192, 168, 0, 1];

    #[test]
    fn swapped_tuple_is_backward_on_same_record() {
        let table = FlowTable::new(8);
        table.observe(&pkt(0, CLIENT, 5555, SERVER, 443, flags::SYN));
        let snap = table.observe(&pkt(10, SERVER, 443, CLIENT, 5555, flags::SYN | flags::ACK));

        assert_eq!(table.len(), 1);
        assert_eq!(snap.flow_id, "192.168.0.10-192.168.0.1-5555-443-6");
        assert_eq!(snap.fwd_packets, 1);
        assert_eq!(snap.bwd_packets, 1);
        assert_eq!(snap.bwd_flags.syn, 1);
        assert_eq!(snap.bwd_flags.ack, 1);
    }

    #[test]
    fn different_protocol_is_a_different_flow() {
        let table = FlowTable::new(4);
        table.observe(&pkt(0, CLIENT, 53, SERVER, 53, 0));
        let mut udp = pkt(1, SERVER, 53, CLIENT, 53, 0);
        udp.protocol = IpProtocol::UDP;
        let snap = table.observe(&udp);
        assert_eq!(table.len(), 2);
        assert_eq!(snap.fwd_packets, 1);
        assert_eq!(snap.bwd_packets, 0);
    }

    #[test]
    fn canonical_hash_ignores_direction() {
        let fwd = FlowKey::from_packet(&pkt(0, CLIENT, 1000, SERVER, 80, 0));
        assert_eq!(canonical_hash(&fwd), canonical_hash(&fwd.reversed()));
    }

    #[test]
    fn concurrent_first_packets_create_one_record() {
        let table = Arc::new(FlowTable::new(2));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for n in 0..100 {
                        let p = if i % 2 == 0 {
                            pkt(n, CLIENT, 7000, SERVER, 22, flags::ACK)
                        } else {
                            pkt(n, SERVER, 22, CLIENT, 7000, flags::ACK)
                        };
                        table.observe(&p);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.len(), 1);
        let snap = &table.snapshots()[0];
        assert_eq!(snap.total_packets(), 800);
        assert_eq!(snap.fwd_flags.ack + snap.bwd_flags.ack, 800);
    }

    #[test]
    fn idle_flows_are_evicted() {
        let table = FlowTable::new(4);
        table.observe(&pkt(1_000_000, CLIENT, 1, SERVER, 2, 0));
        table.observe(&pkt(50_000_000, CLIENT, 3, SERVER, 4, 0));

        assert_eq!(table.evict_idle(60_000_000, 30_000_000), 1);
        assert_eq!(table.len(), 1);
        let remaining = FlowKey::from_packet(&pkt(0, CLIENT, 3, SERVER, 4, 0));
        assert!(table.get(&remaining).is_some());
        assert!(table.get(&remaining.reversed()).is_some());
    }

    #[test]
    fn snapshots_are_busiest_first() {
        let table = FlowTable::new(4);
        table.observe(&pkt(0, CLIENT, 1, SERVER, 2, 0));
        for ts in 0..3 {
            table.observe(&pkt(ts, CLIENT, 9, SERVER, 9, 0));
        }
        let snaps = table.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].total_packets(), 3);
    }
}
