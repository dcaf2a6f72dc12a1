//! The per-source capture loop.

use super::{CaptureError, PacketSource, Polled};
use crate::flow::FlowTable;
use crate::pipeline::Ingestor;
use crate::protocol::decode_frame;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace};

/// Capture-time sweep cadence, in capture-clock microseconds.
const SWEEP_INTERVAL_US: i64 = 1_000_000;

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Stop after this many frames (0 = unlimited).
    pub count: u64,
    /// Evict flows idle longer than this, in microseconds (0 = never).
    pub idle_ttl_us: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub decoded: u64,
    pub discarded: u64,
    pub bytes: u64,
    pub evicted: u64,
}

impl CaptureStats {
    pub fn merge(&mut self, other: &CaptureStats) {
        self.frames += other.frames;
        self.decoded += other.decoded;
        self.discarded += other.discarded;
        self.bytes += other.bytes;
        self.evicted += other.evicted;
    }
}

/// Read `source` until it ends, `count` frames were read, or `running` is
/// cleared.
///
/// Each decoded frame is folded into `table`; the returned snapshot is
/// submitted to `ingestor` after the table has released every lock, so a
/// stalled pipeline only ever blocks this loop.
pub fn run_capture<P: PacketSource + ?Sized>(
    source: &mut P,
    table: &FlowTable,
    ingestor: &Ingestor,
    opts: &CaptureOptions,
    running: &AtomicBool,
) -> Result<CaptureStats, CaptureError> {
    let name = source.name().to_string();
    let mut stats = CaptureStats::default();
    let mut last_sweep: Option<i64> = None;

    info!(source = %name, count = opts.count, "capture started");

    while running.load(Ordering::SeqCst) {
        if opts.count > 0 && stats.frames >= opts.count {
            break;
        }

        let frame = match source.next_frame() {
            Ok(Polled::Frame(frame)) => frame,
            Ok(Polled::Idle) => continue,
            Ok(Polled::End) => break,
            Err(e) => {
                error!(source = %name, error = %e, "capture error");
                return Err(e);
            }
        };

        stats.frames += 1;
        stats.bytes += frame.wire_len as u64;
        let ts_us = frame.ts_us;

        match decode_frame(frame.data, frame.ts_us, frame.wire_len) {
            Some(pkt) => {
                stats.decoded += 1;
                let snapshot = table.observe(&pkt);
                ingestor.submit(snapshot);
            }
            None => {
                stats.discarded += 1;
                trace!(source = %name, len = frame.wire_len, "frame discarded");
            }
        }

        if opts.idle_ttl_us > 0 {
            let due = match last_sweep {
                Some(prev) => ts_us - prev >= SWEEP_INTERVAL_US,
                None => {
                    last_sweep = Some(ts_us);
                    false
                }
            };
            if due {
                last_sweep = Some(ts_us);
                let evicted = table.evict_idle(ts_us, opts.idle_ttl_us);
                stats.evicted += evicted as u64;
                if evicted > 0 {
                    debug!(source = %name, evicted, live = table.len(), "idle flows evicted");
                }
            }
        }
    }

    info!(
        source = %name,
        frames = stats.frames,
        decoded = stats.decoded,
        discarded = stats.discarded,
        "capture finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use crate::flow::{FlowKey, FlowSnapshot};
    use crate::pipeline::{self, IngestConfig};
    use crate::protocol::testutil::{tcp_frame, udp_frame};
    use crate::protocol::tcp::flags;
    use crate::store::{FlowSink, StoreError};
    use std::net::Ipv4Addr;

    struct VecSource {
        frames: Vec<(i64, Vec<u8>)>,
        pos: usize,
    }

    impl VecSource {
        fn new(frames: Vec<(i64, Vec<u8>)>) -> Self {
            VecSource { frames, pos: 0 }
        }
    }

    impl PacketSource for VecSource {
        fn next_frame(&mut self) -> Result<Polled<'_>, CaptureError> {
            let Some((ts_us, data)) = self.frames.get(self.pos) else {
                return Ok(Polled::End);
            };
            self.pos += 1;
            Ok(Polled::Frame(Frame {
                ts_us: *ts_us,
                wire_len: data.len() as u32,
                data: data.as_slice(),
            }))
        }

        fn name(&self) -> &str {
            "vec"
        }
    }

    struct NullSink;

    impl FlowSink for NullSink {
        fn write_batch(&mut self, batch: &[FlowSnapshot]) -> Result<usize, StoreError> {
            Ok(batch.len())
        }
    }

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn run(source: &mut VecSource, table: &FlowTable, opts: &CaptureOptions) -> CaptureStats {
        let pipeline = pipeline::spawn(
            &IngestConfig {
                workers: 1,
                ..IngestConfig::default()
            },
            |_| Ok(NullSink),
        )
        .unwrap();
        let ingestor = pipeline.ingestor();
        let running = AtomicBool::new(true);
        let stats = run_capture(source, table, &ingestor, opts, &running).unwrap();
        drop(ingestor);
        let ingest = pipeline.shutdown();
        assert_eq!(ingest.enqueued, stats.decoded);
        stats
    }

    #[test]
    fn handshake_and_acks_split_by_direction() {
        let mut arp = vec![0u8; 42];
        arp[12] = 0x08;
        arp[13] = 0x06;
        let mut source = VecSource::new(vec![
            (1_000, tcp_frame(CLIENT, SERVER, 40000, 80, flags::SYN, 0)),
            (2_000, tcp_frame(SERVER, CLIENT, 80, 40000, flags::ACK, 0)),
            (3_000, arp),
            (4_000, tcp_frame(CLIENT, SERVER, 40000, 80, flags::ACK, 100)),
            (5_000, tcp_frame(SERVER, CLIENT, 80, 40000, flags::ACK, 1200)),
            (6_000, tcp_frame(CLIENT, SERVER, 40000, 80, flags::ACK, 0)),
        ]);
        let table = FlowTable::new(4);
        let stats = run(&mut source, &table, &CaptureOptions::default());

        assert_eq!(stats.frames, 6);
        assert_eq!(stats.decoded, 5);
        assert_eq!(stats.discarded, 1);
        assert_eq!(table.len(), 1);

        let key = FlowKey {
            src_ip: Ipv4Addr::from(CLIENT),
            dst_ip: Ipv4Addr::from(SERVER),
            src_port: 40000,
            dst_port: 80,
            protocol: 6,
        };
        let snap = table.get(&key).unwrap();
        assert_eq!(snap.flow_id, "10.0.0.1-10.0.0.2-40000-80-6");
        assert_eq!(snap.fwd_packets, 3);
        assert_eq!(snap.bwd_packets, 2);
        assert_eq!(snap.fwd_flags.syn, 1);
        assert_eq!(snap.bwd_flags.syn, 0);
        assert_eq!(snap.fwd_flags.ack, 2);
        assert_eq!(snap.bwd_flags.ack, 2);
        assert_eq!(snap.fwd_bytes, 54 * 3 + 100);
        assert_eq!(snap.bwd_bytes, 54 * 2 + 1200);
        assert_eq!(snap.fwd_header_bytes, 60);
        assert_eq!(snap.duration_secs, 0.005);
    }

    #[test]
    fn count_limits_frames_read() {
        let frames = (0..10)
            .map(|i| (i * 10, udp_frame(CLIENT, SERVER, 5000, 53, 20)))
            .collect();
        let mut source = VecSource::new(frames);
        let table = FlowTable::new(2);
        let opts = CaptureOptions {
            count: 4,
            ..CaptureOptions::default()
        };
        let stats = run(&mut source, &table, &opts);
        assert_eq!(stats.frames, 4);
        assert_eq!(table.snapshots()[0].fwd_packets, 4);
    }

    #[test]
    fn idle_sweep_runs_on_capture_clock() {
        let mut source = VecSource::new(vec![
            (0, udp_frame(CLIENT, SERVER, 1, 53, 0)),
            (500_000, udp_frame(CLIENT, SERVER, 2, 53, 0)),
            (10_000_000, udp_frame(CLIENT, SERVER, 3, 53, 0)),
        ]);
        let table = FlowTable::new(2);
        let opts = CaptureOptions {
            count: 0,
            idle_ttl_us: 5_000_000,
        };
        let stats = run(&mut source, &table, &opts);
        assert_eq!(stats.evicted, 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn cleared_running_flag_reads_nothing() {
        let mut source = VecSource::new(vec![(0, udp_frame(CLIENT, SERVER, 1, 2, 0))]);
        let table = FlowTable::new(1);
        let pipeline = pipeline::spawn(
            &IngestConfig {
                workers: 1,
                ..IngestConfig::default()
            },
            |_| Ok(NullSink),
        )
        .unwrap();
        let ingestor = pipeline.ingestor();
        let running = AtomicBool::new(false);
        let stats = run_capture(
            &mut source,
            &table,
            &ingestor,
            &CaptureOptions::default(),
            &running,
        )
        .unwrap();
        drop(ingestor);
        pipeline.shutdown();
        assert_eq!(stats, CaptureStats::default());
        assert!(table.is_empty());
    }
}
