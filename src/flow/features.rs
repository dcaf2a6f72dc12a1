//! Derived per-flow statistics.
//!
//! Everything here is a pure function over the sequences a [`FlowRecord`]
//! accumulates. Timestamps are integer microseconds so the 1 ms bulk boundary
//! compares exactly; durations come out as `f64` seconds.
//!
//! [`FlowRecord`]: super::FlowRecord

use serde::Serialize;

/// Largest inter-arrival gap that keeps a bulk run going.
pub const BULK_MAX_GAP_US: i64 = 1_000;
/// Shortest run that counts as a bulk.
pub const BULK_MIN_PACKETS: usize = 4;
/// Gaps strictly longer than this split active spans.
pub const IDLE_THRESHOLD_US: i64 = 1_000_000;

const MICROS_PER_SEC: f64 = 1_000_000.0;

#[inline]
fn secs(us: i64) -> f64 {
    us as f64 / MICROS_PER_SEC
}

/// Bulk-transfer summary for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BulkStats {
    pub bulk_count: u64,
    pub avg_bytes_per_bulk: f64,
    pub avg_packets_per_bulk: f64,
    /// Bulk bytes per second of bulk time.
    pub bulk_rate: f64,
}

/// Mean, population standard deviation, max and min of a set of durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpanStats {
    pub mean: f64,
    pub std: f64,
    pub max: f64,
    pub min: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ActiveIdleStats {
    pub active: SpanStats,
    pub idle: SpanStats,
}

/// Packet-length summary for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LengthStats {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
    pub std: f64,
}

#[derive(Default)]
struct BulkTotals {
    count: u64,
    packets: u64,
    bytes: u64,
    duration_us: i64,
}

impl BulkTotals {
    /// Account the run `first..=last` if it is long enough.
    fn close_run(&mut self, timestamps: &[i64], lengths: &[u32], first: usize, last: usize) {
        let n = last - first + 1;
        if n < BULK_MIN_PACKETS {
            return;
        }
        self.count += 1;
        self.packets += n as u64;
        self.bytes += lengths[first..=last].iter().map(|l| *l as u64).sum::<u64>();
        self.duration_us += timestamps[last] - timestamps[first];
    }
}

/// Detect bulks in one direction's index-aligned timestamp and length
/// sequences.
///
/// A bulk is a maximal run of packets whose consecutive gaps are all at most
/// [`BULK_MAX_GAP_US`], containing at least [`BULK_MIN_PACKETS`] packets.
pub fn bulk_stats(timestamps: &[i64], lengths: &[u32]) -> BulkStats {
    debug_assert_eq!(timestamps.len(), lengths.len());
    let mut totals = BulkTotals::default();
    let mut run_start: Option<usize> = None;

    for i in 1..timestamps.len() {
        if timestamps[i] - timestamps[i - 1] <= BULK_MAX_GAP_US {
            run_start.get_or_insert(i - 1);
        } else if let Some(first) = run_start.take() {
            totals.close_run(timestamps, lengths, first, i - 1);
        }
    }
    if let Some(first) = run_start {
        totals.close_run(timestamps, lengths, first, timestamps.len() - 1);
    }

    if totals.count == 0 {
        return BulkStats::default();
    }
    let count = totals.count as f64;
    let bulk_rate = if totals.duration_us > 0 {
        totals.bytes as f64 / secs(totals.duration_us)
    } else {
        0.0
    };
    BulkStats {
        bulk_count: totals.count,
        avg_bytes_per_bulk: totals.bytes as f64 / count,
        avg_packets_per_bulk: totals.packets as f64 / count,
        bulk_rate,
    }
}

/// Split an ascending timestamp sequence into active and idle spans.
///
/// Every gap longer than [`IDLE_THRESHOLD_US`] is an idle span and closes the
/// active span before it. Zero-length active spans are not recorded.
pub fn active_idle(sorted: &[i64]) -> ActiveIdleStats {
    if sorted.len() < 2 {
        return ActiveIdleStats::default();
    }

    let mut active = Vec::new();
    let mut idle = Vec::new();
    let mut span_start = sorted[0];

    for pair in sorted.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > IDLE_THRESHOLD_US {
            let span = pair[0] - span_start;
            if span > 0 {
                active.push(secs(span));
            }
            idle.push(secs(gap));
            span_start = pair[1];
        }
    }
    let last = sorted[sorted.len() - 1] - span_start;
    if last > 0 {
        active.push(secs(last));
    }

    ActiveIdleStats {
        active: span_stats(&active),
        idle: span_stats(&idle),
    }
}

/// Mean, population std, max and min. All zero for an empty slice.
pub fn span_stats(values: &[f64]) -> SpanStats {
    if values.is_empty() {
        return SpanStats::default();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    SpanStats {
        mean,
        std: variance.sqrt(),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

pub fn length_stats(lengths: &[u32]) -> LengthStats {
    let (Some(&min), Some(&max)) = (lengths.iter().min(), lengths.iter().max()) else {
        return LengthStats::default();
    };
    let n = lengths.len() as f64;
    let mean = lengths.iter().map(|l| *l as f64).sum::<f64>() / n;
    let variance = lengths
        .iter()
        .map(|l| {
            let d = *l as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    LengthStats {
        min,
        max,
        mean,
        std: variance.sqrt(),
    }
}

/// Insert `ts` after every element `<= ts`, so equal timestamps keep their
/// arrival order.
#[inline]
pub fn insert_sorted(sorted: &mut Vec<i64>, ts: i64) {
    let idx = sorted.partition_point(|t| *t <= ts);
    sorted.insert(idx, ts);
}
