//! Persistence sinks for flow snapshots.

pub mod sqlite;

use crate::flow::FlowSnapshot;
use ahash::AHashMap;
use thiserror::Error;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid table name {0:?}: expected a plain SQL identifier")]
    InvalidTable(String),
}

/// Destination for batches of snapshots. Each batch is applied atomically:
/// either every snapshot in it is upserted or none is.
///
/// Upserts are keyed by `flow_id`, so writing the same snapshot twice has the
/// same effect as writing it once. Returns the number of rows inserted or
/// updated.
pub trait FlowSink: Send {
    fn write_batch(&mut self, batch: &[FlowSnapshot]) -> Result<usize, StoreError>;
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Keep one snapshot per flow: the most advanced by `(end_time, total_packets)`,
/// the later one on ties. Flows stay in order of first appearance.
pub fn coalesce(batch: &[FlowSnapshot]) -> Vec<&FlowSnapshot> {
    let mut out: Vec<&FlowSnapshot> = Vec::with_capacity(batch.len());
    let mut index: AHashMap<&str, usize> = AHashMap::with_capacity(batch.len());
    for snap in batch {
        match index.get(snap.flow_id.as_str()) {
            Some(&i) => {
                if (snap.end_time, snap.total_packets())
                    >= (out[i].end_time, out[i].total_packets())
                {
                    out[i] = snap;
                }
            }
            None => {
                index.insert(snap.flow_id.as_str(), out.len());
                out.push(snap);
            }
        }
    }
    out
}
