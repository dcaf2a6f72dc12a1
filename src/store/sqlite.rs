//! SQLite flow store.
//!
//! One [`SqliteStore`] per batch worker, each with its own connection. File
//! databases run in WAL mode with a busy timeout so concurrent writers queue
//! on the database lock instead of failing.

use super::{coalesce, is_plain_identifier, FlowSink, StoreError};
use crate::flow::features::{BulkStats, LengthStats, SpanStats};
use crate::flow::{FlowSnapshot, TcpFlagCounts};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TABLE: &str = "network_flows";

/// Column names and SQLite types, in bind order. `flow_id` must stay first.
const COLUMNS: &[(&str, &str)] = &[
    ("flow_id", "TEXT PRIMARY KEY"),
    ("source_ip", "TEXT NOT NULL"),
    ("source_port", "INTEGER NOT NULL"),
    ("destination_ip", "TEXT NOT NULL"),
    ("destination_port", "INTEGER NOT NULL"),
    ("protocol", "INTEGER NOT NULL"),
    ("start_time", "REAL NOT NULL"),
    ("end_time", "REAL NOT NULL"),
    ("flow_duration", "REAL NOT NULL"),
    ("total_packets", "INTEGER NOT NULL"),
    ("total_fwd_packets", "INTEGER NOT NULL"),
    ("total_bwd_packets", "INTEGER NOT NULL"),
    ("total_fwd_bytes", "INTEGER NOT NULL"),
    ("total_bwd_bytes", "INTEGER NOT NULL"),
    ("fwd_header_bytes", "INTEGER NOT NULL"),
    ("bwd_header_bytes", "INTEGER NOT NULL"),
    ("fwd_fin_flag_count", "INTEGER NOT NULL"),
    ("fwd_syn_flag_count", "INTEGER NOT NULL"),
    ("fwd_rst_flag_count", "INTEGER NOT NULL"),
    ("fwd_psh_flag_count", "INTEGER NOT NULL"),
    ("fwd_ack_flag_count", "INTEGER NOT NULL"),
    ("fwd_urg_flag_count", "INTEGER NOT NULL"),
    ("bwd_fin_flag_count", "INTEGER NOT NULL"),
    ("bwd_syn_flag_count", "INTEGER NOT NULL"),
    ("bwd_rst_flag_count", "INTEGER NOT NULL"),
    ("bwd_psh_flag_count", "INTEGER NOT NULL"),
    ("bwd_ack_flag_count", "INTEGER NOT NULL"),
    ("bwd_urg_flag_count", "INTEGER NOT NULL"),
    ("fwd_bulk_count", "INTEGER NOT NULL"),
    ("fwd_avg_bytes_bulk", "REAL NOT NULL"),
    ("fwd_avg_packets_bulk", "REAL NOT NULL"),
    ("fwd_bulk_rate", "REAL NOT NULL"),
    ("bwd_bulk_count", "INTEGER NOT NULL"),
    ("bwd_avg_bytes_bulk", "REAL NOT NULL"),
    ("bwd_avg_packets_bulk", "REAL NOT NULL"),
    ("bwd_bulk_rate", "REAL NOT NULL"),
    ("fwd_pkt_len_min", "INTEGER NOT NULL"),
    ("fwd_pkt_len_max", "INTEGER NOT NULL"),
    ("fwd_pkt_len_mean", "REAL NOT NULL"),
    ("fwd_pkt_len_std", "REAL NOT NULL"),
    ("bwd_pkt_len_min", "INTEGER NOT NULL"),
    ("bwd_pkt_len_max", "INTEGER NOT NULL"),
    ("bwd_pkt_len_mean", "REAL NOT NULL"),
    ("bwd_pkt_len_std", "REAL NOT NULL"),
    ("active_mean", "REAL NOT NULL"),
    ("active_std", "REAL NOT NULL"),
    ("active_max", "REAL NOT NULL"),
    ("active_min", "REAL NOT NULL"),
    ("idle_mean", "REAL NOT NULL"),
    ("idle_std", "REAL NOT NULL"),
    ("idle_max", "REAL NOT NULL"),
    ("idle_min", "REAL NOT NULL"),
];

/// Row as read back from the table. Only the aggregate columns are exposed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFlow {
    pub flow_id: String,
    pub total_packets: u64,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,
    pub fwd_syn: u64,
    pub flow_duration: f64,
}

pub struct SqliteStore {
    conn: Connection,
    table: String,
    upsert_sql: String,
}

impl SqliteStore {
    /// Open or create the database file and the flow table.
    pub fn open<P: AsRef<Path>>(
        path: P,
        table: &str,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        check_table(table)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened flow store");

        Self::with_connection(conn, table)
    }

    /// In-memory database, private to this store.
    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        check_table(table)?;
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        conn.execute_batch(&create_table_sql(table))?;
        Ok(SqliteStore {
            conn,
            table: table.to_string(),
            upsert_sql: upsert_sql(table),
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn fetch(&self, flow_id: &str) -> Result<Option<StoredFlow>, StoreError> {
        let sql = format!(
            "SELECT flow_id, total_packets, total_fwd_packets, total_bwd_packets, \
             total_fwd_bytes, total_bwd_bytes, fwd_syn_flag_count, flow_duration \
             FROM {} WHERE flow_id = ?1",
            self.table
        );
        let row = self
            .conn
            .query_row(&sql, [flow_id], |row| {
                Ok(StoredFlow {
                    flow_id: row.get(0)?,
                    total_packets: row.get::<_, i64>(1)? as u64,
                    fwd_packets: row.get::<_, i64>(2)? as u64,
                    bwd_packets: row.get::<_, i64>(3)? as u64,
                    fwd_bytes: row.get::<_, i64>(4)? as u64,
                    bwd_bytes: row.get::<_, i64>(5)? as u64,
                    fwd_syn: row.get::<_, i64>(6)? as u64,
                    flow_duration: row.get(7)?,
                })
            })
            .optional()?;
        Ok(row)
    }
}

impl FlowSink for SqliteStore {
    /// One transaction per batch. Any failing row rolls the whole batch back.
    fn write_batch(&mut self, batch: &[FlowSnapshot]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(&self.upsert_sql)?;
            for snap in coalesce(batch) {
                changed += stmt.execute(params_from_iter(row_values(snap)))?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}

fn check_table(table: &str) -> Result<(), StoreError> {
    if is_plain_identifier(table) {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

fn create_table_sql(table: &str) -> String {
    let cols: Vec<String> = COLUMNS
        .iter()
        .map(|(name, ty)| format!("    {} {}", name, ty))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        table,
        cols.join(",\n")
    )
}

/// `INSERT ... ON CONFLICT(flow_id) DO UPDATE`, skipping the update when the
/// stored row is ahead of the incoming one.
///
/// Rows are ordered by `(end_time, total_packets)`. Both only grow within one
/// flow lifetime, and a flow re-created after eviction ends later than the
/// evicted one, so its first snapshot replaces the old row.
fn upsert_sql(table: &str) -> String {
    let names: Vec<&str> = COLUMNS.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = names[1..]
        .iter()
        .map(|name| format!("{name} = excluded.{name}"))
        .collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) \
         ON CONFLICT(flow_id) DO UPDATE SET {} \
         WHERE excluded.end_time > {table}.end_time \
         OR (excluded.end_time = {table}.end_time \
         AND excluded.total_packets >= {table}.total_packets)",
        names.join(", "),
        placeholders.join(", "),
        updates.join(", "),
    )
}

fn int(v: u64) -> Value {
    Value::Integer(v as i64)
}

fn push_flags(row: &mut Vec<Value>, f: &TcpFlagCounts) {
    row.extend([f.fin, f.syn, f.rst, f.psh, f.ack, f.urg].map(int));
}

fn push_bulk(row: &mut Vec<Value>, b: &BulkStats) {
    row.push(int(b.bulk_count));
    row.push(Value::Real(b.avg_bytes_per_bulk));
    row.push(Value::Real(b.avg_packets_per_bulk));
    row.push(Value::Real(b.bulk_rate));
}

fn push_lengths(row: &mut Vec<Value>, l: &LengthStats) {
    row.push(int(l.min as u64));
    row.push(int(l.max as u64));
    row.push(Value::Real(l.mean));
    row.push(Value::Real(l.std));
}

fn push_spans(row: &mut Vec<Value>, s: &SpanStats) {
    row.extend([s.mean, s.std, s.max, s.min].map(Value::Real));
}

/// Bind values in `COLUMNS` order.
fn row_values(s: &FlowSnapshot) -> Vec<Value> {
    let mut row = Vec::with_capacity(COLUMNS.len());
    row.push(Value::Text(s.flow_id.clone()));
    row.push(Value::Text(s.src_ip.to_string()));
    row.push(int(s.src_port as u64));
    row.push(Value::Text(s.dst_ip.to_string()));
    row.push(int(s.dst_port as u64));
    row.push(int(s.protocol as u64));
    row.push(Value::Real(s.start_time));
    row.push(Value::Real(s.end_time));
    row.push(Value::Real(s.duration_secs));
    row.push(int(s.total_packets()));
    row.push(int(s.fwd_packets));
    row.push(int(s.bwd_packets));
    row.push(int(s.fwd_bytes));
    row.push(int(s.bwd_bytes));
    row.push(int(s.fwd_header_bytes));
    row.push(int(s.bwd_header_bytes));
    push_flags(&mut row, &s.fwd_flags);
    push_flags(&mut row, &s.bwd_flags);
    push_bulk(&mut row, &s.fwd_bulk);
    push_bulk(&mut row, &s.bwd_bulk);
    push_lengths(&mut row, &s.fwd_length);
    push_lengths(&mut row, &s.bwd_length);
    push_spans(&mut row, &s.active);
    push_spans(&mut row, &s.idle);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowTable;
    use crate::protocol::{tcp::flags, DecodedPacket, IpProtocol, TcpFlags};
    use std::net::Ipv4Addr;

    fn snapshots_of(n: usize) -> Vec<FlowSnapshot> {
        let table = FlowTable::new(1);
        (0..n)
            .map(|i| {
                table.observe(&DecodedPacket {
                    ts_us: i as i64 * 250_000,
                    wire_len: 100,
                    src_ip: Ipv4Addr::new(10, 0, 0, 1),
                    dst_ip: Ipv4Addr::new(10, 0, 0, 2),
                    src_port: 40000,
                    dst_port: 80,
                    protocol: IpProtocol::TCP,
                    header_len: 20,
                    flags: TcpFlags::from_bits(if i == 0 { flags::SYN } else { flags::ACK }),
                })
            })
            .collect()
    }

    #[test]
    fn row_matches_column_list() {
        let snap = &snapshots_of(1)[0];
        assert_eq!(row_values(snap).len(), COLUMNS.len());
        assert_eq!(COLUMNS[0].0, "flow_id");
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = SqliteStore::open_in_memory(DEFAULT_TABLE).unwrap();
        let snaps = snapshots_of(3);
        let last = snaps.last().unwrap().clone();

        assert_eq!(store.write_batch(&[last.clone()]).unwrap(), 1);
        let once = store.fetch(&last.flow_id).unwrap().unwrap();
        assert_eq!(store.write_batch(&[last.clone()]).unwrap(), 1);
        let twice = store.fetch(&last.flow_id).unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(twice.total_packets, 3);
        assert_eq!(twice.fwd_bytes, 300);
        assert_eq!(twice.fwd_syn, 1);
        assert_eq!(twice.flow_duration, 0.5);
    }

    #[test]
    fn stale_snapshot_does_not_overwrite_newer_row() {
        let mut store = SqliteStore::open_in_memory(DEFAULT_TABLE).unwrap();
        let snaps = snapshots_of(4);

        store.write_batch(&snaps[3..]).unwrap();
        assert_eq!(store.write_batch(&snaps[1..2]).unwrap(), 0);

        let row = store.fetch(&snaps[0].flow_id).unwrap().unwrap();
        assert_eq!(row.total_packets, 4);
    }

    #[test]
    fn batch_with_repeated_flow_stores_latest() {
        let mut store = SqliteStore::open_in_memory("flows_test").unwrap();
        let snaps = snapshots_of(5);
        assert_eq!(store.write_batch(&snaps).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
        let row = store.fetch(&snaps[0].flow_id).unwrap().unwrap();
        assert_eq!(row.fwd_packets, 5);
        assert!(store.fetch("10.9.9.9-10.9.9.8-1-2-17").unwrap().is_none());
    }

    #[test]
    fn flow_recreated_after_eviction_replaces_old_row() {
        let mut store = SqliteStore::open_in_memory(DEFAULT_TABLE).unwrap();
        let table = FlowTable::new(1);
        let packet = |ts_us: i64| DecodedPacket {
            ts_us,
            wire_len: 100,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 40000,
            dst_port: 80,
            protocol: IpProtocol::TCP,
            header_len: 20,
            flags: TcpFlags::from_bits(flags::ACK),
        };

        let first: Vec<FlowSnapshot> = (0..5).map(|i| table.observe(&packet(i * 1_000))).collect();
        store.write_batch(&first).unwrap();
        assert_eq!(store.fetch(&first[0].flow_id).unwrap().unwrap().total_packets, 5);

        assert_eq!(table.evict_idle(60_000_000, 30_000_000), 1);
        let reborn = table.observe(&packet(61_000_000));
        assert_eq!(reborn.total_packets(), 1);
        assert_eq!(store.write_batch(&[reborn.clone()]).unwrap(), 1);

        let row = store.fetch(&reborn.flow_id).unwrap().unwrap();
        assert_eq!(row.total_packets, 1);
        assert_eq!(row.fwd_bytes, 100);
        assert_eq!(row.flow_duration, 0.0);
        assert_eq!(store.count().unwrap(), 1);

        // a straggler from the evicted lifetime must not roll the row back
        assert_eq!(store.write_batch(&first[4..]).unwrap(), 0);
        assert_eq!(store.write_batch(&[reborn.clone(), first[4].clone()]).unwrap(), 1);
        assert_eq!(store.fetch(&reborn.flow_id).unwrap().unwrap().total_packets, 1);
    }

    #[test]
    fn invalid_table_name_is_rejected() {
        assert!(matches!(
            SqliteStore::open_in_memory("flows; --"),
            Err(StoreError::InvalidTable(_))
        ));
    }
}
