//! Shutdown-time flow export to JSON and CSV.

use super::{FlowSnapshot, TcpFlagCounts};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

const CSV_HEADER: &str = "flow_id,src_ip,dst_ip,src_port,dst_port,protocol,duration_secs,\
fwd_packets,bwd_packets,fwd_bytes,bwd_bytes,\
fwd_pkt_len_max,fwd_pkt_len_min,fwd_pkt_len_mean,fwd_pkt_len_std,\
bwd_pkt_len_max,bwd_pkt_len_min,bwd_pkt_len_mean,bwd_pkt_len_std,\
fwd_header_bytes,bwd_header_bytes,\
fwd_fin,fwd_syn,fwd_rst,fwd_psh,fwd_ack,fwd_urg,\
bwd_fin,bwd_syn,bwd_rst,bwd_psh,bwd_ack,bwd_urg,\
fwd_avg_bytes_bulk,fwd_avg_packets_bulk,fwd_bulk_rate,\
bwd_avg_bytes_bulk,bwd_avg_packets_bulk,bwd_bulk_rate,\
active_mean,active_std,active_max,active_min,\
idle_mean,idle_std,idle_max,idle_min";

pub fn write_flow_json(path: &Path, flows: &[FlowSnapshot]) -> io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), flows)?;
    Ok(())
}

pub fn write_flow_csv(path: &Path, flows: &[FlowSnapshot]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_csv(&mut writer, flows)?;
    writer.flush()
}

/// One header line, then one row per flow.
pub fn write_csv<W: Write>(writer: &mut W, flows: &[FlowSnapshot]) -> io::Result<()> {
    writeln!(writer, "{}", CSV_HEADER)?;
    for flow in flows {
        write!(
            writer,
            "{},{},{},{},{},{},{:.6},{},{},{},{},",
            csv_escape(&flow.flow_id),
            flow.src_ip,
            flow.dst_ip,
            flow.src_port,
            flow.dst_port,
            flow.protocol,
            flow.duration_secs,
            flow.fwd_packets,
            flow.bwd_packets,
            flow.fwd_bytes,
            flow.bwd_bytes,
        )?;
        for len in [&flow.fwd_length, &flow.bwd_length] {
            write!(
                writer,
                "{},{},{:.2},{:.2},",
                len.max, len.min, len.mean, len.std
            )?;
        }
        write!(writer, "{},{},", flow.fwd_header_bytes, flow.bwd_header_bytes)?;
        write_flags(writer, &flow.fwd_flags)?;
        write_flags(writer, &flow.bwd_flags)?;
        for bulk in [&flow.fwd_bulk, &flow.bwd_bulk] {
            write!(
                writer,
                "{:.2},{:.2},{:.2},",
                bulk.avg_bytes_per_bulk, bulk.avg_packets_per_bulk, bulk.bulk_rate
            )?;
        }
        writeln!(
            writer,
            "{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
            flow.active.mean,
            flow.active.std,
            flow.active.max,
            flow.active.min,
            flow.idle.mean,
            flow.idle.std,
            flow.idle.max,
            flow.idle.min
        )?;
    }
    Ok(())
}

fn write_flags<W: Write>(writer: &mut W, flags: &TcpFlagCounts) -> io::Result<()> {
    write!(
        writer,
        "{},{},{},{},{},{},",
        flags.fin, flags.syn, flags.rst, flags.psh, flags.ack, flags.urg
    )
}

/// Quote a CSV field if it contains a separator, quote or line break.
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowTable;
    use crate::protocol::{DecodedPacket, IpProtocol, TcpFlags};
    use std::net::Ipv4Addr;

    fn sample_flows() -> Vec<FlowSnapshot> {
        let table = FlowTable::new(1);
        for (i, len) in [100u32, 300].into_iter().enumerate() {
            table.observe(&DecodedPacket {
                ts_us: i as i64 * 500_000,
                wire_len: len,
                src_ip: Ipv4Addr::new(10, 1, 1, 1),
                dst_ip: Ipv4Addr::new(10, 1, 1, 2),
                src_port: 1234,
                dst_port: 53,
                protocol: IpProtocol::UDP,
                header_len: 8,
                flags: TcpFlags::default(),
            });
        }
        table.snapshots()
    }

    #[test]
    fn csv_has_one_column_per_header_field() {
        let mut out = Vec::new();
        write_csv(&mut out, &sample_flows()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        let row = lines.next().unwrap();
        assert!(lines.next().is_none());
        assert_eq!(header.split(',').count(), row.split(',').count());
        assert!(row.starts_with("10.1.1.1-10.1.1.2-1234-53-17,10.1.1.1,10.1.1.2,1234,53,17,0.500000,2,0,400,0,300,100,200.00,100.00,"));
    }

    #[test]
    fn json_is_an_array_of_snapshots() {
        let flows = sample_flows();
        let value = serde_json::to_value(&flows).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["flow_id"], "10.1.1.1-10.1.1.2-1234-53-17");
        assert_eq!(arr[0]["src_ip"], "10.1.1.1");
        assert_eq!(arr[0]["fwd_flags"]["syn"], 0);
    }

    #[test]
    fn escape_quotes_fields_with_separators() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
