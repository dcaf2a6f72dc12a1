use clap::Parser;
use std::path::PathBuf;

/// flowmeter: bidirectional flow features from live or recorded traffic,
/// persisted to SQLite
#[derive(Parser, Debug)]
#[command(name = "flowmeter", version, about)]
pub struct Cli {
    /// TOML config file. Flags below override its values.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Interface to capture on; repeat for several (e.g. -i eth0 -i eth1)
    #[arg(short, long = "interface")]
    pub interfaces: Vec<String>,

    /// Read packets from a pcap savefile instead of a live interface
    #[arg(short, long)]
    pub read: Option<PathBuf>,

    /// BPF filter expression (e.g. "tcp or udp")
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Stop after this many frames per source (0 = unlimited)
    #[arg(short = 'c', long)]
    pub count: Option<u64>,

    /// Capture in promiscuous mode
    #[arg(long, conflicts_with = "no_promiscuous")]
    pub promiscuous: bool,

    /// Do not put the interface in promiscuous mode
    #[arg(long)]
    pub no_promiscuous: bool,

    /// Snapshot length (max bytes per packet to capture)
    #[arg(short, long)]
    pub snaplen: Option<i32>,

    /// Read timeout in milliseconds for the capture handle
    #[arg(short = 't', long)]
    pub timeout_ms: Option<i32>,

    /// SQLite database file
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Table the flows are upserted into
    #[arg(long)]
    pub table: Option<String>,

    /// Ingest batch workers (0 = one per CPU)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Snapshots per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Ingest queue capacity
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Flush pending snapshots at least this often (ms)
    #[arg(long)]
    pub flush_ms: Option<u64>,

    /// Flow table shards (0 = four per CPU)
    #[arg(long)]
    pub shards: Option<usize>,

    /// Evict flows idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_s: Option<f64>,

    /// Write all flows as JSON on exit
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Write all flows as CSV on exit
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List available network interfaces and exit
    #[arg(short, long)]
    pub list_interfaces: bool,
}
