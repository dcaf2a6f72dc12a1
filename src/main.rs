mod cli;

use clap::Parser;
use flowmeter::capture::engine::{self, CaptureError};
use flowmeter::capture::{self, CaptureOptions, CaptureStats, PacketSource};
use flowmeter::config::{self, Config};
use flowmeter::flow::{export, FlowTable};
use flowmeter::pipeline;
use flowmeter::store::SqliteStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    let args = cli::Cli::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    if args.list_interfaces {
        list_interfaces();
        return;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
        eprintln!("\nInterrupt received, stopping capture...");
    }) {
        tracing::warn!(error = %e, "failed to install Ctrl-C handler");
    }

    if let Err(e) = run(&config, &running) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// List available network interfaces and print them.
fn list_interfaces() {
    match engine::list_interfaces() {
        Ok(devices) => {
            println!("Available network interfaces:");
            println!("{:<20} {:<20} Addresses", "Name", "Description");
            println!("{}", "-".repeat(70));
            for device in &devices {
                let desc = device.desc.as_deref().unwrap_or("");
                let addrs: Vec<String> = device
                    .addresses
                    .iter()
                    .map(|a| format!("{}", a.addr))
                    .collect();
                println!("{:<20} {:<20} {}", device.name, desc, addrs.join(", "));
            }
            if devices.is_empty() {
                println!("  (no interfaces found, try running with sudo)");
            }
        }
        Err(e) => {
            eprintln!("error listing interfaces: {}", e);
            eprintln!("hint: try running with sudo");
        }
    }
}

type BoxedSource = Box<dyn PacketSource + Send>;

/// Open every configured source up front so a missing device or unreadable
/// file aborts before any thread starts.
fn open_sources(config: &Config) -> Result<Vec<BoxedSource>, CaptureError> {
    let cap = &config.capture;
    if let Some(path) = &cap.read_file {
        let source: BoxedSource = Box::new(engine::open_offline(path, cap.filter.as_deref())?);
        return Ok(vec![source]);
    }

    let live = |interface: Option<String>| -> Result<BoxedSource, CaptureError> {
        let source = engine::open_live(&engine::CaptureConfig {
            interface,
            promiscuous: cap.promiscuous,
            snaplen: cap.snaplen,
            timeout_ms: cap.timeout_ms,
            filter: cap.filter.clone(),
        })?;
        Ok(Box::new(source))
    };

    if cap.interfaces.is_empty() {
        Ok(vec![live(None)?])
    } else {
        cap.interfaces
            .iter()
            .map(|name| live(Some(name.clone())))
            .collect()
    }
}

fn run(config: &Config, running: &Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let sources = open_sources(config)?;

    let table = Arc::new(FlowTable::new(config.flow.shards));
    let store = config.store.clone();
    let ingest = pipeline::spawn(&config.ingest.to_pipeline(), |_| {
        SqliteStore::open(
            &store.path,
            &store.table,
            Duration::from_millis(store.busy_timeout_ms),
        )
    })?;

    println!("flowmeter v{}", env!("CARGO_PKG_VERSION"));
    for source in &sources {
        println!("Capturing from: {}", source.name());
    }
    if let Some(filter) = &config.capture.filter {
        println!("Filter: {}", filter);
    }
    println!(
        "Persisting to {} (table {}) with {} worker(s)",
        config.store.path.display(),
        config.store.table,
        ingest.num_workers()
    );
    if config.run.count > 0 {
        println!("Capturing {} frames per source...", config.run.count);
    } else {
        println!("Capturing packets (Ctrl-C to stop)...");
    }
    println!();

    let opts = CaptureOptions {
        count: config.run.count,
        idle_ttl_us: config.flow.idle_ttl_us(),
    };
    let started = Instant::now();

    let mut handles = Vec::with_capacity(sources.len());
    for (i, mut source) in sources.into_iter().enumerate() {
        let table = table.clone();
        let ingestor = ingest.ingestor();
        let opts = opts.clone();
        let running = running.clone();
        let handle = thread::Builder::new()
            .name(format!("fm-capture-{}", i))
            .spawn(move || {
                capture::run_capture(source.as_mut(), &table, &ingestor, &opts, &running)
            })?;
        handles.push(handle);
    }

    let mut totals = CaptureStats::default();
    let mut first_error: Option<CaptureError> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(stats)) => totals.merge(&stats),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(_) => tracing::error!("capture thread panicked"),
        }
    }

    let ingest_stats = ingest.shutdown();
    let elapsed = started.elapsed().as_secs_f64();

    let flows = table.snapshots();
    if let Some(path) = &config.output.export_json {
        export::write_flow_json(path, &flows)?;
        println!("Wrote {} flows to {}", flows.len(), path.display());
    }
    if let Some(path) = &config.output.export_csv {
        export::write_flow_csv(path, &flows)?;
        println!("Wrote {} flows to {}", flows.len(), path.display());
    }

    println!();
    println!("--- Capture Summary ---");
    println!("Frames captured:   {}", totals.frames);
    println!("Frames decoded:    {}", totals.decoded);
    println!("Frames discarded:  {}", totals.discarded);
    println!("Bytes on wire:     {}", totals.bytes);
    println!("Live flows:        {}", flows.len());
    println!("Flows evicted:     {}", totals.evicted);
    println!("Snapshots queued:  {}", ingest_stats.enqueued);
    println!("Queue full waits:  {}", ingest_stats.backpressure_waits);
    println!("Batches written:   {}", ingest_stats.batches_flushed);
    println!("Batches failed:    {}", ingest_stats.batches_failed);
    println!("Rows upserted:     {}", ingest_stats.rows_written);
    if ingest_stats.dropped_after_close > 0 {
        println!("Snapshots dropped: {}", ingest_stats.dropped_after_close);
    }
    println!("Elapsed:           {:.2}s", elapsed);

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn load_config(args: &cli::Cli) -> Result<Config, config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let capture = &mut config.capture;
    if !args.interfaces.is_empty() {
        capture.interfaces = args.interfaces.clone();
    }
    if let Some(value) = &args.read {
        capture.read_file = Some(value.clone());
    }
    if let Some(value) = &args.filter {
        capture.filter = Some(value.clone());
    }
    if let Some(value) = args.snaplen {
        capture.snaplen = value;
    }
    if let Some(value) = args.timeout_ms {
        capture.timeout_ms = value;
    }
    if args.promiscuous {
        capture.promiscuous = true;
    }
    if args.no_promiscuous {
        capture.promiscuous = false;
    }

    if let Some(value) = args.count {
        config.run.count = value;
    }
    if let Some(value) = args.shards {
        config.flow.shards = value;
    }
    if let Some(value) = args.idle_timeout_s {
        config.flow.idle_timeout_secs = value;
    }
    if let Some(value) = args.workers {
        config.ingest.workers = value;
    }
    if let Some(value) = args.batch_size {
        config.ingest.batch_size = value;
    }
    if let Some(value) = args.queue_capacity {
        config.ingest.queue_capacity = value;
    }
    if let Some(value) = args.flush_ms {
        config.ingest.flush_interval_ms = value;
    }
    if let Some(value) = &args.db {
        config.store.path = value.clone();
    }
    if let Some(value) = &args.table {
        config.store.table = value.clone();
    }
    if let Some(value) = &args.export_json {
        config.output.export_json = Some(value.clone()).filter(|p| !p.as_os_str().is_empty());
    }
    if let Some(value) = &args.export_csv {
        config.output.export_csv = Some(value.clone()).filter(|p| !p.as_os_str().is_empty());
    }

    config.validate()?;
    Ok(config)
}
