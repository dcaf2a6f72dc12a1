//! Bidirectional flow assembly and feature extraction over libpcap captures,
//! with batched, idempotent persistence to SQLite.
//!
//! ```text
//! PacketSource -> decode_frame -> FlowTable::observe -> Ingestor::submit
//!                                                         |
//!                                   BatchWorker <- bounded queue
//!                                        |
//!                                   FlowSink (SQLite)
//! ```

pub mod capture;
pub mod config;
pub mod flow;
pub mod pipeline;
pub mod protocol;
pub mod store;
