//! Packet sources and the capture loop.
//!
//! A [`PacketSource`] yields raw frames borrowed from its own buffer; the
//! loop in [`driver`] decodes them, folds them into the flow table and hands
//! the resulting snapshots to the ingest pipeline.

pub mod driver;
pub mod engine;

pub use driver::{run_capture, CaptureOptions, CaptureStats};
pub use engine::CaptureError;

/// One captured frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Capture timestamp, microseconds since the Unix epoch.
    pub ts_us: i64,
    /// Length on the wire, which may exceed `data.len()` under a snaplen.
    pub wire_len: u32,
    pub data: &'a [u8],
}

/// Outcome of one poll of a [`PacketSource`].
#[derive(Debug)]
pub enum Polled<'a> {
    Frame(Frame<'a>),
    /// Read timeout with nothing captured; poll again.
    Idle,
    /// The source is exhausted.
    End,
}

pub trait PacketSource {
    /// Errors are fatal to the capture loop reading this source.
    fn next_frame(&mut self) -> Result<Polled<'_>, CaptureError>;

    fn name(&self) -> &str;
}
