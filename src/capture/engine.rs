//! libpcap-backed packet sources: live interfaces and savefiles.

use super::{Frame, PacketSource, Polled};
use pcap::{Activated, Capture, Device};
use std::path::Path;
use thiserror::Error;

/// Errors from the capture engine.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Failed to find a suitable network device.
    #[error("no capture device: {0}")]
    NoDevice(String),
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),
}

/// Configuration for opening a live capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Interface name, or `None` for the system default.
    pub interface: Option<String>,
    pub promiscuous: bool,
    pub snaplen: i32,
    pub timeout_ms: i32,
    pub filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: None,
            promiscuous: true,
            snaplen: 65535,
            timeout_ms: 100,
            filter: None,
        }
    }
}

/// List all available network interfaces.
pub fn list_interfaces() -> Result<Vec<Device>, CaptureError> {
    Ok(Device::list()?)
}

/// A pcap handle, live or offline, yielding frames.
pub struct PcapSource<T: Activated + ?Sized> {
    cap: Capture<T>,
    name: String,
}

impl<T: Activated + ?Sized> PacketSource for PcapSource<T> {
    fn next_frame(&mut self) -> Result<Polled<'_>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(Polled::Frame(Frame {
                ts_us: packet.header.ts.tv_sec as i64 * 1_000_000
                    + packet.header.ts.tv_usec as i64,
                wire_len: packet.header.len,
                data: packet.data,
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(Polled::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(Polled::End),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Open a live packet capture with the given configuration.
pub fn open_live(config: &CaptureConfig) -> Result<PcapSource<pcap::Active>, CaptureError> {
    let device = match &config.interface {
        Some(name) => Device::list()?
            .into_iter()
            .find(|d| d.name == *name)
            .ok_or_else(|| CaptureError::NoDevice(format!("interface '{}' not found", name)))?,
        None => Device::lookup()?
            .ok_or_else(|| CaptureError::NoDevice("no default device found".into()))?,
    };

    let device_name = device.name.clone();

    let mut cap = Capture::from_device(device)?
        .promisc(config.promiscuous)
        .snaplen(config.snaplen)
        .timeout(config.timeout_ms)
        .open()?;

    if let Some(filter) = &config.filter {
        cap.filter(filter, true)?;
    }

    tracing::info!(
        interface = %device_name,
        promiscuous = config.promiscuous,
        snaplen = config.snaplen,
        filter = config.filter.as_deref().unwrap_or("none"),
        "live capture opened"
    );

    Ok(PcapSource {
        cap,
        name: device_name,
    })
}

/// Open a pcap savefile for offline replay.
pub fn open_offline(
    path: &Path,
    filter: Option<&str>,
) -> Result<PcapSource<pcap::Offline>, CaptureError> {
    let mut cap = Capture::from_file(path)?;
    if let Some(filter) = filter {
        cap.filter(filter, true)?;
    }

    tracing::info!(
        file = %path.display(),
        filter = filter.unwrap_or("none"),
        "savefile opened"
    );

    Ok(PcapSource {
        cap,
        name: path.display().to_string(),
    })
}
