use std::{io, time::Duration};

use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use replay_common::{constants::KiB, unix_nanos};
use tracing::{debug, info, warn};

use super::PacketSource;
use crate::{CaptureError, LinkType, Packet};

/// Device name that selects every interface that is up.
pub const ALL_DEVICES: &str = "all";

#[derive(Debug, Clone)]
pub struct LiveOptions {
    /// Interface name, or `"all"`.
    pub device: String,
    pub promiscuous: bool,
    /// How long a read blocks before returning [`CaptureError::Timeout`].
    pub read_timeout: Duration,
    /// Kernel receive buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            device: ALL_DEVICES.to_string(),
            promiscuous: false,
            read_timeout: Duration::from_millis(500),
            buffer_size: 64 * KiB as usize,
        }
    }
}

impl LiveOptions {
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

struct Handle {
    name: String,
    link: LinkType,
    rx: Box<dyn DataLinkReceiver>,
}

/// Captures packets from one or more network interfaces.
pub struct LiveSource {
    name: String,
    handles: Vec<Handle>,
    /// Next handle to read from.
    cursor: usize,
}

impl std::fmt::Debug for LiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let devices: Vec<_> = self.handles.iter().map(|h| h.name.as_str()).collect();
        f.debug_struct("LiveSource").field("devices", &devices).finish()
    }
}

impl LiveSource {
    /// Opens the device(s) named by `options`. Requires capture privileges.
    pub fn open(options: LiveOptions) -> Result<Self, CaptureError> {
        let interfaces: Vec<NetworkInterface> = if options.device == ALL_DEVICES {
            datalink::interfaces().into_iter().filter(|iface| iface.is_up()).collect()
        } else {
            datalink::interfaces().into_iter().filter(|iface| iface.name == options.device).collect()
        };

        if interfaces.is_empty() {
            return Err(CaptureError::NoDevice(options.device));
        }

        // With "all", opening may rightfully fail on some interfaces; only fail if none open.
        let mut handles = Vec::with_capacity(interfaces.len());
        let mut last_err = None;
        for iface in interfaces {
            match open_interface(&iface, &options) {
                Ok(handle) => handles.push(handle),
                Err(e) if options.device == ALL_DEVICES => {
                    warn!(device = %iface.name, err = ?e, "Skipping capture device");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if handles.is_empty() {
            return Err(last_err.unwrap_or(CaptureError::NoDevice(options.device)));
        }

        info!(devices = handles.len(), device = %options.device, "Started live capture");

        Ok(Self { name: options.device, handles, cursor: 0 })
    }
}

fn open_interface(iface: &NetworkInterface, options: &LiveOptions) -> Result<Handle, CaptureError> {
    let config = datalink::Config {
        read_timeout: Some(options.read_timeout),
        read_buffer_size: options.buffer_size,
        promiscuous: options.promiscuous,
        ..Default::default()
    };

    let open_err = |reason: String| CaptureError::Open { name: iface.name.clone(), reason };

    let rx = match datalink::channel(iface, config) {
        Ok(Channel::Ethernet(_tx, rx)) => rx,
        Ok(_) => return Err(open_err("unsupported channel type".to_string())),
        Err(e) => return Err(open_err(e.to_string())),
    };

    let link = if iface.mac.is_none() || iface.is_point_to_point() {
        LinkType::Raw
    } else {
        LinkType::Ethernet
    };

    debug!(device = %iface.name, ?link, "Opened capture device");

    Ok(Handle { name: iface.name.clone(), link, rx })
}

impl PacketSource for LiveSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_packet(&mut self) -> Option<Result<Packet, CaptureError>> {
        let count = self.handles.len();
        let handle = &mut self.handles[self.cursor % count];
        self.cursor = self.cursor.wrapping_add(1);

        let link = handle.link;
        Some(match handle.rx.next() {
            Ok(frame) => Ok(Packet::decode(link, frame.to_vec(), unix_nanos())),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Err(CaptureError::Timeout)
            }
            Err(e) => Err(CaptureError::Io(e)),
        })
    }
}
