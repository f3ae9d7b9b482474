#![doc(issue_tracker_base_url = "https://github.com/xy1884/traffic-replay/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Packet acquisition: decoding captured link-layer frames into [`Packet`]s, reading them from
//! capture files or live interfaces, and filtering them.

use std::io;

use thiserror::Error;

mod filter;
pub use filter::Filter;

pub mod frame;

mod packet;
pub use packet::{LinkType, NetworkLayer, Packet, SegmentFlags, TcpSegment};

pub mod source;
pub use source::{spawn_source, LiveOptions, LiveSource, PacketSource, PcapFileSource, ALL_DEVICES};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Failed to open capture source {name}: {reason}")]
    Open { name: String, reason: String },
    #[error("Pcap error: {0}")]
    Pcap(String),
    #[error("Invalid filter expression: {0}")]
    Filter(String),
    #[error("No capture device matches {0:?}")]
    NoDevice(String),
    #[error("Read timed out")]
    Timeout,
}

impl CaptureError {
    /// Returns `true` if the source can be read again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
