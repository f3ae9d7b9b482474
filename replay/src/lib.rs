#![doc(issue_tracker_base_url = "https://github.com/xy1884/traffic-replay/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Capture HTTP and TCP traffic, live or from pcap files, and replay it to other destinations.

pub use replay_assembly as assembly;
pub use replay_capture as capture;
pub use replay_common as common;
pub use replay_plugin::*;
pub use replay_wire::{http, Level, Message};
