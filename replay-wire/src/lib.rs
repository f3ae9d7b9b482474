#![doc(issue_tracker_base_url = "https://github.com/xy1884/traffic-replay/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod http;
mod message;

pub use message::{Level, Message};
