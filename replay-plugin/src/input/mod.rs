//! [`Input`](crate::Input) implementations.

mod capture;
pub use capture::{CaptureInput, CaptureOptions};

mod listener;
pub use listener::{ListenerInput, ListenerOptions};
