//! Runtime support for device sessions

pub mod reconnect;

pub use reconnect::{Backoff, ReconnectPolicy};
