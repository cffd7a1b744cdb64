//! Platform screen door communication engine
//!
//! Talks to door controllers and signalling PLCs through pluggable protocol
//! drivers, decodes the polled blocks into typed point values, logs point
//! changes and forwards selected values from one device to another.
//!
//! The [`CommunicationSupervisor`] owns everything at runtime:
//! a [`DriverRegistry`] resolving protocol keys to drivers, one
//! [`DeviceSession`](crate::core::session::DeviceSession) per device and the point
//! table that maps raw blocks to points.

pub mod core;
pub mod error;
pub mod runtime;

pub use crate::core::config::{ConfigLoader, DeviceConfig, EngineConfig};
pub use crate::core::drivers::{DriverRegistry, ProtocolDriver};
pub use crate::core::session::{SessionSettings, SessionState, SessionStatus};
pub use crate::core::sink::{ChannelSink, EngineSink, TracingSink};
pub use crate::core::supervisor::{CommunicationSupervisor, ReloadReport};
pub use error::{CommError, Result};
