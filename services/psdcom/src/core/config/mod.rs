//! Engine configuration

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{DeviceConfig, EngineConfig, EngineSettings, ReconnectConfig, ServiceConfig};
