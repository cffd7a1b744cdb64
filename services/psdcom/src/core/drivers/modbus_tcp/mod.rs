//! Modbus TCP reference driver

pub mod driver;
pub mod frame;

pub use driver::{ModbusTcpDriver, DEFAULT_PROTOCOL_KEY};

use super::registry::{DriverFactory, DriverManifest};
use super::traits::ProtocolDriver;
use crate::error::Result;

/// Factory for kind `modbus_tcp`
#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusTcpFactory;

impl DriverFactory for ModbusTcpFactory {
    fn kind(&self) -> &str {
        "modbus_tcp"
    }

    fn create(&self, manifest: &DriverManifest) -> Result<Box<dyn ProtocolDriver>> {
        Ok(Box::new(
            ModbusTcpDriver::new(manifest.protocol_or(DEFAULT_PROTOCOL_KEY))
                .with_methods(manifest.methods.clone()),
        ))
    }
}
