//! Protocol drivers and the driver registry

pub mod modbus_tcp;
pub mod registry;
pub mod traits;
pub mod virt;

pub use registry::{DriverFactory, DriverManifest, DriverRegistry, FnDriverFactory, LoadReport};
pub use traits::{
    merge_methods, MethodDescriptor, MethodMode, Parameter, ProtocolDriver, RawRequest,
    POLL_STATUS,
};
