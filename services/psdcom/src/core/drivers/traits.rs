//! Protocol driver capability set
//!
//! A driver speaks one wire protocol to one device. Callers serialize access
//! to a driver instance; the trait takes `&mut self` for every I/O call so a
//! driver never has to guard its own socket.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::points::{ByteOrder, PointLocation};
use crate::error::{CommError, Result};

/// Name of the status poll every built-in driver exposes
pub const POLL_STATUS: &str = "PollStatus";

/// Default status poll interval
pub const POLL_STATUS_INTERVAL_MS: u64 = 1000;

/// One name/value connection parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Typed raw request; block ids and offsets are in the driver's byte space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RawRequest {
    ReadBlock {
        block: u16,
        start: u32,
        length: u32,
    },
    WriteBlock {
        block: u16,
        start: u32,
        data: Vec<u8>,
    },
    WriteBit {
        block: u16,
        offset: u32,
        bit: u8,
        value: bool,
    },
}

impl fmt::Display for RawRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadBlock {
                block,
                start,
                length,
            } => write!(f, "read {}:{}+{}", block, start, length),
            Self::WriteBlock { block, start, data } => {
                write!(f, "write {}:{}+{}", block, start, data.len())
            },
            Self::WriteBit {
                block,
                offset,
                bit,
                value,
            } => write!(f, "write bit {}:{}.{}={}", block, offset, bit, u8::from(*value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodMode {
    /// Run once when the session reaches `Running`
    Startup,
    /// Run repeatedly, `interval_ms` apart
    Polling,
    /// Run only when invoked
    OnDemand,
}

/// A named driver operation and its schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub mode: MethodMode,
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub action: RawRequest,
}

fn default_enabled() -> bool {
    true
}

impl MethodDescriptor {
    pub fn polling(name: impl Into<String>, interval_ms: u64, action: RawRequest) -> Self {
        Self {
            name: name.into(),
            mode: MethodMode::Polling,
            interval_ms,
            enabled: true,
            action,
        }
    }

    pub fn startup(name: impl Into<String>, action: RawRequest) -> Self {
        Self {
            name: name.into(),
            mode: MethodMode::Startup,
            interval_ms: 0,
            enabled: true,
            action,
        }
    }

    pub fn on_demand(name: impl Into<String>, action: RawRequest) -> Self {
        Self {
            name: name.into(),
            mode: MethodMode::OnDemand,
            interval_ms: 0,
            enabled: true,
            action,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// A polling method needs a non-zero interval
    pub fn validate(&self) -> Result<()> {
        if self.mode == MethodMode::Polling && self.interval_ms == 0 {
            return Err(CommError::config(format!(
                "polling method '{}' has interval 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Layer `overlay` on top of `base`: same name replaces, new names append.
pub fn merge_methods(
    mut base: Vec<MethodDescriptor>,
    overlay: &[MethodDescriptor],
) -> Vec<MethodDescriptor> {
    for method in overlay {
        match base.iter_mut().find(|m| m.name == method.name) {
            Some(existing) => *existing = method.clone(),
            None => base.push(method.clone()),
        }
    }
    base
}

/// Standard status poll reading a fixed block every second
pub fn poll_status_method(block: u16, start: u32, length: u32) -> MethodDescriptor {
    MethodDescriptor::polling(
        POLL_STATUS,
        POLL_STATUS_INTERVAL_MS,
        RawRequest::ReadBlock {
            block,
            start,
            length,
        },
    )
}

/// Parse a numeric parameter into `slot`, keeping the current value on error
pub(crate) fn apply_param<T>(protocol: &str, param: &Parameter, slot: &mut T)
where
    T: FromStr,
{
    match param.value.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!(
            "{}: malformed value '{}' for parameter {}, keeping previous value",
            protocol, param.value, param.name
        ),
    }
}

/// Capability set of a protocol driver
#[async_trait]
pub trait ProtocolDriver: Send + Sync + fmt::Debug {
    /// Protocol key this instance registers under (e.g. `MODBUS_TCP`)
    fn protocol_key(&self) -> &str;

    /// Apply ordered name/value parameters. Unknown names are ignored and
    /// malformed values keep their previous setting.
    fn initialize(&mut self, parameters: &[Parameter]);

    /// Establish the connection. No internal retry.
    async fn open(&mut self) -> Result<()>;

    /// Drop the connection; safe to call when not connected
    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Execute one request. Fails with `NotConnected` while disconnected.
    async fn raw_transfer(&mut self, request: &RawRequest) -> Result<Vec<u8>>;

    /// Driver default methods plus those layered by its manifest
    fn list_methods(&self) -> Vec<MethodDescriptor>;

    /// Parse a protocol address (plus optional bit index 0..=15)
    fn locate(&self, address: &str, bit: Option<u8>) -> Result<PointLocation>;

    /// Wire order for multi-byte values
    fn byte_order(&self) -> ByteOrder;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(block: u16) -> RawRequest {
        RawRequest::ReadBlock {
            block,
            start: 0,
            length: 2,
        }
    }

    #[test]
    fn test_merge_methods_overrides_by_name() {
        let base = vec![
            poll_status_method(3, 0, 2),
            MethodDescriptor::startup("Init", read(1)),
        ];
        let mut slow = poll_status_method(4, 0, 4);
        slow.interval_ms = 5000;
        let overlay = vec![slow.clone(), MethodDescriptor::on_demand("Reset", read(2))];

        let merged = merge_methods(base, &overlay);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], slow);
        assert_eq!(merged[1].name, "Init");
        assert_eq!(merged[2].mode, MethodMode::OnDemand);
    }

    #[test]
    fn test_zero_interval_polling_is_rejected() {
        let m = MethodDescriptor::polling("Fast", 0, read(3));
        assert!(matches!(m.validate(), Err(CommError::ConfigError(_))));
        assert!(MethodDescriptor::startup("Once", read(3)).validate().is_ok());
    }

    #[test]
    fn test_method_from_yaml() {
        let yaml = r#"
name: DoorCommand
mode: on_demand
action: { op: write_bit, block: 3, offset: 21, bit: 0, value: true }
"#;
        let m: MethodDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert!(m.enabled);
        assert_eq!(
            m.action,
            RawRequest::WriteBit {
                block: 3,
                offset: 21,
                bit: 0,
                value: true
            }
        );
    }

    #[test]
    fn test_apply_param_keeps_previous_on_malformed() {
        let mut port: u16 = 502;
        apply_param("TEST", &Parameter::new("Port", "50x"), &mut port);
        assert_eq!(port, 502);
        apply_param("TEST", &Parameter::new("Port", " 1502 "), &mut port);
        assert_eq!(port, 1502);
    }
}
