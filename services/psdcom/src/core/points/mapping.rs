//! Point mapping definitions
//!
//! A [`PointMapping`] is one configured tap into a device's register space,
//! supplied read-only by the configuration layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::decoder::DataType;

/// Resolved position of a point inside a driver's block space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointLocation {
    /// Protocol block (Modbus table, S7 data block)
    pub block: u16,
    /// Byte offset within the block
    pub offset: u32,
    /// Bit within the byte at `offset` (0..=7), bit-addressed points only
    pub bit: Option<u8>,
}

impl fmt::Display for PointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "{}:{}.{}", self.block, self.offset, bit),
            None => write!(f, "{}:{}", self.block, self.offset),
        }
    }
}

/// Business object the point feeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBinding {
    pub object_type: String,
    pub object_key: String,
    #[serde(default)]
    pub sub_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Direct,
    Inverted,
}

/// Forwarding target as configured; may be incomplete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTarget {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default)]
    pub mode: SyncMode,
}

impl SyncTarget {
    /// Target device and address, when both are present and non-blank
    pub fn target(&self) -> Option<(&str, &str)> {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|s| !s.trim().is_empty())
        }
        Some((present(&self.device_id)?, present(&self.address)?))
    }

    pub fn is_complete(&self) -> bool {
        self.target().is_some()
    }
}

/// Which boolean edge produces a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerState {
    /// 1 -> 0
    #[serde(rename = "onFalse", alias = "on_false")]
    OnFalse,
    /// 0 -> 1
    #[serde(rename = "onTrue", alias = "on_true")]
    OnTrue,
    #[default]
    #[serde(rename = "onEither", alias = "on_either")]
    OnEither,
}

impl TriggerState {
    pub fn fires(&self, old: bool, new: bool) -> bool {
        match self {
            Self::OnFalse => old && !new,
            Self::OnTrue => !old && new,
            Self::OnEither => old != new,
        }
    }
}

/// Log and alarm rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: TriggerState,
    /// Minimum analog change to log; 0 or absent logs every change
    #[serde(default)]
    pub deadband: Option<f64>,
    #[serde(default)]
    pub high_limit: Option<f64>,
    #[serde(default)]
    pub low_limit: Option<f64>,
}

impl Default for LogRule {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger: TriggerState::default(),
            deadband: None,
            high_limit: None,
            low_limit: None,
        }
    }
}

/// One configured point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointMapping {
    pub point_id: String,
    pub device_id: String,
    /// Protocol-specific address, parsed by the owning driver
    pub address: String,
    /// Bit index (0..=15), bit-typed points only
    #[serde(default)]
    pub bit: Option<u8>,
    pub data_type: DataType,
    #[serde(default)]
    pub target: Option<TargetBinding>,
    #[serde(default)]
    pub sync: Option<SyncTarget>,
    #[serde(default)]
    pub log: Option<LogRule>,
}

impl PointMapping {
    pub fn new(
        point_id: impl Into<String>,
        device_id: impl Into<String>,
        address: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        Self {
            point_id: point_id.into(),
            device_id: device_id.into(),
            address: address.into(),
            bit: None,
            data_type,
            target: None,
            sync: None,
            log: None,
        }
    }

    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit = Some(bit);
        self
    }

    pub fn with_sync(mut self, sync: SyncTarget) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_log(mut self, log: LogRule) -> Self {
        self.log = Some(log);
        self
    }

    /// Sync configured and switched on, complete or not
    pub fn sync_requested(&self) -> bool {
        self.sync.as_ref().is_some_and(|s| s.enabled)
    }
}

/// Lookup key for an address string
pub fn address_key(address: &str) -> String {
    address.trim().to_uppercase()
}

fn default_true() -> bool {
    true
}
