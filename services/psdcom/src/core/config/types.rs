//! Configuration types

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::drivers::{MethodDescriptor, MethodMode, Parameter};
use crate::core::points::{PointMapping, SyncMode};
use crate::core::session::SessionSettings;
use crate::runtime::ReconnectPolicy;

/// Top level service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Inline point mappings
    #[serde(default)]
    pub points: Vec<PointMapping>,
    /// CSV point table, relative to the configuration file
    #[serde(default)]
    pub points_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for rolling log files; console only when absent
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Directory of driver manifests
    #[serde(default)]
    pub plugin_dir: Option<String>,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,
    /// Capacity of the event channel when events go to a channel sink
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            transfer_timeout_ms: default_transfer_timeout(),
            open_timeout_ms: default_open_timeout(),
            event_buffer: default_event_buffer(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            reconnect: self.reconnect.policy(),
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(
            self.initial_delay_ms,
            self.max_delay_ms,
            self.multiplier,
            self.jitter,
        )
    }
}

/// One physical device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Protocol key resolved through the driver registry
    pub protocol: String,
    /// Ordered connection parameters
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Device specific methods layered over the driver's
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            protocol: protocol.into(),
            parameters: Vec::new(),
            methods: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Protocol or connection parameters differ; the session must reconnect
    pub fn connection_changed(&self, other: &DeviceConfig) -> bool {
        !self.protocol.trim().eq_ignore_ascii_case(other.protocol.trim())
            || self.parameters != other.parameters
    }
}

impl EngineConfig {
    /// Save-time checks. Every finding is non-fatal; the engine starts and
    /// degrades the affected unit only.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                findings.push(format!("duplicate device id '{}'", device.id));
            }
            if device.protocol.trim().is_empty() {
                findings.push(format!("device '{}' has no protocol", device.id));
            }
            for method in &device.methods {
                if method.mode == MethodMode::Polling && method.interval_ms == 0 {
                    findings.push(format!(
                        "device '{}': polling method '{}' has interval 0",
                        device.id, method.name
                    ));
                }
            }
        }

        let mut point_ids = HashSet::new();
        for point in &self.points {
            if !point_ids.insert(point.point_id.as_str()) {
                findings.push(format!("duplicate point id '{}'", point.point_id));
            }
            if !device_ids.contains(point.device_id.as_str()) {
                findings.push(format!(
                    "point '{}' references unknown device '{}'",
                    point.point_id, point.device_id
                ));
            }
            if let Some(sync) = point.sync.as_ref().filter(|s| s.enabled) {
                if !sync.is_complete() {
                    findings.push(format!(
                        "point '{}': sync enabled without target device and address",
                        point.point_id
                    ));
                } else if sync
                    .device_id
                    .as_deref()
                    .is_some_and(|d| !device_ids.contains(d))
                {
                    findings.push(format!(
                        "point '{}': sync target device unknown",
                        point.point_id
                    ));
                }
                if sync.mode == SyncMode::Inverted && !point.data_type.is_bool() {
                    findings.push(format!(
                        "point '{}': inverted sync on {} point",
                        point.point_id, point.data_type
                    ));
                }
            }
            if let Some(bit) = point.bit.filter(|b| *b > 15) {
                findings.push(format!("point '{}': bit {} out of range", point.point_id, bit));
            }
        }

        findings
    }
}

fn default_service_name() -> String {
    "psdcom".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_transfer_timeout() -> u64 {
    3000
}

fn default_open_timeout() -> u64 {
    5000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}
