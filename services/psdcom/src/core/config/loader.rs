//! Configuration loading
//!
//! Layering, lowest to highest priority:
//! 1. Built-in defaults
//! 2. Configuration file (YAML, TOML or JSON by extension)
//! 3. Environment variables `PSDCOM_*`, nested keys split on `__`
//!    (e.g. `PSDCOM_ENGINE__TRANSFER_TIMEOUT_MS=500`)
//!
//! A `points_file` CSV is read afterwards and appended to the inline points.

use std::path::Path;

use common::config_loader::resolve_relative;
use csv::{ReaderBuilder, Trim};
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::Deserialize;
use tracing::{debug, info};

use super::types::EngineConfig;
use crate::core::points::{
    DataType, LogRule, PointMapping, SyncMode, SyncTarget, TargetBinding, TriggerState,
};
use crate::error::{CommError, Result};

pub const ENV_PREFIX: &str = "PSDCOM_";

/// One row of the CSV point table
#[derive(Debug, Deserialize)]
struct PointRow {
    point_id: String,
    device_id: String,
    address: String,
    bit: Option<u8>,
    data_type: DataType,
    object_type: Option<String>,
    object_key: Option<String>,
    sub_key: Option<String>,
    sync_device: Option<String>,
    sync_address: Option<String>,
    sync_bit: Option<u8>,
    sync_mode: Option<SyncMode>,
    log_enabled: Option<bool>,
    trigger: Option<TriggerState>,
    deadband: Option<f64>,
    high_limit: Option<f64>,
    low_limit: Option<f64>,
}

impl From<PointRow> for PointMapping {
    fn from(row: PointRow) -> Self {
        let target = match (row.object_type, row.object_key) {
            (Some(object_type), Some(object_key)) => Some(TargetBinding {
                object_type,
                object_key,
                sub_key: row.sub_key,
            }),
            _ => None,
        };

        let sync = (row.sync_device.is_some() || row.sync_address.is_some() || row.sync_mode.is_some())
            .then(|| SyncTarget {
                enabled: true,
                device_id: row.sync_device,
                address: row.sync_address,
                bit: row.sync_bit,
                mode: row.sync_mode.unwrap_or_default(),
            });

        let has_rule = row.log_enabled.is_some()
            || row.trigger.is_some()
            || row.deadband.is_some()
            || row.high_limit.is_some()
            || row.low_limit.is_some();
        let log = has_rule.then(|| LogRule {
            enabled: row.log_enabled.unwrap_or(true),
            trigger: row.trigger.unwrap_or_default(),
            deadband: row.deadband,
            high_limit: row.high_limit,
            low_limit: row.low_limit,
        });

        PointMapping {
            point_id: row.point_id,
            device_id: row.device_id,
            address: row.address,
            bit: row.bit,
            data_type: row.data_type,
            target,
            sync,
            log,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the engine configuration from `path` plus environment overrides
    pub fn load(path: &Path) -> Result<EngineConfig> {
        if !path.is_file() {
            return Err(CommError::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        let figment = match extension.as_str() {
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "json" => figment.merge(Json::file(path)),
            other => {
                return Err(CommError::config(format!(
                    "unsupported configuration format '{}'",
                    other
                )))
            },
        };

        let mut config: EngineConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        let base = path.parent();
        if let Some(dir) = config.engine.plugin_dir.as_deref() {
            config.engine.plugin_dir = Some(resolve_relative(base, dir).display().to_string());
        }
        if let Some(file) = config.points_file.as_deref() {
            let csv_path = resolve_relative(base, file);
            let points = Self::load_points_csv(&csv_path)?;
            info!("Loaded {} point(s) from {}", points.len(), csv_path.display());
            config.points.extend(points);
        }

        debug!(
            "Configuration loaded from {}: {} device(s), {} point(s)",
            path.display(),
            config.devices.len(),
            config.points.len()
        );
        Ok(config)
    }

    /// Read a CSV point table with a header row
    pub fn load_points_csv(path: &Path) -> Result<Vec<PointMapping>> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .from_path(path)
            .map_err(|e| {
                CommError::config(format!("failed to open point table {}: {}", path.display(), e))
            })?;

        let mut points = Vec::new();
        for (index, row) in reader.deserialize::<PointRow>().enumerate() {
            let row = row.map_err(|e| {
                CommError::config(format!(
                    "point table {} row {}: {}",
                    path.display(),
                    index + 2,
                    e
                ))
            })?;
            points.push(PointMapping::from(row));
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const YAML: &str = r#"
service:
  name: psdcom-test
  log_level: debug
engine:
  plugin_dir: drivers
  transfer_timeout_ms: 500
devices:
  - id: psc
    protocol: MODBUS_TCP
    parameters:
      - { name: IP, value: 10.0.0.5 }
      - { name: Port, value: "1502" }
  - id: psl
    protocol: VIRTUAL
    enabled: false
points:
  - point_id: door1
    device_id: psc
    address: HR10
    bit: 3
    data_type: bool
    log: { trigger: onTrue }
points_file: points.csv
"#;

    const CSV: &str = "\
point_id,device_id,address,bit,data_type,object_type,object_key,sub_key,sync_device,sync_address,sync_bit,sync_mode,log_enabled,trigger,deadband,high_limit,low_limit
door2, psc, HR10, 4, Bool, Door, D02, open, psl, DB1.0, 2, inverted, true, onFalse, , ,
voltage,psc,IR:0,,Float,Panel,P1,,,,,,,,0.5,250,180
";

    fn write_config(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("psdcom.yaml");
        fs::write(&path, YAML).unwrap();
        fs::write(dir.join("points.csv"), CSV).unwrap();
        path
    }

    #[test]
    fn test_load_yaml_with_csv_points() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load(&write_config(tmp.path())).unwrap();

        assert_eq!(config.service.name, "psdcom-test");
        assert_eq!(config.engine.transfer_timeout_ms, 500);
        assert_eq!(config.engine.open_timeout_ms, 5000);
        assert_eq!(
            config.engine.plugin_dir.as_deref().map(Path::new),
            Some(tmp.path().join("drivers").as_path())
        );
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].parameters[1].value, "1502");
        assert!(!config.devices[1].enabled);

        assert_eq!(config.points.len(), 3);
        assert_eq!(
            config.points[0].log.as_ref().unwrap().trigger,
            TriggerState::OnTrue
        );

        let door2 = &config.points[1];
        assert_eq!(door2.device_id, "psc");
        assert_eq!(door2.bit, Some(4));
        let sync = door2.sync.as_ref().unwrap();
        assert_eq!(sync.mode, SyncMode::Inverted);
        assert_eq!(sync.bit, Some(2));
        assert_eq!(door2.target.as_ref().unwrap().sub_key.as_deref(), Some("open"));
        assert_eq!(door2.log.as_ref().unwrap().trigger, TriggerState::OnFalse);

        let voltage = &config.points[2];
        assert_eq!(voltage.data_type, DataType::Float);
        assert!(voltage.sync.is_none());
        let rule = voltage.log.as_ref().unwrap();
        assert_eq!(rule.deadband, Some(0.5));
        assert_eq!(rule.high_limit, Some(250.0));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_bad_csv_row_names_the_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("points.csv");
        fs::write(
            &path,
            "point_id,device_id,address,data_type\nok,psc,HR1,Int16\nbad,psc,HR2,complex\n",
        )
        .unwrap();

        let err = ConfigLoader::load_points_csv(&path).unwrap_err();
        assert!(matches!(err, CommError::ConfigError(ref m) if m.contains("row 3")), "{err}");
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConfigLoader::load(&tmp.path().join("absent.yaml")),
            Err(CommError::ConfigError(_))
        ));

        let ini = tmp.path().join("psdcom.ini");
        fs::write(&ini, "[service]").unwrap();
        assert!(matches!(
            ConfigLoader::load(&ini),
            Err(CommError::ConfigError(m)) if m.contains("unsupported")
        ));
    }

    #[test]
    fn test_toml_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("psdcom.toml");
        fs::write(
            &path,
            "[engine]\nopen_timeout_ms = 750\n\n[[devices]]\nid = \"sim\"\nprotocol = \"VIRTUAL\"\n",
        )
        .unwrap();

        let config = ConfigLoader::load(&path).unwrap();
        assert_eq!(config.engine.open_timeout_ms, 750);
        assert_eq!(config.devices[0].id, "sim");
        assert!(config.points.is_empty());
    }
}
