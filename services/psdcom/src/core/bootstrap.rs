//! Service bootstrap and initialization
//!
//! Command line arguments, logging setup and the startup steps shared by the
//! service binary: loading configuration and building the driver registry.

use std::path::{Path, PathBuf};

use clap::Parser;
use common::logging::{self, LogConfig, LogGuard, LoggingError};
use common::service_bootstrap::ServiceInfo;
use tracing::{info, warn};

use crate::core::config::{ConfigLoader, EngineConfig};
use crate::core::drivers::DriverRegistry;
use crate::error::Result;

/// Command-line arguments for psdcom
#[derive(Parser, Debug, Clone)]
#[command(
    name = "psdcom",
    version = env!("CARGO_PKG_VERSION"),
    about = "Platform Screen Door Communication Service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "PSDCOM_CONFIG", default_value = "config/psdcom.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the configuration
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "psdcom",
        env!("CARGO_PKG_VERSION"),
        "Platform Screen Door Communication Service",
    )
}

/// Initialize logging from arguments and the service section
pub fn initialize_logging(
    args: &Args,
    config: &EngineConfig,
) -> std::result::Result<LogGuard, LoggingError> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.service.log_level.as_str());

    logging::init_with_config(LogConfig {
        service_name: config.service.name.clone(),
        log_dir: config.service.log_dir.clone(),
        level: logging::parse_level(level),
        enable_json: config.service.json_logs,
        ansi: !args.no_color,
    })
}

/// Load the configuration file
pub fn load_configuration(path: &Path) -> Result<EngineConfig> {
    ConfigLoader::load(path)
}

/// Log validation findings and return how many there were
pub fn report_findings(config: &EngineConfig) -> usize {
    let findings = config.validate();
    for finding in &findings {
        warn!("Configuration: {}", finding);
    }
    info!(
        "Configuration: {} device(s), {} point(s), {} finding(s)",
        config.devices.len(),
        config.points.len(),
        findings.len()
    );
    findings.len()
}

/// Build the driver registry: static factories, the plugin directory when
/// configured, then one default per factory kind not already provided.
///
/// A missing plugin directory is reported and the built-in drivers are used.
pub fn build_registry(config: &EngineConfig) -> DriverRegistry {
    let mut registry = DriverRegistry::with_builtin_factories();

    if let Some(dir) = config.engine.plugin_dir.as_deref() {
        match registry.load_all(Path::new(dir)) {
            Ok(report) => {
                if !report.warnings.is_empty() {
                    warn!("{} driver plugin(s) skipped", report.warnings.len());
                }
            },
            Err(e) => warn!("Driver plugins unavailable, using built-in drivers: {}", e),
        }
    }

    let defaults = registry.register_defaults();
    info!(
        "Driver registry ready: {} ({} built-in default(s))",
        registry.protocols().join(", "),
        defaults.loaded.len()
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineSettings;
    use crate::error::CommError;
    use tracing_test::traced_test;

    #[test]
    fn test_args_defaults_and_overrides() {
        let args = Args::parse_from(["psdcom"]);
        if std::env::var("PSDCOM_CONFIG").is_err() {
            assert_eq!(args.config, PathBuf::from("config/psdcom.yaml"));
        }
        assert!(args.log_level.is_none());
        assert!(!args.validate);

        let args = Args::parse_from(["psdcom", "-c", "/etc/psdcom.toml", "-l", "debug", "--validate"]);
        assert_eq!(args.config, PathBuf::from("/etc/psdcom.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.validate);
    }

    #[traced_test]
    #[test]
    fn test_missing_plugin_dir_falls_back_to_builtins() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            engine: EngineSettings {
                plugin_dir: Some(tmp.path().join("absent").display().to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let registry = build_registry(&config);
        assert!(registry.contains("MODBUS_TCP"));
        assert!(registry.contains("VIRTUAL"));
        assert!(logs_contain("Driver plugins unavailable"));
    }

    #[test]
    fn test_plugin_dir_adds_protocols() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("s7.yaml"),
            "kind: virtual\nprotocol: S7_TCP\n",
        )
        .unwrap();
        let config = EngineConfig {
            engine: EngineSettings {
                plugin_dir: Some(tmp.path().display().to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let registry = build_registry(&config);
        assert_eq!(registry.protocols(), ["S7_TCP", "MODBUS_TCP", "VIRTUAL"]);
    }

    #[test]
    fn test_load_configuration_reports_missing_file() {
        assert!(matches!(
            load_configuration(Path::new("/nonexistent/psdcom.yaml")),
            Err(CommError::ConfigError(_))
        ));
    }
}
