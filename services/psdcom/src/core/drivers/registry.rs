//! Driver registry
//!
//! Maps protocol keys to driver factories. Statically linked factories are
//! registered by kind; a plugin directory of YAML manifests then decides which
//! protocol keys exist and how each is preconfigured:
//!
//! ```yaml
//! kind: virtual
//! protocol: S7_TCP
//! description: S7 panel controller simulation
//! parameters:
//!   - { name: Blocks, value: "1:64" }
//! methods: []
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::modbus_tcp::ModbusTcpFactory;
use super::traits::{MethodDescriptor, Parameter, ProtocolDriver};
use super::virt::VirtualFactory;
use crate::core::points::PointLocation;
use crate::error::{CommError, Result};

/// Plugin manifest: which factory to use and how to preconfigure it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverManifest {
    /// Factory kind (`modbus_tcp`, `virtual`, ...)
    pub kind: String,
    /// Protocol key override; the driver default applies when absent
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Parameters applied to every instance before device parameters
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Methods layered over the driver's defaults
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

impl DriverManifest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            protocol: None,
            description: String::new(),
            parameters: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Protocol key from the manifest, or `default` when unset
    pub fn protocol_or(&self, default: &str) -> String {
        self.protocol
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(default)
            .to_string()
    }
}

/// Creates driver instances of one kind
pub trait DriverFactory: Send + Sync {
    fn kind(&self) -> &str;

    fn create(&self, manifest: &DriverManifest) -> Result<Box<dyn ProtocolDriver>>;
}

/// Factory backed by a closure
pub struct FnDriverFactory<F> {
    kind: String,
    create: F,
}

impl<F> FnDriverFactory<F>
where
    F: Fn(&DriverManifest) -> Result<Box<dyn ProtocolDriver>> + Send + Sync,
{
    pub fn new(kind: impl Into<String>, create: F) -> Self {
        Self {
            kind: kind.into(),
            create,
        }
    }
}

impl<F> DriverFactory for FnDriverFactory<F>
where
    F: Fn(&DriverManifest) -> Result<Box<dyn ProtocolDriver>> + Send + Sync,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn create(&self, manifest: &DriverManifest) -> Result<Box<dyn ProtocolDriver>> {
        (self.create)(manifest)
    }
}

struct RegisteredDriver {
    manifest: DriverManifest,
    factory: Arc<dyn DriverFactory>,
    /// Unconnected instance used for address parsing
    prototype: Box<dyn ProtocolDriver>,
    source: String,
}

/// Result of a directory scan
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    /// Protocol keys registered by this load, in load order
    pub loaded: Vec<String>,
    /// Non-fatal problems: duplicates, bad manifests, failed instantiation
    pub warnings: Vec<CommError>,
}

impl LoadReport {
    fn warn(&mut self, source: &str, err: CommError) {
        warn!("Driver plugin {}: {}", source, err);
        self.warnings.push(err);
    }
}

#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
    drivers: HashMap<String, RegisteredDriver>,
    order: Vec<String>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("DriverRegistry")
            .field("factories", &kinds)
            .field("protocols", &self.order)
            .finish()
    }
}

fn key_of(protocol: &str) -> String {
    protocol.trim().to_uppercase()
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the statically linked factories
    pub fn with_builtin_factories() -> Self {
        let mut registry = Self::new();
        registry.register_factory(ModbusTcpFactory);
        registry.register_factory(VirtualFactory);
        registry
    }

    /// Register a factory; a later factory of the same kind replaces the earlier
    pub fn register_factory(&mut self, factory: impl DriverFactory + 'static) {
        let kind = factory.kind().trim().to_lowercase();
        if self.factories.contains_key(&kind) {
            warn!("Replacing driver factory for kind {}", kind);
        } else {
            debug!("Registered driver factory: {}", kind);
        }
        self.factories.insert(kind, Arc::new(factory));
    }

    fn instantiate(
        &self,
        manifest: &DriverManifest,
    ) -> Result<(Arc<dyn DriverFactory>, Box<dyn ProtocolDriver>)> {
        let factory = self
            .factories
            .get(&manifest.kind.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| CommError::UnknownProtocol(format!("driver kind '{}'", manifest.kind)))?;
        let mut driver = factory.create(manifest)?;
        driver.initialize(&manifest.parameters);
        Ok((factory, driver))
    }

    /// Instantiate `manifest` and index it under the instance's protocol key.
    ///
    /// Fails with `DuplicateProtocolKey` when the key is taken (first wins) and
    /// `PluginLoadFailed` when the factory is missing or refuses the manifest.
    pub fn register(&mut self, manifest: DriverManifest, source: &str) -> Result<String> {
        let (factory, prototype) = self
            .instantiate(&manifest)
            .map_err(|e| CommError::plugin_load(source, e))?;

        let key = key_of(prototype.protocol_key());
        if key.is_empty() {
            return Err(CommError::plugin_load(source, "driver reported an empty protocol key"));
        }
        if let Some(existing) = self.drivers.get(&key) {
            debug!("{} already provided by {}", key, existing.source);
            return Err(CommError::DuplicateProtocolKey(key));
        }

        info!(
            "Registered driver {} (kind {}) from {}",
            key, manifest.kind, source
        );
        self.order.push(key.clone());
        self.drivers.insert(
            key.clone(),
            RegisteredDriver {
                manifest,
                factory,
                prototype,
                source: source.to_string(),
            },
        );
        Ok(key)
    }

    /// Scan `dir` for `*.yaml`/`*.yml` manifests in file name order.
    ///
    /// A missing directory is `DirectoryNotFound`; everything else that goes
    /// wrong with a single manifest is a warning in the report.
    pub fn load_all(&mut self, dir: &Path) -> Result<LoadReport> {
        if !dir.is_dir() {
            return Err(CommError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            })
            .collect();
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut report = LoadReport::default();
        for path in paths {
            let source = path.display().to_string();
            let manifest = match std::fs::read_to_string(&path)
                .map_err(CommError::from)
                .and_then(|text| serde_yaml::from_str::<DriverManifest>(&text).map_err(CommError::from))
            {
                Ok(m) => m,
                Err(e) => {
                    report.warn(&source, CommError::plugin_load(&source, e));
                    continue;
                },
            };

            match self.register(manifest, &source) {
                Ok(key) => report.loaded.push(key),
                Err(e) => report.warn(&source, e),
            }
        }

        info!(
            "Loaded {} driver(s) from {} ({} warning(s))",
            report.loaded.len(),
            dir.display(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Register one default manifest per factory kind, skipping keys that a
    /// plugin directory already provided.
    pub fn register_defaults(&mut self) -> LoadReport {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();

        let mut report = LoadReport::default();
        for kind in kinds {
            let source = format!("builtin:{}", kind);
            match self.register(DriverManifest::new(kind), &source) {
                Ok(key) => report.loaded.push(key),
                Err(CommError::DuplicateProtocolKey(key)) => {
                    debug!("{} already registered, builtin default skipped", key)
                },
                Err(e) => report.warn(&source, e),
            }
        }
        report
    }

    /// Fresh, unshared driver for `protocol` (case-insensitive)
    pub fn create(&self, protocol: &str) -> Result<Box<dyn ProtocolDriver>> {
        let entry = self
            .drivers
            .get(&key_of(protocol))
            .ok_or_else(|| CommError::UnknownProtocol(protocol.to_string()))?;
        let mut driver = entry.factory.create(&entry.manifest)?;
        driver.initialize(&entry.manifest.parameters);
        Ok(driver)
    }

    /// Parse `address` with the rules of `protocol`
    pub fn locate(&self, protocol: &str, address: &str, bit: Option<u8>) -> Result<PointLocation> {
        self.drivers
            .get(&key_of(protocol))
            .ok_or_else(|| CommError::UnknownProtocol(protocol.to_string()))?
            .prototype
            .locate(address, bit)
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.drivers.contains_key(&key_of(protocol))
    }

    /// Registered protocol keys in registration order
    pub fn protocols(&self) -> &[String] {
        &self.order
    }

    pub fn manifest(&self, protocol: &str) -> Option<&DriverManifest> {
        self.drivers.get(&key_of(protocol)).map(|d| &d.manifest)
    }
}
