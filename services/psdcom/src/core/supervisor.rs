//! Communication supervisor
//!
//! Owns the engine: the driver registry, the live device sessions, the point
//! table and the evaluator state. Reloading rebuilds the point table and swaps
//! it in whole; a session is only restarted when its connection settings
//! changed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::config::DeviceConfig;
use crate::core::drivers::DriverRegistry;
use crate::core::evaluator::{Evaluator, ForwardWrite};
use crate::core::points::{BuildReport, PointMapping, PointTable, PointTableHandle};
use crate::core::session::{DeviceSession, SessionSettings, SessionStatus};
use crate::core::sink::EngineSink;
use crate::error::{CommError, Result};

/// State shared by every session task
pub(crate) struct EngineContext {
    pub(crate) table: PointTableHandle,
    pub(crate) evaluator: Evaluator,
    pub(crate) sink: Arc<dyn EngineSink>,
    pub(crate) sessions: DashMap<String, Arc<DeviceSession>>,
}

impl EngineContext {
    /// Hand a forward write to the target device's own session. Never
    /// waits: the target's writer task performs the write.
    pub(crate) fn forward(&self, write: ForwardWrite) {
        let Some(target) = self.sessions.get(&write.device_id) else {
            debug!(
                point = %write.source_point,
                "Forward skipped: {}",
                CommError::DeviceNotFound(write.device_id.clone())
            );
            return;
        };
        let (point, device) = (write.source_point.clone(), write.device_id.clone());
        if let Err(e) = target.enqueue_write(write) {
            // The next cycle forwards the value again
            debug!(point = %point, device = %device, "Forward deferred: {}", e);
        }
    }
}

/// What a reload changed
#[derive(Debug, Default, Clone)]
pub struct ReloadReport {
    pub build: BuildReport,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    /// Sessions whose method set changed without reconnecting
    pub updated: Vec<String>,
    /// Devices that could not get a session
    pub failed: Vec<(String, CommError)>,
}

pub struct CommunicationSupervisor {
    registry: Arc<DriverRegistry>,
    settings: SessionSettings,
    ctx: Arc<EngineContext>,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
}

impl std::fmt::Debug for CommunicationSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationSupervisor")
            .field("registry", &self.registry)
            .field("sessions", &self.ctx.sessions.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl CommunicationSupervisor {
    pub fn new(
        registry: Arc<DriverRegistry>,
        sink: Arc<dyn EngineSink>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry,
            settings,
            ctx: Arc::new(EngineContext {
                table: PointTableHandle::default(),
                evaluator: Evaluator::new(),
                sink,
                sessions: DashMap::new(),
            }),
            generation: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Current point table snapshot
    pub fn table(&self) -> Arc<PointTable> {
        self.ctx.table.load()
    }

    /// Build the point table and start a session per enabled device
    pub async fn start_all(
        &self,
        devices: &[DeviceConfig],
        points: &[PointMapping],
    ) -> ReloadReport {
        self.reload_configs(devices, points).await
    }

    /// Apply a new device list and point table without a full restart
    pub async fn reload_configs(
        &self,
        devices: &[DeviceConfig],
        points: &[PointMapping],
    ) -> ReloadReport {
        let _guard = self.reload_lock.lock().await;
        let mut report = ReloadReport::default();

        let wanted: HashMap<&str, &DeviceConfig> = devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| (d.id.as_str(), d))
            .collect();

        // Addresses of disabled devices still resolve so their points stay valid
        let protocols: HashMap<&str, &str> = devices
            .iter()
            .map(|d| (d.id.as_str(), d.protocol.as_str()))
            .collect();
        let registry = &self.registry;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (table, build) = PointTable::build(generation, points, |device, address, bit| {
            let protocol = protocols
                .get(device)
                .ok_or_else(|| CommError::DeviceNotFound(device.to_string()))?;
            registry.locate(protocol, address, bit)
        });
        let ids: HashSet<String> = table.points().map(|p| p.point_id().to_string()).collect();
        self.ctx.table.swap(table);
        self.ctx.evaluator.retain(|id| ids.contains(id));
        report.build = build;

        let current: Vec<String> = self.ctx.sessions.iter().map(|e| e.key().clone()).collect();
        for id in current {
            let Ok(session) = self.session(&id) else {
                continue;
            };
            match wanted.get(id.as_str()) {
                None => {
                    self.remove(&id).await;
                    report.stopped.push(id);
                },
                Some(device) if device.connection_changed(session.config()) => {
                    self.remove(&id).await;
                    match self.spawn(device).await {
                        Ok(()) => report.restarted.push(id),
                        Err(e) => report.failed.push((id, e)),
                    }
                },
                Some(device) => {
                    if session.update_methods(&device.methods) {
                        report.updated.push(id);
                    }
                },
            }
        }

        for (id, device) in &wanted {
            if self.ctx.sessions.contains_key(*id) {
                continue;
            }
            match self.spawn(device).await {
                Ok(()) => report.started.push(id.to_string()),
                Err(e) => report.failed.push((id.to_string(), e)),
            }
        }

        for (id, err) in &report.failed {
            warn!(device = %id, "No session: {}", err);
        }
        info!(
            "Configuration generation {} applied: {} points, {} started, {} stopped, {} restarted, {} updated",
            generation,
            report.build.indexed,
            report.started.len(),
            report.stopped.len(),
            report.restarted.len(),
            report.updated.len()
        );
        report
    }

    async fn spawn(&self, device: &DeviceConfig) -> Result<()> {
        let session = Arc::new(DeviceSession::new(
            device.clone(),
            &self.registry,
            self.settings.clone(),
            Arc::downgrade(&self.ctx),
        )?);
        self.ctx.sessions.insert(device.id.clone(), Arc::clone(&session));
        session.start().await;
        Ok(())
    }

    async fn remove(&self, device_id: &str) {
        if let Some((_, session)) = self.ctx.sessions.remove(device_id) {
            session.stop().await;
        }
    }

    fn session(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        self.ctx
            .sessions
            .get(device_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CommError::DeviceNotFound(device_id.to_string()))
    }

    /// Start a stopped session
    pub async fn start(&self, device_id: &str) -> Result<()> {
        self.session(device_id)?.start().await;
        Ok(())
    }

    /// Stop a session; it stays registered and can be started again
    pub async fn stop(&self, device_id: &str) -> Result<()> {
        self.session(device_id)?.stop().await;
        Ok(())
    }

    /// Run an on-demand method once
    pub async fn invoke(&self, device_id: &str, method: &str) -> Result<Vec<u8>> {
        self.session(device_id)?.invoke(method).await
    }

    pub fn status(&self, device_id: &str) -> Result<SessionStatus> {
        Ok(self.session(device_id)?.status())
    }

    /// Status of every session, ordered by device id
    pub fn statuses(&self) -> Vec<SessionStatus> {
        let mut all: Vec<SessionStatus> = self.ctx.sessions.iter().map(|s| s.status()).collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// Stop and drop every session
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        let ids: Vec<String> = self.ctx.sessions.iter().map(|e| e.key().clone()).collect();
        info!("Stopping {} session(s)", ids.len());
        for id in ids {
            self.remove(&id).await;
        }
    }
}
