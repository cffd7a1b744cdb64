//! Point mapping table
//!
//! Immutable index of resolved points, grouped by device then address (for
//! lookups) and by device then block (for poll dispatch). A rebuild produces a
//! new table that is swapped in whole through [`PointTableHandle`]; readers
//! keep the snapshot they loaded until they drop it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use super::mapping::{address_key, PointLocation, PointMapping, SyncMode};
use crate::error::{CommError, Result};

/// Forwarding target after address resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSync {
    pub device_id: String,
    pub address: String,
    pub location: PointLocation,
    pub mode: SyncMode,
}

/// A point whose address parsed for its device's protocol
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPoint {
    pub mapping: PointMapping,
    pub location: PointLocation,
    /// `None` when sync is off, incomplete or unresolvable
    pub sync: Option<ResolvedSync>,
}

impl ResolvedPoint {
    pub fn point_id(&self) -> &str {
        &self.mapping.point_id
    }

    pub fn device_id(&self) -> &str {
        &self.mapping.device_id
    }

    /// Bit within the located byte; 0 for non-bit points
    pub fn bit(&self) -> u8 {
        self.location.bit.unwrap_or(0)
    }
}

/// Outcome of a table build
#[derive(Debug, Default, Clone)]
pub struct BuildReport {
    /// Points that made it into the index
    pub indexed: usize,
    /// Configuration anomalies found while building, one per affected point
    pub anomalies: Vec<CommError>,
}

type Bucket = Vec<Arc<ResolvedPoint>>;

#[derive(Debug, Default)]
pub struct PointTable {
    generation: u64,
    by_address: HashMap<String, HashMap<String, Bucket>>,
    by_block: HashMap<String, HashMap<u16, Bucket>>,
    by_id: HashMap<String, Arc<ResolvedPoint>>,
}

impl PointTable {
    /// Build a table from configured mappings.
    ///
    /// `resolve(device_id, address, bit)` parses an address with the owning
    /// device's driver. Points that fail to resolve are left out; incomplete
    /// or unresolvable sync targets only disable sync for that point. Every
    /// anomaly is logged once here.
    pub fn build<F>(generation: u64, mappings: &[PointMapping], resolve: F) -> (Self, BuildReport)
    where
        F: Fn(&str, &str, Option<u8>) -> Result<PointLocation>,
    {
        let mut table = PointTable {
            generation,
            ..Default::default()
        };
        let mut report = BuildReport::default();
        let mut seen = HashSet::new();

        for mapping in mappings {
            if !seen.insert(mapping.point_id.clone()) {
                report.anomalies.push(CommError::config(format!(
                    "duplicate point id '{}', later definition ignored",
                    mapping.point_id
                )));
                continue;
            }

            let location = match resolve(&mapping.device_id, &mapping.address, mapping.bit) {
                Ok(loc) => normalize(loc, mapping),
                Err(e) => {
                    report.anomalies.push(e);
                    continue;
                },
            };

            let sync = resolve_sync(mapping, &resolve, &mut report);

            let point = Arc::new(ResolvedPoint {
                mapping: mapping.clone(),
                location,
                sync,
            });
            table.insert(point);
            report.indexed += 1;
        }

        for buckets in table.by_block.values_mut() {
            for bucket in buckets.values_mut() {
                bucket.sort_by_key(|p| (p.location.offset, p.location.bit));
            }
        }

        for anomaly in &report.anomalies {
            warn!("Point table build: {}", anomaly);
        }
        debug!(
            "Point table generation {} built: {} points, {} anomalies",
            generation,
            report.indexed,
            report.anomalies.len()
        );

        (table, report)
    }

    fn insert(&mut self, point: Arc<ResolvedPoint>) {
        let device = point.device_id().to_string();
        self.by_address
            .entry(device.clone())
            .or_default()
            .entry(address_key(&point.mapping.address))
            .or_default()
            .push(Arc::clone(&point));
        self.by_block
            .entry(device)
            .or_default()
            .entry(point.location.block)
            .or_default()
            .push(Arc::clone(&point));
        self.by_id.insert(point.point_id().to_string(), point);
    }

    /// All points configured at `address` on `device_id`
    pub fn lookup(&self, device_id: &str, address: &str) -> &[Arc<ResolvedPoint>] {
        self.by_address
            .get(device_id)
            .and_then(|m| m.get(&address_key(address)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Points of `device_id` located in `block`, ordered by offset
    pub fn points_for_block(&self, device_id: &str, block: u16) -> &[Arc<ResolvedPoint>] {
        self.by_block
            .get(device_id)
            .and_then(|m| m.get(&block))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, point_id: &str) -> Option<&Arc<ResolvedPoint>> {
        self.by_id.get(point_id)
    }

    pub fn contains(&self, point_id: &str) -> bool {
        self.by_id.contains_key(point_id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &Arc<ResolvedPoint>> {
        self.by_id.values()
    }
}

fn normalize(mut loc: PointLocation, mapping: &PointMapping) -> PointLocation {
    loc.bit = if mapping.data_type.is_bool() {
        Some(loc.bit.unwrap_or(0))
    } else {
        None
    };
    loc
}

fn resolve_sync<F>(
    mapping: &PointMapping,
    resolve: &F,
    report: &mut BuildReport,
) -> Option<ResolvedSync>
where
    F: Fn(&str, &str, Option<u8>) -> Result<PointLocation>,
{
    let sync = mapping.sync.as_ref().filter(|s| s.enabled)?;

    let Some((device_id, address)) = sync.target() else {
        report.anomalies.push(incomplete_sync(mapping));
        return None;
    };

    match resolve(device_id, address, sync.bit) {
        Ok(mut location) => {
            if mapping.data_type.is_bool() {
                location.bit = Some(location.bit.unwrap_or(0));
            }
            Some(ResolvedSync {
                device_id: device_id.to_string(),
                address: address.to_string(),
                location,
                mode: sync.mode,
            })
        },
        Err(e) => {
            report.anomalies.push(CommError::config(format!(
                "point '{}': sync target unusable, sync disabled: {}",
                mapping.point_id, e
            )));
            None
        },
    }
}

fn incomplete_sync(mapping: &PointMapping) -> CommError {
    CommError::config(format!(
        "point '{}': sync enabled without target device and address, sync disabled",
        mapping.point_id
    ))
}

/// Atomically swappable handle to the current [`PointTable`]
#[derive(Debug)]
pub struct PointTableHandle {
    inner: ArcSwap<PointTable>,
}

impl PointTableHandle {
    pub fn new(table: PointTable) -> Self {
        Self {
            inner: ArcSwap::from_pointee(table),
        }
    }

    /// Snapshot of the current table; stays valid across a concurrent swap
    pub fn load(&self) -> Arc<PointTable> {
        self.inner.load_full()
    }

    /// Replace the whole table, returning the previous one
    pub fn swap(&self, table: PointTable) -> Arc<PointTable> {
        self.inner.swap(Arc::new(table))
    }
}

impl Default for PointTableHandle {
    fn default() -> Self {
        Self::new(PointTable::default())
    }
}
