//! Synchronization and logging evaluator
//!
//! Keeps the last observed value per point and turns each new value into
//! log records and an optional forward write:
//! - the first value of a point only primes state (no triggers)
//! - boolean edges are filtered by the point's trigger state
//! - analog changes are measured against the last logged value and must
//!   reach the deadband; high/low limits raise and clear alarms
//! - sync forwards every observed value; the target session skips writes
//!   it already completed, so a missed write is repaired on the next cycle

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::points::{LogRule, PointLocation, ResolvedPoint, SyncMode, TypedValue};
use crate::core::sink::{LogRecord, TriggerReason};
use crate::error::CommError;

/// A value to write to another device on behalf of a point
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardWrite {
    pub source_point: String,
    pub device_id: String,
    pub address: String,
    pub location: PointLocation,
    pub value: TypedValue,
}

/// Outcome of evaluating one new value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub first_observation: bool,
    pub changed: bool,
    pub logs: Vec<LogRecord>,
    pub forward: Option<ForwardWrite>,
    /// Forwarding skipped because of a configuration error
    pub sync_error: Option<CommError>,
}

impl Evaluation {
    /// New information for the business layer
    pub fn is_update(&self) -> bool {
        self.first_observation || self.changed
    }
}

#[derive(Debug, Clone)]
struct PointState {
    last_value: TypedValue,
    /// Analog deadband baseline
    last_logged: TypedValue,
    high_active: bool,
    low_active: bool,
}

impl PointState {
    fn prime(value: TypedValue, rule: Option<&LogRule>) -> Self {
        let n = value.as_f64();
        Self {
            last_value: value,
            last_logged: value,
            high_active: rule.and_then(|r| r.high_limit).is_some_and(|h| n >= h),
            low_active: rule.and_then(|r| r.low_limit).is_some_and(|l| n <= l),
        }
    }
}

#[derive(Debug, Default)]
pub struct Evaluator {
    states: DashMap<String, PointState>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &self,
        point: &ResolvedPoint,
        value: TypedValue,
        timestamp: DateTime<Utc>,
    ) -> Evaluation {
        let mapping = &point.mapping;
        let rule = mapping.log.as_ref().filter(|r| r.enabled);
        let mut eval = Evaluation::default();

        match self.states.entry(mapping.point_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(PointState::prime(value, rule));
                eval.first_observation = true;
            },
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                let old = state.last_value;
                eval.changed = old != value;

                if let Some(rule) = rule {
                    let mut emit = |reason, previous| {
                        eval.logs.push(LogRecord {
                            point_id: mapping.point_id.clone(),
                            device_id: mapping.device_id.clone(),
                            address: mapping.address.clone(),
                            value,
                            previous: Some(previous),
                            reason,
                            timestamp,
                        })
                    };

                    if mapping.data_type.is_bool() {
                        if let (Some(was), Some(now)) = (old.as_bool(), value.as_bool()) {
                            if rule.trigger.fires(was, now) {
                                let reason = if now {
                                    TriggerReason::RisingEdge
                                } else {
                                    TriggerReason::FallingEdge
                                };
                                emit(reason, old);
                            }
                        }
                    } else {
                        let n = value.as_f64();
                        let delta = (n - state.last_logged.as_f64()).abs();
                        let deadband = rule.deadband.unwrap_or(0.0);
                        let loggable = if deadband > 0.0 {
                            delta >= deadband
                        } else {
                            delta > 0.0
                        };
                        if loggable {
                            emit(TriggerReason::Deadband, state.last_logged);
                            state.last_logged = value;
                        }

                        if let Some(high) = rule.high_limit {
                            let active = n >= high;
                            if active != state.high_active {
                                state.high_active = active;
                                let reason = if active {
                                    TriggerReason::HighAlarm
                                } else {
                                    TriggerReason::HighAlarmCleared
                                };
                                emit(reason, old);
                            }
                        }
                        if let Some(low) = rule.low_limit {
                            let active = n <= low;
                            if active != state.low_active {
                                state.low_active = active;
                                let reason = if active {
                                    TriggerReason::LowAlarm
                                } else {
                                    TriggerReason::LowAlarmCleared
                                };
                                emit(reason, old);
                            }
                        }
                    }
                }

                state.last_value = value;
            },
        }

        if let Some(sync) = point.sync.as_ref() {
            let forwarded = match sync.mode {
                SyncMode::Direct => Some(value),
                SyncMode::Inverted => match value.as_bool() {
                    Some(b) => Some(TypedValue::Bool(!b)),
                    None => {
                        // Reported once per change, not every cycle
                        if eval.is_update() {
                            eval.sync_error = Some(CommError::SyncModeInvalidForType {
                                point_id: mapping.point_id.clone(),
                                data_type: mapping.data_type.to_string(),
                            });
                        }
                        None
                    },
                },
            };
            eval.forward = forwarded.map(|value| ForwardWrite {
                source_point: mapping.point_id.clone(),
                device_id: sync.device_id.clone(),
                address: sync.address.clone(),
                location: sync.location,
                value,
            });
        }

        eval
    }

    pub fn last_value(&self, point_id: &str) -> Option<TypedValue> {
        self.states.get(point_id).map(|s| s.last_value)
    }

    /// Drop state of points no longer configured
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.states.retain(|id, _| keep(id));
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
