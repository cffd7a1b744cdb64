//! Engine output: decoded values for the business layer and log records
//! for the event store. Sinks are called from polling tasks and must not block.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::points::TypedValue;

/// Tracing target for point log records
pub const EVENT_TARGET: &str = "psd_events";

/// A value read in one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedValue {
    pub point_id: String,
    pub device_id: String,
    /// Bytes the value was decoded from
    pub raw: Vec<u8>,
    pub value: TypedValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    RisingEdge,
    FallingEdge,
    Deadband,
    HighAlarm,
    HighAlarmCleared,
    LowAlarm,
    LowAlarmCleared,
}

/// Structured log record for the external log store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub point_id: String,
    pub device_id: String,
    pub address: String,
    pub value: TypedValue,
    /// Value the change is measured against
    pub previous: Option<TypedValue>,
    pub reason: TriggerReason,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Value(DecodedValue),
    Log(LogRecord),
}

/// Consumer of engine output
pub trait EngineSink: Send + Sync {
    fn publish_value(&self, value: &DecodedValue);

    fn publish_log(&self, record: &LogRecord);
}

/// Writes events to the tracing pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EngineSink for TracingSink {
    fn publish_value(&self, value: &DecodedValue) {
        debug!(
            target: EVENT_TARGET,
            point = %value.point_id,
            device = %value.device_id,
            value = %value.value,
            "Point value"
        );
    }

    fn publish_log(&self, record: &LogRecord) {
        info!(
            target: EVENT_TARGET,
            point = %record.point_id,
            device = %record.device_id,
            address = %record.address,
            value = %record.value,
            reason = ?record.reason,
            "Point event"
        );
    }
}

/// Forwards events into a bounded channel; drops (and counts) when full
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<EngineEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!("Event channel full, {} event(s) dropped so far", dropped);
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event channel closed, event discarded");
            },
        }
    }
}

impl EngineSink for ChannelSink {
    fn publish_value(&self, value: &DecodedValue) {
        self.push(EngineEvent::Value(value.clone()));
    }

    fn publish_log(&self, record: &LogRecord) {
        self.push(EngineEvent::Log(record.clone()));
    }
}

/// Drain `rx` into `sink` until every sender is gone; returns the event count
pub async fn relay<S: EngineSink>(mut rx: mpsc::Receiver<EngineEvent>, sink: S) -> u64 {
    let mut relayed = 0;
    while let Some(event) = rx.recv().await {
        match &event {
            EngineEvent::Value(value) => sink.publish_value(value),
            EngineEvent::Log(record) => sink.publish_log(record),
        }
        relayed += 1;
    }
    debug!("Event relay finished after {} event(s)", relayed);
    relayed
}
