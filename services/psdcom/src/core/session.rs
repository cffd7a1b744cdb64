//! Device session
//!
//! One session owns one driver instance for one device and runs its
//! lifecycle: `Stopped -> Opening -> Running -> (Closing -> Stopped |
//! Faulted -> Opening)`. While running, every enabled `Startup` method runs
//! once and every enabled `Polling` method gets its own task. All driver I/O
//! goes through a single async mutex scoped to the driver, bounded by the
//! transfer timeout.
//!
//! Writes forwarded from other devices land in a bounded queue drained by a
//! writer task of this session, so a slow or disconnected device never holds
//! up the polling of the device the value came from.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::DeviceConfig;
use crate::core::drivers::{
    merge_methods, DriverRegistry, MethodDescriptor, MethodMode, ProtocolDriver, RawRequest,
};
use crate::core::evaluator::ForwardWrite;
use crate::core::points::{decode, encode, ByteOrder, PointLocation, TypedValue};
use crate::core::sink::DecodedValue;
use crate::core::supervisor::EngineContext;
use crate::error::{CommError, Result};
use crate::runtime::{Backoff, ReconnectPolicy};

/// Forward writes buffered per session while its writer is busy or offline
const WRITE_QUEUE_DEPTH: usize = 64;

/// Timing applied to every session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub transfer_timeout: Duration,
    pub open_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_millis(3000),
            open_timeout: Duration::from_millis(5000),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Opening,
    Running,
    Closing,
    Faulted,
}

/// Per-device connectivity snapshot for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub device_id: String,
    pub protocol: String,
    pub state: SessionState,
    pub connected: bool,
    pub last_error: Option<String>,
    /// Consecutive failed connection attempts
    pub attempts: u32,
    /// Time of the last state transition
    pub since: DateTime<Utc>,
}

struct SessionInner {
    device: DeviceConfig,
    driver: Mutex<Box<dyn ProtocolDriver>>,
    byte_order: ByteOrder,
    settings: SessionSettings,
    status: RwLock<SessionStatus>,
    ctx: Weak<EngineContext>,
    writes_tx: mpsc::Sender<ForwardWrite>,
    writes_rx: Mutex<mpsc::Receiver<ForwardWrite>>,
}

struct Control {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct DeviceSession {
    inner: Arc<SessionInner>,
    control: Mutex<Control>,
    base_methods: Vec<MethodDescriptor>,
    methods_tx: watch::Sender<Vec<MethodDescriptor>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.inner.device.id)
            .field("protocol", &self.inner.device.protocol)
            .field("state", &self.inner.status.read().state)
            .finish()
    }
}

enum RunExit {
    Cancelled,
    Fault(CommError),
}

impl DeviceSession {
    /// Create a stopped session with a fresh driver configured for `device`
    pub(crate) fn new(
        device: DeviceConfig,
        registry: &DriverRegistry,
        settings: SessionSettings,
        ctx: Weak<EngineContext>,
    ) -> Result<Self> {
        let mut driver = registry.create(&device.protocol)?;
        driver.initialize(&device.parameters);

        let base_methods = driver.list_methods();
        let methods = merge_methods(base_methods.clone(), &device.methods);
        let (methods_tx, _) = watch::channel(methods);

        let status = SessionStatus {
            device_id: device.id.clone(),
            protocol: driver.protocol_key().to_string(),
            state: SessionState::Stopped,
            connected: false,
            last_error: None,
            attempts: 0,
            since: Utc::now(),
        };

        let (writes_tx, writes_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        Ok(Self {
            inner: Arc::new(SessionInner {
                byte_order: driver.byte_order(),
                driver: Mutex::new(driver),
                device,
                settings,
                status: RwLock::new(status),
                ctx,
                writes_tx,
                writes_rx: Mutex::new(writes_rx),
            }),
            control: Mutex::new(Control {
                cancel: CancellationToken::new(),
                task: None,
            }),
            base_methods,
            methods_tx,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.device
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.read().clone()
    }

    /// Effective methods: driver defaults with device methods layered on top
    pub fn methods(&self) -> Vec<MethodDescriptor> {
        self.methods_tx.borrow().clone()
    }

    /// Start the lifecycle task; no-op when already started
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if control.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(device = %self.device_id(), "Session already started");
            return;
        }

        let cancel = CancellationToken::new();
        control.cancel = cancel.clone();
        control.task = Some(tokio::spawn(supervise(
            Arc::clone(&self.inner),
            cancel,
            self.methods_tx.subscribe(),
        )));
        info!(device = %self.device_id(), "Session started");
    }

    /// Cancel all tasks, wait for them and close the driver
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        control.cancel.cancel();
        let Some(task) = control.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            error!(device = %self.device_id(), "Session task panicked: {}", e);
            self.inner.set_state(SessionState::Stopped, Some(e.to_string()));
        }
        info!(device = %self.device_id(), "Session stopped");
    }

    /// Replace device methods without touching the connection.
    /// Running tasks are rescheduled only when the effective set changed.
    pub fn update_methods(&self, device_methods: &[MethodDescriptor]) -> bool {
        let merged = merge_methods(self.base_methods.clone(), device_methods);
        self.methods_tx.send_if_modified(|current| {
            if *current == merged {
                false
            } else {
                *current = merged.clone();
                true
            }
        })
    }

    /// Run one `OnDemand` method and return its raw result
    pub async fn invoke(&self, name: &str) -> Result<Vec<u8>> {
        let method = self
            .methods_tx
            .borrow()
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| CommError::MethodNotFound {
                device: self.device_id().to_string(),
                method: name.to_string(),
            })?;
        if method.mode != MethodMode::OnDemand {
            return Err(CommError::invalid_request(format!(
                "method '{}' is {:?}, only on-demand methods can be invoked",
                name, method.mode
            )));
        }
        if !method.enabled {
            return Err(CommError::invalid_request(format!("method '{}' is disabled", name)));
        }
        self.inner.execute(&method).await
    }

    /// Queue a forward write for this session's writer task without waiting
    pub(crate) fn enqueue_write(&self, write: ForwardWrite) -> Result<()> {
        self.inner.writes_tx.try_send(write).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CommError::state("forward write queue full"),
            mpsc::error::TrySendError::Closed(_) => CommError::state("forward write queue closed"),
        })
    }
}

impl SessionInner {
    fn set_state(&self, state: SessionState, error: Option<String>) {
        let mut status = self.status.write();
        if status.state != state {
            status.state = state;
            status.since = Utc::now();
        }
        status.connected = state == SessionState::Running;
        if error.is_some() {
            status.last_error = error;
        }
    }

    fn set_attempts(&self, attempts: u32) {
        self.status.write().attempts = attempts;
    }

    async fn open(&self) -> Result<()> {
        let timeout = self.settings.open_timeout;
        let mut driver = self.driver.lock().await;
        match tokio::time::timeout(timeout, driver.open()).await {
            Ok(result) => result,
            Err(_) => Err(CommError::ConnectFailed {
                code: -1,
                message: format!("open timed out after {:?}", timeout),
            }),
        }
    }

    async fn close(&self) {
        let mut driver = self.driver.lock().await;
        if let Err(e) = driver.close().await {
            warn!(device = %self.device.id, "Close failed: {}", e);
        }
    }

    async fn transfer(&self, request: &RawRequest) -> Result<Vec<u8>> {
        let timeout = self.settings.transfer_timeout;
        let mut driver = tokio::time::timeout(timeout, self.driver.lock())
            .await
            .map_err(|_| CommError::TransferTimeout(timeout))?;
        match tokio::time::timeout(timeout, driver.raw_transfer(request)).await {
            Ok(result) => result,
            Err(_) => Err(CommError::TransferTimeout(timeout)),
        }
    }

    /// Execute a method; read results are dispatched to the point table
    async fn execute(&self, method: &MethodDescriptor) -> Result<Vec<u8>> {
        let data = self.transfer(&method.action).await?;
        if let RawRequest::ReadBlock { block, start, .. } = method.action {
            self.dispatch(block, start, &data);
        }
        Ok(data)
    }

    async fn write_value(&self, location: PointLocation, value: TypedValue) -> Result<()> {
        let request = match value {
            TypedValue::Bool(v) => RawRequest::WriteBit {
                block: location.block,
                offset: location.offset,
                bit: location.bit.unwrap_or(0),
                value: v,
            },
            other => RawRequest::WriteBlock {
                block: location.block,
                start: location.offset,
                data: encode(&other, self.byte_order),
            },
        };
        self.transfer(&request).await.map(|_| ())
    }

    /// Decode every point of `block` covered by `data`, evaluate and forward
    fn dispatch(&self, block: u16, start: u32, data: &[u8]) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        // One snapshot for the whole cycle; a concurrent reload swaps behind it
        let table = ctx.table.load();
        let end = u64::from(start) + data.len() as u64;
        let now = Utc::now();

        for point in table.points_for_block(&self.device.id, block) {
            let offset = point.location.offset;
            if offset < start || u64::from(offset) >= end {
                continue;
            }
            let rel = (offset - start) as usize;
            let data_type = point.mapping.data_type;
            let value = match decode(data, rel, point.bit(), data_type, self.byte_order) {
                Ok(v) => v,
                Err(e) => {
                    debug!(device = %self.device.id, point = %point.point_id(), "Decode skipped: {}", e);
                    continue;
                },
            };

            let eval = ctx.evaluator.evaluate(point, value, now);
            if eval.is_update() {
                ctx.sink.publish_value(&DecodedValue {
                    point_id: point.point_id().to_string(),
                    device_id: self.device.id.clone(),
                    raw: data[rel..rel + data_type.byte_len()].to_vec(),
                    value,
                    timestamp: now,
                });
            }
            for record in &eval.logs {
                ctx.sink.publish_log(record);
            }
            if let Some(e) = eval.sync_error {
                warn!(device = %self.device.id, "Forward skipped: {}", e);
            }
            if let Some(forward) = eval.forward {
                ctx.forward(forward);
            }
        }
    }
}

/// Lifecycle loop of one session; returns after cancellation with the
/// driver closed
async fn supervise(
    inner: Arc<SessionInner>,
    cancel: CancellationToken,
    mut methods_rx: watch::Receiver<Vec<MethodDescriptor>>,
) {
    let mut backoff = Backoff::new(inner.settings.reconnect.clone());
    let device = inner.device.id.clone();
    // The fault path closes the driver itself; stop must not close it again
    let mut closed = true;

    while !cancel.is_cancelled() {
        inner.set_state(SessionState::Opening, None);
        let fault = match inner.open().await {
            Ok(()) => {
                closed = false;
                backoff.reset();
                inner.set_attempts(0);
                inner.set_state(SessionState::Running, None);
                info!(device = %device, "Device connected");
                match run(&inner, &cancel, &mut methods_rx).await {
                    RunExit::Cancelled => break,
                    RunExit::Fault(e) => e,
                }
            },
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        inner.set_attempts(backoff.attempts());
        inner.set_state(SessionState::Faulted, Some(fault.to_string()));
        warn!(
            device = %device,
            attempt = backoff.attempts(),
            "Session faulted: {}, reconnecting in {:?}",
            fault,
            delay
        );
        inner.close().await;
        closed = true;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {},
        }
    }

    inner.set_state(SessionState::Closing, None);
    if !closed {
        inner.close().await;
    }
    inner.set_state(SessionState::Stopped, None);
}

/// Schedule methods until cancelled or a connection fault arrives.
/// A method set change reschedules polling without reconnecting.
async fn run(
    inner: &Arc<SessionInner>,
    cancel: &CancellationToken,
    methods_rx: &mut watch::Receiver<Vec<MethodDescriptor>>,
) -> RunExit {
    let (fault_tx, mut fault_rx) = mpsc::channel::<CommError>(16);
    let mut first = true;

    loop {
        let methods = methods_rx.borrow_and_update().clone();
        let tasks_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for method in methods.iter().filter(|m| m.enabled) {
            match method.mode {
                MethodMode::Startup if first => {
                    tasks.spawn(run_once(Arc::clone(inner), method.clone(), fault_tx.clone()));
                },
                MethodMode::Polling => {
                    if let Err(e) = method.validate() {
                        error!(device = %inner.device.id, method = %method.name, "{}", e);
                        inner.set_state(SessionState::Running, Some(e.to_string()));
                        continue;
                    }
                    tasks.spawn(poll_loop(
                        Arc::clone(inner),
                        method.clone(),
                        tasks_cancel.clone(),
                        fault_tx.clone(),
                    ));
                },
                _ => {},
            }
        }
        first = false;
        tasks.spawn(write_loop(
            Arc::clone(inner),
            tasks_cancel.clone(),
            fault_tx.clone(),
        ));

        let exit = tokio::select! {
            _ = cancel.cancelled() => Some(RunExit::Cancelled),
            Some(fault) = fault_rx.recv() => Some(RunExit::Fault(fault)),
            changed = methods_rx.changed() => match changed {
                Ok(()) => None,
                Err(_) => Some(RunExit::Cancelled),
            },
        };

        tasks_cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(device = %inner.device.id, "Method task failed: {}", e);
            }
        }

        match exit {
            Some(exit) => return exit,
            None => info!(device = %inner.device.id, "Method set changed, rescheduling"),
        }
    }
}

fn report(inner: &SessionInner, method: &MethodDescriptor, err: CommError, faults: &mpsc::Sender<CommError>) {
    warn!(device = %inner.device.id, method = %method.name, "Method failed: {}", err);
    if err.is_connection_fault() {
        // A full channel already holds a fault that will restart the session
        let _ = faults.try_send(err);
    } else {
        inner.status.write().last_error = Some(err.to_string());
    }
}

async fn run_once(inner: Arc<SessionInner>, method: MethodDescriptor, faults: mpsc::Sender<CommError>) {
    match inner.execute(&method).await {
        Ok(_) => debug!(device = %inner.device.id, method = %method.name, "Startup method done"),
        Err(e) => report(&inner, &method, e, &faults),
    }
}

/// Drain forwarded writes into the driver. Queued writes are coalesced per
/// location (latest wins) and a value already written successfully during
/// this connection is not written again.
async fn write_loop(
    inner: Arc<SessionInner>,
    cancel: CancellationToken,
    faults: mpsc::Sender<CommError>,
) {
    let mut queue = inner.writes_rx.lock().await;
    let mut written: HashMap<PointLocation, TypedValue> = HashMap::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = queue.recv() => next,
        };
        let Some(next) = next else {
            return;
        };

        let mut batch = HashMap::new();
        batch.insert(next.location, next);
        while let Ok(write) = queue.try_recv() {
            batch.insert(write.location, write);
        }

        for (location, write) in batch {
            if cancel.is_cancelled() {
                return;
            }
            if written.get(&location) == Some(&write.value) {
                continue;
            }
            match inner.write_value(location, write.value).await {
                Ok(()) => {
                    debug!(
                        device = %inner.device.id,
                        point = %write.source_point,
                        "Forwarded {} to {}",
                        write.value,
                        write.address
                    );
                    written.insert(location, write.value);
                },
                Err(e) => {
                    written.remove(&location);
                    warn!(
                        device = %inner.device.id,
                        point = %write.source_point,
                        "Forward to {} failed: {}",
                        write.address,
                        e
                    );
                    if e.is_connection_fault() {
                        let _ = faults.try_send(e);
                    }
                },
            }
        }
    }
}

/// Sequential iterations; cancellation is observed between iterations and
/// during the interval sleep
async fn poll_loop(
    inner: Arc<SessionInner>,
    method: MethodDescriptor,
    cancel: CancellationToken,
    faults: mpsc::Sender<CommError>,
) {
    let interval = method.interval();
    debug!(device = %inner.device.id, method = %method.name, "Polling every {:?}", interval);

    while !cancel.is_cancelled() {
        if let Err(e) = inner.execute(&method).await {
            report(&inner, &method, e, &faults);
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {},
        }
    }
}
