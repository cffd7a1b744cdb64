//! Shared integration test support: a scripted mock driver, a recording sink
//! and a Modbus TCP simulator.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use psdcom::core::drivers::{
    merge_methods, DriverFactory, DriverManifest, DriverRegistry, FnDriverFactory, MethodDescriptor, Parameter,
    ProtocolDriver, RawRequest,
};
use psdcom::core::points::{ByteOrder, PointLocation};
use psdcom::core::sink::{DecodedValue, EngineSink, LogRecord};
use psdcom::{CommError, Result, SessionSettings};

pub const MOCK_PROTOCOL: &str = "MOCK";

/// Fast settings for tests
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        transfer_timeout: Duration::from_millis(300),
        open_timeout: Duration::from_millis(300),
        reconnect: psdcom::runtime::ReconnectPolicy::from_config(20, 100, 2.0, false),
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Counters and knobs shared by every mock driver instance of a registry
#[derive(Debug, Default)]
pub struct MockState {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub reads: AtomicUsize,
    pub connected: AtomicBool,
    /// Transfers currently running
    pub in_flight: AtomicUsize,
    /// Highest `in_flight` ever observed
    pub max_in_flight: AtomicUsize,
    /// Number of upcoming opens that fail
    pub fail_opens: AtomicUsize,
    pub transfer_delay_ms: AtomicU64,
    pub open_delay_ms: AtomicU64,
    /// Transfers never complete while set
    pub hang: AtomicBool,
    /// Bytes served for reads, indexed from offset 0 of every block
    pub data: Mutex<Vec<u8>>,
    pub writes: Mutex<Vec<RawRequest>>,
    /// Parameters the last created instance was initialized with
    pub parameters: Mutex<Vec<Parameter>>,
}

impl MockState {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        let state = Self::default();
        *state.data.lock() = data;
        Arc::new(state)
    }

    pub fn set_byte(&self, offset: usize, value: u8) {
        self.data.lock()[offset] = value;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Counts a transfer as in flight until dropped, including when a timeout
/// abandons it
struct InFlight(Arc<MockState>);

impl InFlight {
    fn enter(state: &Arc<MockState>) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Driver addressing `<block>:<offset>` with a status poll every 20ms
#[derive(Debug)]
pub struct MockDriver {
    key: String,
    state: Arc<MockState>,
    methods: Vec<MethodDescriptor>,
    connected: bool,
}

impl MockDriver {
    pub fn new(key: String, state: Arc<MockState>, methods: Vec<MethodDescriptor>) -> Self {
        Self {
            key,
            state,
            methods,
            connected: false,
        }
    }
}

#[async_trait]
impl ProtocolDriver for MockDriver {
    fn protocol_key(&self) -> &str {
        &self.key
    }

    fn initialize(&mut self, parameters: &[Parameter]) {
        *self.state.parameters.lock() = parameters.to_vec();
    }

    async fn open(&mut self) -> Result<()> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .state
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CommError::ConnectFailed {
                code: 10061,
                message: "connection refused".into(),
            });
        }
        self.connected = true;
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn raw_transfer(&mut self, request: &RawRequest) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(CommError::NotConnected);
        }
        let in_flight = InFlight::enter(&self.state);
        let delay = self.state.transfer_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        drop(in_flight);

        match request {
            RawRequest::ReadBlock { start, length, .. } => {
                self.state.reads.fetch_add(1, Ordering::SeqCst);
                let data = self.state.data.lock();
                let start = *start as usize;
                let end = start + *length as usize;
                data.get(start..end)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| CommError::invalid_request("read outside mock data"))
            },
            other => {
                self.state.writes.lock().push(other.clone());
                Ok(Vec::new())
            },
        }
    }

    fn list_methods(&self) -> Vec<MethodDescriptor> {
        merge_methods(
            vec![MethodDescriptor::polling(
                "PollStatus",
                20,
                RawRequest::ReadBlock {
                    block: 1,
                    start: 0,
                    length: 4,
                },
            )],
            &self.methods,
        )
    }

    fn locate(&self, address: &str, bit: Option<u8>) -> Result<PointLocation> {
        let (block, offset) = address
            .trim()
            .split_once(':')
            .and_then(|(b, o)| Some((b.parse().ok()?, o.parse().ok()?)))
            .ok_or_else(|| CommError::unparsable(address, "expected <block>:<offset>"))?;
        if bit.is_some_and(|b| b > 7) {
            return Err(CommError::unparsable(address, "bit out of range"));
        }
        Ok(PointLocation { block, offset, bit })
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::Abcd
    }
}

fn mock_factory(kind: &str, default_key: &'static str, state: Arc<MockState>) -> impl DriverFactory {
    FnDriverFactory::new(kind, move |m: &DriverManifest| {
        Ok(Box::new(MockDriver::new(
            m.protocol_or(default_key),
            Arc::clone(&state),
            m.methods.clone(),
        )) as Box<dyn ProtocolDriver>)
    })
}

/// Registry with the built-in drivers plus `MOCK` backed by `state`
pub fn mock_registry(state: Arc<MockState>) -> DriverRegistry {
    let mut registry = DriverRegistry::with_builtin_factories();
    registry.register_factory(mock_factory("mock", MOCK_PROTOCOL, state));
    registry.register_defaults();
    registry
}

/// Add a second mock protocol with its own counters
pub fn add_mock_protocol(registry: &mut DriverRegistry, protocol: &'static str, state: Arc<MockState>) {
    let kind = protocol.to_lowercase();
    registry.register_factory(mock_factory(&kind, protocol, state));
    registry
        .register(DriverManifest::new(kind).with_protocol(protocol), "test")
        .unwrap();
}

/// Sink keeping everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub values: Mutex<Vec<DecodedValue>>,
    pub logs: Mutex<Vec<LogRecord>>,
}

impl RecordingSink {
    pub fn values_of(&self, point_id: &str) -> Vec<DecodedValue> {
        self.values
            .lock()
            .iter()
            .filter(|v| v.point_id == point_id)
            .cloned()
            .collect()
    }

    pub fn logs_of(&self, point_id: &str) -> Vec<LogRecord> {
        self.logs
            .lock()
            .iter()
            .filter(|l| l.point_id == point_id)
            .cloned()
            .collect()
    }
}

impl EngineSink for RecordingSink {
    fn publish_value(&self, value: &DecodedValue) {
        self.values.lock().push(value.clone());
    }

    fn publish_log(&self, record: &LogRecord) {
        self.logs.lock().push(record.clone());
    }
}

/// Modbus data model of one unit
#[derive(Debug, Default)]
pub struct ModbusData {
    pub coils: HashMap<u16, bool>,
    pub discrete_inputs: HashMap<u16, bool>,
    pub holding_registers: HashMap<u16, u16>,
    pub input_registers: HashMap<u16, u16>,
}

/// Minimal Modbus TCP server for driver tests
pub struct ModbusSimulator {
    pub addr: SocketAddr,
    pub data: Arc<Mutex<ModbusData>>,
    /// Requests served, by function code
    pub requests: Arc<Mutex<Vec<u8>>>,
}

impl ModbusSimulator {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let data = Arc::new(Mutex::new(ModbusData::default()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (d, r) = (Arc::clone(&data), Arc::clone(&requests));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&d), Arc::clone(&r)));
            }
        });

        Self {
            addr,
            data,
            requests,
        }
    }

    pub fn parameters(&self) -> Vec<(String, String)> {
        vec![
            ("IP".to_string(), self.addr.ip().to_string()),
            ("Port".to_string(), self.addr.port().to_string()),
            ("UnitId".to_string(), "1".to_string()),
        ]
    }
}

async fn serve(mut stream: TcpStream, data: Arc<Mutex<ModbusData>>, requests: Arc<Mutex<Vec<u8>>>) {
    let mut buf = BytesMut::with_capacity(260);
    loop {
        while buf.len() >= 7 {
            let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            if buf.len() < 6 + length {
                break;
            }
            let header = buf[..7].to_vec();
            buf.advance(7);
            let pdu = buf.split_to(length - 1).to_vec();

            requests.lock().push(pdu[0]);
            let reply = process(&pdu, &mut data.lock());

            let mut out = Vec::with_capacity(7 + reply.len());
            out.extend_from_slice(&header[..4]);
            out.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
            out.push(header[6]);
            out.extend_from_slice(&reply);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {},
        }
    }
}

fn word(pdu: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([pdu[at], pdu[at + 1]])
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | 0x80, code]
}

fn process(pdu: &[u8], data: &mut ModbusData) -> Vec<u8> {
    let fc = pdu[0];
    match fc {
        0x01 | 0x02 => {
            let (start, quantity) = (word(pdu, 1), word(pdu, 3));
            let bits = if fc == 0x01 {
                &data.coils
            } else {
                &data.discrete_inputs
            };
            let mut packed = vec![0u8; (quantity as usize).div_ceil(8)];
            for i in 0..quantity {
                if bits.get(&(start + i)).copied().unwrap_or(false) {
                    packed[(i / 8) as usize] |= 1 << (i % 8);
                }
            }
            let mut reply = vec![fc, packed.len() as u8];
            reply.extend_from_slice(&packed);
            reply
        },
        0x03 | 0x04 => {
            let (start, quantity) = (word(pdu, 1), word(pdu, 3));
            if start >= 1000 {
                return exception(fc, 0x02);
            }
            let regs = if fc == 0x03 {
                &data.holding_registers
            } else {
                &data.input_registers
            };
            let mut reply = vec![fc, (quantity * 2) as u8];
            for i in 0..quantity {
                let v = regs.get(&(start + i)).copied().unwrap_or(0);
                reply.extend_from_slice(&v.to_be_bytes());
            }
            reply
        },
        0x05 => {
            let (address, value) = (word(pdu, 1), word(pdu, 3));
            data.coils.insert(address, value == 0xFF00);
            pdu.to_vec()
        },
        0x0F => {
            let (start, quantity) = (word(pdu, 1), word(pdu, 3));
            let packed = &pdu[6..];
            for i in 0..quantity {
                let on = packed[(i / 8) as usize] >> (i % 8) & 1 == 1;
                data.coils.insert(start + i, on);
            }
            pdu[..5].to_vec()
        },
        0x10 => {
            let (start, quantity) = (word(pdu, 1), word(pdu, 3));
            for i in 0..quantity {
                let v = word(pdu, 6 + 2 * i as usize);
                data.holding_registers.insert(start + i, v);
            }
            pdu[..5].to_vec()
        },
        0x16 => {
            let (address, and_mask, or_mask) = (word(pdu, 1), word(pdu, 3), word(pdu, 5));
            let current = data.holding_registers.get(&address).copied().unwrap_or(0);
            data.holding_registers
                .insert(address, (current & and_mask) | (or_mask & !and_mask));
            pdu.to_vec()
        },
        _ => exception(fc, 0x01),
    }
}
