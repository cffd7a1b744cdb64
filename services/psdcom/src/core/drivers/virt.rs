//! Virtual driver
//!
//! In-memory block store behind the driver interface, for commissioning
//! without hardware and for tests. Addresses use S7 style byte addressing:
//! `DB<block>.<byte>` or `DB<block>.<byte>.<bit>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::registry::{DriverFactory, DriverManifest};
use super::traits::{
    apply_param, merge_methods, poll_status_method, MethodDescriptor, Parameter, ProtocolDriver,
    RawRequest,
};
use crate::core::points::{decoder, ByteOrder, PointLocation};
use crate::error::{CommError, Result};

pub const DEFAULT_PROTOCOL_KEY: &str = "VIRTUAL";

/// Block contents shared between a driver and whoever created it
pub type BlockMemory = Arc<Mutex<HashMap<u16, Vec<u8>>>>;

#[derive(Debug)]
pub struct VirtualDriver {
    protocol_key: String,
    blocks: Vec<(u16, usize)>,
    byte_order: ByteOrder,
    latency_ms: u64,
    status_block: u16,
    status_start: u32,
    status_length: u32,
    manifest_methods: Vec<MethodDescriptor>,
    memory: BlockMemory,
    connected: bool,
}

impl VirtualDriver {
    pub fn new(protocol_key: impl Into<String>) -> Self {
        Self {
            protocol_key: protocol_key.into(),
            blocks: vec![(1, 64)],
            byte_order: ByteOrder::Abcd,
            latency_ms: 0,
            status_block: 1,
            status_start: 0,
            status_length: 2,
            manifest_methods: Vec::new(),
            memory: Arc::new(Mutex::new(HashMap::new())),
            connected: false,
        }
    }

    pub fn with_methods(mut self, methods: Vec<MethodDescriptor>) -> Self {
        self.manifest_methods = methods;
        self
    }

    /// Use externally owned block memory
    pub fn with_memory(mut self, memory: BlockMemory) -> Self {
        self.memory = memory;
        self
    }

    pub fn memory(&self) -> BlockMemory {
        Arc::clone(&self.memory)
    }

    fn check_range(&self, block: u16, start: u32, length: usize) -> Result<()> {
        let memory = self.memory.lock();
        let size = memory
            .get(&block)
            .map(Vec::len)
            .ok_or_else(|| CommError::invalid_request(format!("unknown block {}", block)))?;
        if length == 0 || start as usize + length > size {
            return Err(CommError::invalid_request(format!(
                "range {}+{} outside block {} of {} bytes",
                start, length, block, size
            )));
        }
        Ok(())
    }
}

/// Parse `"1:64,2:16"` into (block, size) pairs
fn parse_blocks(value: &str) -> std::result::Result<Vec<(u16, usize)>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (block, size) = item
                .split_once(':')
                .ok_or_else(|| format!("expected <block>:<size>, got '{}'", item))?;
            let block = block.trim().parse::<u16>().map_err(|e| e.to_string())?;
            let size = size.trim().parse::<usize>().map_err(|e| e.to_string())?;
            Ok((block, size))
        })
        .collect()
}

#[async_trait]
impl ProtocolDriver for VirtualDriver {
    fn protocol_key(&self) -> &str {
        &self.protocol_key
    }

    fn initialize(&mut self, parameters: &[Parameter]) {
        for param in parameters {
            let key = self.protocol_key.clone();
            match param.name.trim().to_uppercase().as_str() {
                "BLOCKS" => match parse_blocks(&param.value) {
                    Ok(blocks) if !blocks.is_empty() => self.blocks = blocks,
                    Ok(_) => warn!("{}: empty Blocks parameter ignored", key),
                    Err(e) => warn!(
                        "{}: malformed Blocks '{}' ({}), keeping previous value",
                        key, param.value, e
                    ),
                },
                "BYTEORDER" => apply_param(&key, param, &mut self.byte_order),
                "LATENCYMS" => apply_param(&key, param, &mut self.latency_ms),
                "STATUSBLOCK" => apply_param(&key, param, &mut self.status_block),
                "STATUSSTART" => apply_param(&key, param, &mut self.status_start),
                "STATUSLENGTH" => apply_param(&key, param, &mut self.status_length),
                _ => debug!("{}: ignoring unknown parameter {}", key, param.name),
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        let mut memory = self.memory.lock();
        for (block, size) in &self.blocks {
            let data = memory.entry(*block).or_default();
            if data.len() < *size {
                data.resize(*size, 0);
            }
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn raw_transfer(&mut self, request: &RawRequest) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(CommError::NotConnected);
        }
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }

        match request {
            RawRequest::ReadBlock {
                block,
                start,
                length,
            } => {
                self.check_range(*block, *start, *length as usize)?;
                let memory = self.memory.lock();
                let data = memory.get(block).map(Vec::as_slice).unwrap_or(&[]);
                let start = *start as usize;
                Ok(data[start..start + *length as usize].to_vec())
            },
            RawRequest::WriteBlock { block, start, data } => {
                self.check_range(*block, *start, data.len())?;
                let mut memory = self.memory.lock();
                if let Some(target) = memory.get_mut(block) {
                    let start = *start as usize;
                    target[start..start + data.len()].copy_from_slice(data);
                }
                Ok(Vec::new())
            },
            RawRequest::WriteBit {
                block,
                offset,
                bit,
                value,
            } => {
                if *bit > 7 {
                    return Err(CommError::OutOfRange { bit: *bit });
                }
                self.check_range(*block, *offset, 1)?;
                let mut memory = self.memory.lock();
                if let Some(target) = memory.get_mut(block) {
                    let byte = &mut target[*offset as usize];
                    *byte = decoder::set_bit(*byte, *bit, *value)?;
                }
                Ok(Vec::new())
            },
        }
    }

    fn list_methods(&self) -> Vec<MethodDescriptor> {
        merge_methods(
            vec![poll_status_method(
                self.status_block,
                self.status_start,
                self.status_length,
            )],
            &self.manifest_methods,
        )
    }

    fn locate(&self, address: &str, bit: Option<u8>) -> Result<PointLocation> {
        let upper = address.trim().to_uppercase();
        let rest = upper
            .strip_prefix("DB")
            .ok_or_else(|| CommError::unparsable(address, "expected DB<block>.<byte>"))?;
        let mut parts = rest.split('.');
        let block = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| CommError::unparsable(address, "bad block number"))?;
        let offset = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| CommError::unparsable(address, "bad byte offset"))?;
        let inline_bit = match parts.next() {
            Some(s) => Some(
                s.parse::<u8>()
                    .map_err(|_| CommError::unparsable(address, "bad bit index"))?,
            ),
            None => None,
        };
        if parts.next().is_some() {
            return Err(CommError::unparsable(address, "too many components"));
        }

        match inline_bit.or(bit) {
            Some(b) if b > 15 => Err(CommError::unparsable(
                address,
                format!("bit index {} out of range 0..=15", b),
            )),
            Some(b) => Ok(PointLocation {
                block,
                offset: offset + u32::from(b / 8),
                bit: Some(b % 8),
            }),
            None => Ok(PointLocation {
                block,
                offset,
                bit: None,
            }),
        }
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }
}

/// Factory for kind `virtual`
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualFactory;

impl DriverFactory for VirtualFactory {
    fn kind(&self) -> &str {
        "virtual"
    }

    fn create(&self, manifest: &DriverManifest) -> Result<Box<dyn ProtocolDriver>> {
        Ok(Box::new(
            VirtualDriver::new(manifest.protocol_or(DEFAULT_PROTOCOL_KEY))
                .with_methods(manifest.methods.clone()),
        ))
    }
}
