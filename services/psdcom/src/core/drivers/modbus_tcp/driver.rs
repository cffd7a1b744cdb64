//! Modbus TCP driver
//!
//! Blocks map to the four Modbus tables and are addressed in bytes:
//! - 1: coils, 2: discrete inputs (8 bits per byte, LSB first)
//! - 3: holding registers, 4: input registers (2 bytes per register, wire order)

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::frame::{self, function, MbapCodec, ModbusFrame};
use crate::core::drivers::traits::{
    apply_param, merge_methods, poll_status_method, MethodDescriptor, Parameter, ProtocolDriver,
    RawRequest,
};
use crate::core::points::{ByteOrder, PointLocation};
use crate::error::{CommError, Result};

pub const DEFAULT_PROTOCOL_KEY: &str = "MODBUS_TCP";

pub const BLOCK_COILS: u16 = 1;
pub const BLOCK_DISCRETE_INPUTS: u16 = 2;
pub const BLOCK_HOLDING_REGISTERS: u16 = 3;
pub const BLOCK_INPUT_REGISTERS: u16 = 4;

/// `ConnectFailed` code used when the connect attempt timed out
pub const CONNECT_TIMEOUT_CODE: i32 = -1;

const MAX_READ_BITS: u32 = 2000;
const MAX_READ_REGISTERS: u32 = 125;
const MAX_WRITE_BITS: u32 = 1968;
const MAX_WRITE_REGISTERS: u32 = 123;

/// What a response must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Data(usize),
    Ack,
}

/// A request translated into one PDU
#[derive(Debug, Clone, PartialEq, Eq)]
struct Plan {
    function: u8,
    pdu: Vec<u8>,
    expect: Expect,
}

#[derive(Debug)]
pub struct ModbusTcpDriver {
    protocol_key: String,
    host: String,
    port: u16,
    unit_id: u8,
    byte_order: ByteOrder,
    connect_timeout_ms: u64,
    status_block: u16,
    status_start: u32,
    status_length: u32,
    manifest_methods: Vec<MethodDescriptor>,
    framed: Option<Framed<TcpStream, MbapCodec>>,
    transaction_id: u16,
}

impl ModbusTcpDriver {
    pub fn new(protocol_key: impl Into<String>) -> Self {
        Self {
            protocol_key: protocol_key.into(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            byte_order: ByteOrder::Abcd,
            connect_timeout_ms: 3000,
            status_block: BLOCK_HOLDING_REGISTERS,
            status_start: 0,
            status_length: 2,
            manifest_methods: Vec::new(),
            framed: None,
            transaction_id: 0,
        }
    }

    /// Methods layered over the driver defaults
    pub fn with_methods(mut self, methods: Vec<MethodDescriptor>) -> Self {
        self.manifest_methods = methods;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    fn plan(&self, request: &RawRequest) -> Result<Plan> {
        match request {
            RawRequest::ReadBlock {
                block,
                start,
                length,
            } => plan_read(*block, *start, *length),
            RawRequest::WriteBlock { block, start, data } => plan_write(*block, *start, data),
            RawRequest::WriteBit {
                block,
                offset,
                bit,
                value,
            } => plan_write_bit(*block, *offset, *bit, *value),
        }
    }

    async fn exchange(&mut self, plan: Plan) -> Result<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let unit_id = self.unit_id;
        let framed = self.framed.as_mut().ok_or(CommError::NotConnected)?;

        framed.send(ModbusFrame::new(tid, unit_id, plan.pdu)).await?;

        let response = loop {
            match framed.next().await {
                None => return Err(CommError::io("connection closed by peer")),
                Some(Err(e)) => return Err(e),
                Some(Ok(frame)) if frame.header.transaction_id != tid => {
                    // Late answer to a request that already timed out
                    debug!(
                        "Discarding stale response tid={} (expecting {})",
                        frame.header.transaction_id, tid
                    );
                },
                Some(Ok(frame)) => break frame,
            }
        };

        if response.header.unit_id != unit_id {
            return Err(CommError::protocol(format!(
                "unit id mismatch: sent {}, got {}",
                unit_id, response.header.unit_id
            )));
        }

        match plan.expect {
            Expect::Data(n) => frame::read_response_data(plan.function, &response.pdu, n),
            Expect::Ack => {
                frame::check_response(plan.function, &response.pdu)?;
                Ok(Vec::new())
            },
        }
    }
}

fn to_u16(value: u32, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| CommError::invalid_request(format!("{} {} exceeds 65535", what, value)))
}

/// Bit address of `bit` inside byte `offset` of a bit table
fn bit_address(offset: u32, bit: u32) -> Result<u16> {
    let address = offset
        .checked_mul(8)
        .and_then(|a| a.checked_add(bit))
        .ok_or_else(|| CommError::invalid_request(format!("bit offset {} out of range", offset)))?;
    to_u16(address, "bit address")
}

fn require_even(start: u32, length: usize) -> Result<()> {
    if start % 2 != 0 || length % 2 != 0 {
        return Err(CommError::invalid_request(format!(
            "register tables need even offset and length (got {}+{})",
            start, length
        )));
    }
    Ok(())
}

fn plan_read(block: u16, start: u32, length: u32) -> Result<Plan> {
    if length == 0 {
        return Err(CommError::invalid_request("read length 0"));
    }
    let (function, address, quantity) = match block {
        BLOCK_COILS | BLOCK_DISCRETE_INPUTS => {
            let quantity = length.checked_mul(8).unwrap_or(u32::MAX);
            if quantity > MAX_READ_BITS {
                return Err(CommError::invalid_request(format!(
                    "bit read of {} bytes exceeds {} bits",
                    length, MAX_READ_BITS
                )));
            }
            let function = if block == BLOCK_COILS {
                function::READ_COILS
            } else {
                function::READ_DISCRETE_INPUTS
            };
            (function, u32::from(bit_address(start, 0)?), quantity)
        },
        BLOCK_HOLDING_REGISTERS | BLOCK_INPUT_REGISTERS => {
            require_even(start, length as usize)?;
            let quantity = length / 2;
            if quantity > MAX_READ_REGISTERS {
                return Err(CommError::invalid_request(format!(
                    "register read of {} exceeds {}",
                    quantity, MAX_READ_REGISTERS
                )));
            }
            let function = if block == BLOCK_HOLDING_REGISTERS {
                function::READ_HOLDING_REGISTERS
            } else {
                function::READ_INPUT_REGISTERS
            };
            (function, start / 2, quantity)
        },
        other => {
            return Err(CommError::invalid_request(format!(
                "unknown Modbus block {}",
                other
            )))
        },
    };

    Ok(Plan {
        function,
        pdu: frame::read_request(function, to_u16(address, "address")?, quantity as u16),
        expect: Expect::Data(length as usize),
    })
}

fn plan_write(block: u16, start: u32, data: &[u8]) -> Result<Plan> {
    if data.is_empty() {
        return Err(CommError::invalid_request("write with no data"));
    }
    match block {
        BLOCK_COILS => {
            let quantity = u32::try_from(data.len())
                .ok()
                .and_then(|n| n.checked_mul(8))
                .unwrap_or(u32::MAX);
            if quantity > MAX_WRITE_BITS {
                return Err(CommError::invalid_request("coil write too long"));
            }
            let address = bit_address(start, 0)?;
            Ok(Plan {
                function: function::WRITE_MULTIPLE_COILS,
                pdu: frame::write_multiple_coils(address, quantity as u16, data),
                expect: Expect::Ack,
            })
        },
        BLOCK_HOLDING_REGISTERS => {
            require_even(start, data.len())?;
            if data.len() / 2 > MAX_WRITE_REGISTERS as usize {
                return Err(CommError::invalid_request("register write too long"));
            }
            let address = to_u16(start / 2, "address")?;
            Ok(Plan {
                function: function::WRITE_MULTIPLE_REGISTERS,
                pdu: frame::write_multiple_registers(address, data),
                expect: Expect::Ack,
            })
        },
        BLOCK_DISCRETE_INPUTS | BLOCK_INPUT_REGISTERS => Err(CommError::invalid_request(
            format!("Modbus block {} is read-only", block),
        )),
        other => Err(CommError::invalid_request(format!(
            "unknown Modbus block {}",
            other
        ))),
    }
}

fn plan_write_bit(block: u16, offset: u32, bit: u8, value: bool) -> Result<Plan> {
    if bit > 7 {
        return Err(CommError::OutOfRange { bit });
    }
    match block {
        BLOCK_COILS => {
            let address = bit_address(offset, u32::from(bit))?;
            Ok(Plan {
                function: function::WRITE_SINGLE_COIL,
                pdu: frame::write_single_coil(address, value),
                expect: Expect::Ack,
            })
        },
        BLOCK_HOLDING_REGISTERS => {
            // Even byte is the register's high byte
            let register_bit = if offset % 2 == 0 { bit + 8 } else { bit };
            let mask = 1u16 << register_bit;
            let address = to_u16(offset / 2, "register")?;
            Ok(Plan {
                function: function::MASK_WRITE_REGISTER,
                pdu: frame::mask_write_register(address, !mask, if value { mask } else { 0 }),
                expect: Expect::Ack,
            })
        },
        other => Err(CommError::invalid_request(format!(
            "bit write not supported on Modbus block {}",
            other
        ))),
    }
}

/// Parse `HR100`, `IR:7`, `CO12`, `DI3` (0-based) or `40101`, `300008`
/// (1-based classic references) into (block, index).
pub fn parse_address(address: &str) -> Result<(u16, u32)> {
    let upper = address.trim().to_uppercase();
    let prefixed = [
        ("HR", BLOCK_HOLDING_REGISTERS),
        ("IR", BLOCK_INPUT_REGISTERS),
        ("CO", BLOCK_COILS),
        ("DI", BLOCK_DISCRETE_INPUTS),
    ];

    for (prefix, block) in prefixed {
        if let Some(rest) = upper.strip_prefix(prefix) {
            let digits = rest.strip_prefix(':').unwrap_or(rest);
            let index: u32 = digits
                .parse()
                .map_err(|_| CommError::unparsable(address, "expected a register number"))?;
            return check_index(address, block, index);
        }
    }

    if upper.len() >= 5 && upper.chars().all(|c| c.is_ascii_digit()) {
        let (table, number) = upper.split_at(1);
        let block = match table {
            "0" => BLOCK_COILS,
            "1" => BLOCK_DISCRETE_INPUTS,
            "3" => BLOCK_INPUT_REGISTERS,
            "4" => BLOCK_HOLDING_REGISTERS,
            _ => return Err(CommError::unparsable(address, "unknown Modbus table digit")),
        };
        let number: u32 = number
            .parse()
            .map_err(|_| CommError::unparsable(address, "bad reference number"))?;
        if number == 0 {
            return Err(CommError::unparsable(address, "references are 1-based"));
        }
        return check_index(address, block, number - 1);
    }

    Err(CommError::unparsable(
        address,
        "expected HR/IR/CO/DI<n> or a 5/6 digit reference",
    ))
}

fn check_index(address: &str, block: u16, index: u32) -> Result<(u16, u32)> {
    if index > u32::from(u16::MAX) {
        return Err(CommError::unparsable(address, "index exceeds 65535"));
    }
    Ok((block, index))
}

#[async_trait]
impl ProtocolDriver for ModbusTcpDriver {
    fn protocol_key(&self) -> &str {
        &self.protocol_key
    }

    fn initialize(&mut self, parameters: &[Parameter]) {
        for param in parameters {
            let key = self.protocol_key.clone();
            match param.name.trim().to_uppercase().as_str() {
                "IP" | "HOST" => self.host = param.value.trim().to_string(),
                "PORT" => apply_param(&key, param, &mut self.port),
                "UNITID" | "SLAVEID" => apply_param(&key, param, &mut self.unit_id),
                "BYTEORDER" => apply_param(&key, param, &mut self.byte_order),
                "CONNECTTIMEOUTMS" => apply_param(&key, param, &mut self.connect_timeout_ms),
                "STATUSBLOCK" => apply_param(&key, param, &mut self.status_block),
                "STATUSSTART" => apply_param(&key, param, &mut self.status_start),
                "STATUSLENGTH" => apply_param(&key, param, &mut self.status_length),
                _ => debug!("{}: ignoring unknown parameter {}", key, param.name),
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint();
        let connect = TcpStream::connect(endpoint.as_str());
        let stream =
            match tokio::time::timeout(Duration::from_millis(self.connect_timeout_ms), connect)
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(CommError::ConnectFailed {
                        code: e.raw_os_error().unwrap_or(CONNECT_TIMEOUT_CODE),
                        message: format!("{}: {}", endpoint, e),
                    })
                },
                Err(_) => {
                    return Err(CommError::ConnectFailed {
                        code: CONNECT_TIMEOUT_CODE,
                        message: format!(
                            "{}: connect timed out after {}ms",
                            endpoint, self.connect_timeout_ms
                        ),
                    })
                },
            };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("{}: failed to set TCP_NODELAY: {}", self.protocol_key, e);
        }

        self.framed = Some(Framed::new(stream, MbapCodec));
        info!(
            "{}: connected to {} (unit {})",
            self.protocol_key, endpoint, self.unit_id
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            if let Err(e) = framed.get_mut().shutdown().await {
                debug!("{}: shutdown: {}", self.protocol_key, e);
            }
            info!("{}: disconnected from {}", self.protocol_key, self.endpoint());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    async fn raw_transfer(&mut self, request: &RawRequest) -> Result<Vec<u8>> {
        if self.framed.is_none() {
            return Err(CommError::NotConnected);
        }
        let plan = self.plan(request)?;
        let result = self.exchange(plan).await;
        if let Err(e) = &result {
            if e.is_connection_fault() {
                self.framed = None;
            }
        }
        result
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
        let (block, index) = parse_address(address)?;
        match block {
            BLOCK_COILS | BLOCK_DISCRETE_INPUTS => Ok(PointLocation {
                block,
                offset: index / 8,
                bit: Some((index % 8) as u8),
            }),
            _ => match bit {
                Some(b) if b > 15 => Err(CommError::unparsable(
                    address,
                    format!("bit index {} out of range 0..=15", b),
                )),
                // Register bytes are big-endian: bits 0-7 live in the odd byte
                Some(b) => Ok(PointLocation {
                    block,
                    offset: index * 2 + u32::from(b < 8),
                    bit: Some(b % 8),
                }),
                None => Ok(PointLocation {
                    block,
                    offset: index * 2,
                    bit: None,
                }),
            },
        }
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address("HR100").unwrap(), (BLOCK_HOLDING_REGISTERS, 100));
        assert_eq!(parse_address("ir:7").unwrap(), (BLOCK_INPUT_REGISTERS, 7));
        assert_eq!(parse_address("CO12").unwrap(), (BLOCK_COILS, 12));
        assert_eq!(parse_address(" DI3 ").unwrap(), (BLOCK_DISCRETE_INPUTS, 3));
        assert_eq!(parse_address("40101").unwrap(), (BLOCK_HOLDING_REGISTERS, 100));
        assert_eq!(parse_address("300008").unwrap(), (BLOCK_INPUT_REGISTERS, 7));
        assert_eq!(parse_address("00001").unwrap(), (BLOCK_COILS, 0));

        for bad in ["", "HR", "HRx", "40000", "50001", "1234", "DB1.0", "HR70000"] {
            assert!(
                matches!(parse_address(bad), Err(CommError::UnparsableAddress { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_locate_register_bits() {
        let driver = ModbusTcpDriver::new(DEFAULT_PROTOCOL_KEY);
        assert_eq!(
            driver.locate("HR10", Some(0)).unwrap(),
            PointLocation {
                block: 3,
                offset: 21,
                bit: Some(0)
            }
        );
        assert_eq!(
            driver.locate("HR10", Some(15)).unwrap(),
            PointLocation {
                block: 3,
                offset: 20,
                bit: Some(7)
            }
        );
        assert_eq!(driver.locate("HR10", None).unwrap().offset, 20);
        assert!(driver.locate("HR10", Some(16)).is_err());

        // Coil addresses carry their own bit
        assert_eq!(
            driver.locate("CO13", None).unwrap(),
            PointLocation {
                block: 1,
                offset: 1,
                bit: Some(5)
            }
        );
    }

    #[test]
    fn test_plan_validates_request_shape() {
        let read = |block, start, length| RawRequest::ReadBlock {
            block,
            start,
            length,
        };
        let driver = ModbusTcpDriver::new(DEFAULT_PROTOCOL_KEY);

        let plan = driver.plan(&read(3, 20, 4)).unwrap();
        assert_eq!(plan.pdu, vec![0x03, 0x00, 0x0A, 0x00, 0x02]);
        assert_eq!(plan.expect, Expect::Data(4));

        let plan = driver.plan(&read(1, 2, 1)).unwrap();
        assert_eq!(plan.pdu, vec![0x01, 0x00, 0x10, 0x00, 0x08]);

        for bad in [read(3, 1, 2), read(4, 0, 3), read(3, 0, 0), read(9, 0, 2), read(3, 0, 252)] {
            assert!(
                matches!(driver.plan(&bad), Err(CommError::InvalidRequest(_))),
                "{bad:?}"
            );
        }

        let write_ir = RawRequest::WriteBlock {
            block: 4,
            start: 0,
            data: vec![0, 1],
        };
        assert!(matches!(
            driver.plan(&write_ir),
            Err(CommError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_plan_register_bit_write_uses_mask() {
        let driver = ModbusTcpDriver::new(DEFAULT_PROTOCOL_KEY);
        // HR10 bit 0 lives at byte 21
        let plan = driver
            .plan(&RawRequest::WriteBit {
                block: 3,
                offset: 21,
                bit: 0,
                value: true,
            })
            .unwrap();
        assert_eq!(plan.pdu, vec![0x16, 0x00, 0x0A, 0xFF, 0xFE, 0x00, 0x01]);

        // HR10 bit 15 lives at byte 20 bit 7
        let plan = driver
            .plan(&RawRequest::WriteBit {
                block: 3,
                offset: 20,
                bit: 7,
                value: false,
            })
            .unwrap();
        assert_eq!(plan.pdu, vec![0x16, 0x00, 0x0A, 0x7F, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn test_initialize_ignores_unknown_and_malformed() {
        let mut driver = ModbusTcpDriver::new(DEFAULT_PROTOCOL_KEY);
        driver.initialize(&[
            Parameter::new("IP", "10.0.0.5"),
            Parameter::new("Port", "not-a-port"),
            Parameter::new("UnitId", "3"),
            Parameter::new("ByteOrder", "CDAB"),
            Parameter::new("Rack", "0"),
        ]);
        assert_eq!(driver.endpoint(), "10.0.0.5:502");
        assert_eq!(driver.unit_id(), 3);
        assert_eq!(driver.byte_order(), ByteOrder::Cdab);
    }

    #[tokio::test]
    async fn test_transfer_requires_connection() {
        let mut driver = ModbusTcpDriver::new(DEFAULT_PROTOCOL_KEY);
        let err = driver
            .raw_transfer(&RawRequest::ReadBlock {
                block: 3,
                start: 0,
                length: 2,
            })
            .await
            .unwrap_err();
        assert_eq!(err, CommError::NotConnected);
        assert!(driver.close().await.is_ok());
        assert!(driver.close().await.is_ok());
    }

    #[test]
    fn test_oversized_bit_offsets_are_rejected() {
        let overflowing = [
            plan_read(BLOCK_COILS, u32::MAX / 4, 1),
            plan_read(BLOCK_DISCRETE_INPUTS, 0, u32::MAX),
            plan_write(BLOCK_COILS, u32::MAX / 2, &[0xFF]),
            plan_write_bit(BLOCK_COILS, u32::MAX, 7, true),
            plan_write_bit(BLOCK_COILS, 8192, 0, true),
        ];
        for plan in overflowing {
            assert!(matches!(plan, Err(CommError::InvalidRequest(_))), "{plan:?}");
        }

        let last_coil = plan_write_bit(BLOCK_COILS, 8191, 7, true).unwrap();
        assert_eq!(last_coil.pdu, frame::write_single_coil(u16::MAX, true));
    }
}
