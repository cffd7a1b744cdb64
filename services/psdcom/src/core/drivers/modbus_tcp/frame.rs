//! Modbus TCP framing
//!
//! MBAP header handling, a `tokio_util` codec that splits the TCP byte stream
//! into frames, and PDU construction/parsing for the function codes the
//! driver uses.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CommError, Result};

/// MBAP header length in bytes (including unit id)
pub const MBAP_HEADER_LEN: usize = 7;

/// Upper bound on a Modbus TCP ADU
pub const MAX_ADU_LEN: usize = 260;

pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    pub const MASK_WRITE_REGISTER: u8 = 0x16;
}

/// MBAP (Modbus Application Protocol) header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id plus PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let t = self.transaction_id.to_be_bytes();
        let p = self.protocol_id.to_be_bytes();
        let l = self.length.to_be_bytes();
        [t[0], t[1], p[0], p[1], l[0], l[1], self.unit_id]
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(CommError::protocol("Invalid MBAP header length"));
        }

        let transaction_id = u16::from_be_bytes([data[0], data[1]]);
        let protocol_id = u16::from_be_bytes([data[2], data[3]]);
        let length = u16::from_be_bytes([data[4], data[5]]);
        let unit_id = data[6];

        if protocol_id != 0 {
            return Err(CommError::protocol(format!(
                "Invalid protocol ID: {}",
                protocol_id
            )));
        }
        if length < 2 {
            return Err(CommError::protocol(format!("Invalid MBAP length: {}", length)));
        }

        Ok(Self {
            transaction_id,
            protocol_id,
            length,
            unit_id,
        })
    }

    /// PDU length (length field minus unit id)
    pub fn pdu_length(&self) -> usize {
        self.length as usize - 1
    }
}

/// One Modbus TCP application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

impl ModbusFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Self {
        Self {
            header: MbapHeader::new(transaction_id, unit_id, pdu.len() as u16),
            pdu: Bytes::from(pdu),
        }
    }
}

/// Stream codec for MBAP-framed ADUs
#[derive(Debug, Default)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = ModbusFrame;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }
        let header = MbapHeader::from_bytes(&src[..MBAP_HEADER_LEN])?;
        let total = MBAP_HEADER_LEN + header.pdu_length();
        if total > MAX_ADU_LEN {
            return Err(CommError::protocol(format!("ADU too long: {} bytes", total)));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(MBAP_HEADER_LEN);
        let pdu = src.split_to(header.pdu_length()).freeze();
        Ok(Some(ModbusFrame { header, pdu }))
    }
}

impl Encoder<ModbusFrame> for MbapCodec {
    type Error = CommError;

    fn encode(&mut self, item: ModbusFrame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(MBAP_HEADER_LEN + item.pdu.len());
        dst.put_slice(&item.header.to_bytes());
        dst.put_slice(&item.pdu);
        Ok(())
    }
}

pub fn read_request(function: u8, address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

pub fn write_single_coil(address: u16, value: bool) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function::WRITE_SINGLE_COIL);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    pdu
}

/// FC 0F; `packed` holds coil states LSB first, 8 per byte
pub fn write_multiple_coils(address: u16, quantity: u16, packed: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + packed.len());
    pdu.push(function::WRITE_MULTIPLE_COILS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(packed);
    pdu
}

/// FC 10; `data` is register bytes as they appear on the wire
pub fn write_multiple_registers(address: u16, data: &[u8]) -> Vec<u8> {
    let quantity = (data.len() / 2) as u16;
    let mut pdu = Vec::with_capacity(6 + data.len());
    pdu.push(function::WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu.push(data.len() as u8);
    pdu.extend_from_slice(data);
    pdu
}

/// FC 16: result = (current AND and_mask) OR (or_mask AND NOT and_mask)
pub fn mask_write_register(address: u16, and_mask: u16, or_mask: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(7);
    pdu.push(function::MASK_WRITE_REGISTER);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&and_mask.to_be_bytes());
    pdu.extend_from_slice(&or_mask.to_be_bytes());
    pdu
}

fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

/// Validate a response PDU against the request function code.
///
/// Exception responses become `TransferFailed` with the exception code.
pub fn check_response(function: u8, pdu: &[u8]) -> Result<()> {
    let Some(&fc) = pdu.first() else {
        return Err(CommError::protocol("empty response PDU"));
    };
    if fc == function | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(CommError::TransferFailed {
            code: i32::from(code),
            message: exception_message(code).to_string(),
        });
    }
    if fc != function {
        return Err(CommError::protocol(format!(
            "function code mismatch: sent 0x{:02X}, got 0x{:02X}",
            function, fc
        )));
    }
    Ok(())
}

/// Data bytes of a read response (FC 01-04)
pub fn read_response_data(function: u8, pdu: &[u8], expected: usize) -> Result<Vec<u8>> {
    check_response(function, pdu)?;
    let count = *pdu
        .get(1)
        .ok_or_else(|| CommError::protocol("read response without byte count"))?
        as usize;
    let data = pdu
        .get(2..2 + count)
        .ok_or_else(|| CommError::protocol("read response shorter than its byte count"))?;
    if count != expected {
        return Err(CommError::protocol(format!(
            "expected {} data bytes, got {}",
            expected, count
        )));
    }
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_header_round_trip() {
        let header = MbapHeader::new(0x1234, 7, 5);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x07]);
        assert_eq!(MbapHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.pdu_length(), 5);
    }

    #[test]
    fn test_mbap_header_rejects_foreign_protocol() {
        let bytes = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01];
        assert!(matches!(
            MbapHeader::from_bytes(&bytes),
            Err(CommError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_codec_waits_for_complete_frame() {
        let mut codec = MbapCodec;
        let frame = ModbusFrame::new(9, 1, vec![0x03, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        let mut wire = BytesMut::new();
        codec.encode(frame.clone(), &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Two frames back to back, the second one incomplete
        let mut stream = wire.clone();
        stream.extend_from_slice(&wire[..4]);
        let decoded = codec.decode(&mut stream).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(stream.len(), 4);
        assert!(codec.decode(&mut stream).unwrap().is_none());
    }

    #[test]
    fn test_exception_response() {
        let err = read_response_data(function::READ_HOLDING_REGISTERS, &[0x83, 0x02], 4)
            .unwrap_err();
        assert_eq!(
            err,
            CommError::TransferFailed {
                code: 2,
                message: "illegal data address".into()
            }
        );
    }

    #[test]
    fn test_read_response_data() {
        let pdu = [0x03, 0x04, 0x00, 0x0A, 0x01, 0x02];
        let data = read_response_data(function::READ_HOLDING_REGISTERS, &pdu, 4).unwrap();
        assert_eq!(data, vec![0x00, 0x0A, 0x01, 0x02]);
        assert!(read_response_data(function::READ_HOLDING_REGISTERS, &pdu, 2).is_err());
        assert!(read_response_data(function::READ_HOLDING_REGISTERS, &pdu[..4], 4).is_err());
    }

    #[test]
    fn test_write_pdus() {
        assert_eq!(write_single_coil(3, true), vec![0x05, 0x00, 0x03, 0xFF, 0x00]);
        assert_eq!(
            mask_write_register(4, 0xFFFE, 0x0001),
            vec![0x16, 0x00, 0x04, 0xFF, 0xFE, 0x00, 0x01]
        );
        assert_eq!(
            write_multiple_registers(1, &[0x00, 0x2A]),
            vec![0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0x00, 0x2A]
        );
    }
}
