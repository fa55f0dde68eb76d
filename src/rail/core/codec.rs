//! 协议编解码（codec）：Modbus PDU <-> Request/Response，以及服务端对 RegisterStore 的分发。
//!
//! 约定：
//! - 服务端只实现实验台需要的功能码：01/03/05/06/0F/10
//! - 只接受本站 unit id；响应回显调用方的 transaction id 与 unit id
//! - 非法请求与越界访问返回 `CodecError`，由连接层决定断开（不生成 Modbus 异常帧）

use thiserror::Error;

use super::frame::AduFrame;
use super::store::{RegisterStore, StoreError};

pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported function code: 0x{0:02X}")]
    UnsupportedFunction(u8),

    #[error("request for unit {0}, not served here")]
    UnknownUnit(u8),

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn invalid(reason: impl Into<String>) -> CodecError {
    CodecError::InvalidRequest {
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, count: u16 },
    WriteMultipleRegisters { address: u16, count: u16 },
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn expect_len(pdu: &[u8], expected: usize) -> Result<(), CodecError> {
    if pdu.len() != expected {
        return Err(invalid(format!(
            "function 0x{:02X} expects {} PDU bytes, got {}",
            pdu.first().copied().unwrap_or_default(),
            expected,
            pdu.len()
        )));
    }
    Ok(())
}

fn check_quantity(count: u16, max: u16) -> Result<(), CodecError> {
    if count == 0 || count > max {
        return Err(invalid(format!("quantity {count} outside 1..={max}")));
    }
    Ok(())
}

pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| (b >> (i % 8)) & 1 == 1))
        .collect()
}

fn header_fields(pdu: &[u8]) -> Result<(u16, u16), CodecError> {
    match (be_u16(pdu, 1), be_u16(pdu, 3)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(invalid(format!("PDU too short: {} bytes", pdu.len()))),
    }
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => function::READ_COILS,
            Request::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Request::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            Request::WriteMultipleCoils { .. } => function::WRITE_MULTIPLE_COILS,
            Request::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, CodecError> {
        let Some(&code) = pdu.first() else {
            return Err(invalid("empty PDU"));
        };

        match code {
            function::READ_COILS => {
                expect_len(pdu, 5)?;
                let (address, count) = header_fields(pdu)?;
                check_quantity(count, MAX_READ_COILS)?;
                Ok(Request::ReadCoils { address, count })
            }
            function::READ_HOLDING_REGISTERS => {
                expect_len(pdu, 5)?;
                let (address, count) = header_fields(pdu)?;
                check_quantity(count, MAX_READ_REGISTERS)?;
                Ok(Request::ReadHoldingRegisters { address, count })
            }
            function::WRITE_SINGLE_COIL => {
                expect_len(pdu, 5)?;
                let (address, raw) = header_fields(pdu)?;
                let value = match raw {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => return Err(invalid(format!("coil value 0x{other:04X}"))),
                };
                Ok(Request::WriteSingleCoil { address, value })
            }
            function::WRITE_SINGLE_REGISTER => {
                expect_len(pdu, 5)?;
                let (address, value) = header_fields(pdu)?;
                Ok(Request::WriteSingleRegister { address, value })
            }
            function::WRITE_MULTIPLE_COILS => {
                let (address, count) = header_fields(pdu)?;
                check_quantity(count, MAX_WRITE_COILS)?;
                let byte_count = (count as usize).div_ceil(8);
                if pdu.get(5).copied() != Some(byte_count as u8) {
                    return Err(invalid("byte count does not match coil quantity"));
                }
                expect_len(pdu, 6 + byte_count)?;
                let values = unpack_bits(&pdu[6..], count as usize);
                Ok(Request::WriteMultipleCoils { address, values })
            }
            function::WRITE_MULTIPLE_REGISTERS => {
                let (address, count) = header_fields(pdu)?;
                check_quantity(count, MAX_WRITE_REGISTERS)?;
                let byte_count = count as usize * 2;
                if pdu.get(5).copied() != Some(byte_count as u8) {
                    return Err(invalid("byte count does not match register quantity"));
                }
                expect_len(pdu, 6 + byte_count)?;
                let values = pdu[6..]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(Request::WriteMultipleRegisters { address, values })
            }
            other => Err(CodecError::UnsupportedFunction(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.function()];
        match self {
            Request::ReadCoils { address, count }
            | Request::ReadHoldingRegisters { address, count } => {
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteSingleCoil { address, value } => {
                let raw = if *value { COIL_ON } else { COIL_OFF };
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&raw.to_be_bytes());
            }
            Request::WriteSingleRegister { address, value } => {
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteMultipleCoils { address, values } => {
                let packed = pack_bits(values);
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&(values.len() as u16).to_be_bytes());
                out.push(packed.len() as u8);
                out.extend_from_slice(&packed);
            }
            Request::WriteMultipleRegisters { address, values } => {
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&(values.len() as u16).to_be_bytes());
                out.push((values.len() * 2) as u8);
                for value in values {
                    out.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        out
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::ReadCoils(bits) => {
                let packed = pack_bits(bits);
                let mut out = vec![function::READ_COILS, packed.len() as u8];
                out.extend_from_slice(&packed);
                out
            }
            Response::ReadHoldingRegisters(words) => {
                let mut out = vec![function::READ_HOLDING_REGISTERS, (words.len() * 2) as u8];
                for word in words {
                    out.extend_from_slice(&word.to_be_bytes());
                }
                out
            }
            Response::WriteSingleCoil { address, value } => {
                let raw = if *value { COIL_ON } else { COIL_OFF };
                let mut out = vec![function::WRITE_SINGLE_COIL];
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&raw.to_be_bytes());
                out
            }
            Response::WriteSingleRegister { address, value } => {
                let mut out = vec![function::WRITE_SINGLE_REGISTER];
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
                out
            }
            Response::WriteMultipleCoils { address, count } => {
                let mut out = vec![function::WRITE_MULTIPLE_COILS];
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
                out
            }
            Response::WriteMultipleRegisters { address, count } => {
                let mut out = vec![function::WRITE_MULTIPLE_REGISTERS];
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
                out
            }
        }
    }
}

/// 把一个请求映射到 store 的 read/write。
pub fn execute(store: &RegisterStore, request: &Request) -> Result<Response, StoreError> {
    match request {
        Request::ReadCoils { address, count } => {
            store.read_coils(*address, *count).map(Response::ReadCoils)
        }
        Request::ReadHoldingRegisters { address, count } => store
            .read_registers(*address, *count)
            .map(Response::ReadHoldingRegisters),
        Request::WriteSingleCoil { address, value } => {
            store.set_coil(*address, *value)?;
            Ok(Response::WriteSingleCoil {
                address: *address,
                value: *value,
            })
        }
        Request::WriteSingleRegister { address, value } => {
            store.set_register(*address, *value)?;
            Ok(Response::WriteSingleRegister {
                address: *address,
                value: *value,
            })
        }
        Request::WriteMultipleCoils { address, values } => {
            store.write_coils(*address, values)?;
            Ok(Response::WriteMultipleCoils {
                address: *address,
                count: values.len() as u16,
            })
        }
        Request::WriteMultipleRegisters { address, values } => {
            store.write_registers(*address, values)?;
            Ok(Response::WriteMultipleRegisters {
                address: *address,
                count: values.len() as u16,
            })
        }
    }
}

/// Server side of one request frame: decode, execute, frame the response.
/// Frames addressed to any unit other than `unit_id` are rejected untouched.
pub fn serve_frame(
    store: &RegisterStore,
    unit_id: u8,
    frame: &AduFrame,
) -> Result<AduFrame, CodecError> {
    if frame.unit_id != unit_id {
        return Err(CodecError::UnknownUnit(frame.unit_id));
    }
    let request = Request::decode(&frame.pdu)?;
    let response = execute(store, &request)?;
    Ok(AduFrame {
        transaction_id: frame.transaction_id,
        protocol_id: frame.protocol_id,
        unit_id: frame.unit_id,
        pdu: response.encode(),
    })
}

pub fn request_frame(transaction_id: u16, unit_id: u8, request: &Request) -> AduFrame {
    AduFrame::new(transaction_id, unit_id, request.encode())
}
