//! Modbus TCP 帧（MBAP）切分与组装。
//!
//! 帧格式：transaction id(2) + protocol id(2) + length(2) + unit id(1) + PDU，
//! 其中 length = unit id + PDU 的字节数，所以整帧长度为 `6 + length`。
//!
//! `FrameBuffer` 负责跨多次 socket read 累积字节：一次 read 可能包含多帧，
//! 也可能只包含半个 header；不完整的尾部字节保留到下一次 read。

use thiserror::Error;

pub const MBAP_HEADER_LEN: usize = 7;
/// Bytes preceding the unit id that are not counted by the length field.
pub const MBAP_PREFIX_LEN: usize = 6;
pub const MAX_PDU_LEN: usize = 253;
/// length 字段至少包含 unit id + function code。
pub const MIN_LENGTH_FIELD: u16 = 2;
pub const MAX_LENGTH_FIELD: u16 = (MAX_PDU_LEN + 1) as u16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    pub fn frame_len(&self) -> usize {
        MBAP_PREFIX_LEN + self.length as usize
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.length < MIN_LENGTH_FIELD || self.length > MAX_LENGTH_FIELD {
            return Err(FrameError::Malformed {
                reason: format!(
                    "length field {} outside {}..={} (transactionId={})",
                    self.length, MIN_LENGTH_FIELD, MAX_LENGTH_FIELD, self.transaction_id
                ),
            });
        }
        Ok(())
    }
}

/// One complete application data unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AduFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    /// function code + payload
    pub pdu: Vec<u8>,
}

impl AduFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            unit_id,
            pdu,
        }
    }

    pub fn function(&self) -> Option<u8> {
        self.pdu.first().copied()
    }

    pub fn length_field(&self) -> u16 {
        (self.pdu.len() + 1) as u16
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MBAP_HEADER_LEN + self.pdu.len());
        out.extend_from_slice(&self.transaction_id.to_be_bytes());
        out.extend_from_slice(&self.protocol_id.to_be_bytes());
        out.extend_from_slice(&self.length_field().to_be_bytes());
        out.push(self.unit_id);
        out.extend_from_slice(&self.pdu);
        out
    }

    /// Parse exactly one frame; trailing bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut buffer = FrameBuffer::new();
        buffer.extend(bytes);
        let frame = buffer.next_frame()?.ok_or_else(|| FrameError::Malformed {
            reason: format!("incomplete frame: {} bytes", bytes.len()),
        })?;
        if !buffer.is_empty() {
            return Err(FrameError::Malformed {
                reason: format!("{} trailing bytes after frame", buffer.len()),
            });
        }
        Ok(frame)
    }
}

#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 取出下一帧；数据不足时返回 `Ok(None)` 并保留已收字节。
    ///
    /// length 字段非法时返回 `Malformed`：此时帧边界已无法确定，调用方应断开连接，
    /// 缓冲区内容保持原样（不做猜测性重同步）。
    pub fn next_frame(&mut self) -> Result<Option<AduFrame>, FrameError> {
        let Some(header) = MbapHeader::parse(&self.pending) else {
            return Ok(None);
        };
        header.validate()?;

        let frame_len = header.frame_len();
        if self.pending.len() < frame_len {
            return Ok(None);
        }

        let pdu = self.pending[MBAP_HEADER_LEN..frame_len].to_vec();
        self.pending.drain(..frame_len);
        Ok(Some(AduFrame {
            transaction_id: header.transaction_id,
            protocol_id: header.protocol_id,
            unit_id: header.unit_id,
            pdu,
        }))
    }
}
