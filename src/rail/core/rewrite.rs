//! 在途帧改写规则（gateway 使用）。
//!
//! 只改写 "write multiple registers"（0x10）且目标区间覆盖受保护寄存器的帧：
//! 把该寄存器对应的两个字节替换为强制值，帧长度、transaction id 与其余字节不变。

use super::codec::{function, request_frame, Request};
use super::frame::AduFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RewriteRule {
    pub protected_register: u16,
    pub forced_value: u16,
}

impl RewriteRule {
    pub fn new(protected_register: u16, forced_value: u16) -> Self {
        Self {
            protected_register,
            forced_value,
        }
    }

    /// Byte offset of the protected register's value inside `pdu`, if the PDU
    /// is a multi-register write covering it.
    pub fn value_offset(&self, pdu: &[u8]) -> Option<usize> {
        if pdu.first().copied() != Some(function::WRITE_MULTIPLE_REGISTERS) || pdu.len() < 6 {
            return None;
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]) as u32;
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]) as u32;
        let target = self.protected_register as u32;
        if target < start || target >= start + quantity {
            return None;
        }

        // fc(1) + start(2) + qty(2) + byte count(1)
        let offset = 6 + (target - start) as usize * 2;
        if offset + 2 > pdu.len() {
            return None;
        }
        Some(offset)
    }

    /// 改写成功返回 true（即便原值已等于强制值）。
    pub fn apply(&self, frame: &mut AduFrame) -> bool {
        let Some(offset) = self.value_offset(&frame.pdu) else {
            return false;
        };
        frame.pdu[offset..offset + 2].copy_from_slice(&self.forced_value.to_be_bytes());
        true
    }
}

/// Next transaction id after the last one seen on the relay, wrapping at 2^16.
pub fn injection_transaction_id(last_seen: u16) -> u16 {
    last_seen.wrapping_add(1)
}

/// Single "write one register" frame sent outside the relay path.
pub fn injection_frame(last_seen: u16, unit_id: u8, register: u16, value: u16) -> AduFrame {
    request_frame(
        injection_transaction_id(last_seen),
        unit_id,
        &Request::WriteSingleRegister {
            address: register,
            value,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_signals_frame(tid: u16, values: [u16; 3]) -> AduFrame {
        request_frame(
            tid,
            1,
            &Request::WriteMultipleRegisters {
                address: 0,
                values: values.to_vec(),
            },
        )
    }

    #[test]
    fn rewrite_with_equal_value_is_byte_identical() {
        let rule = RewriteRule::new(1, 1);
        let original = write_signals_frame(0x0102, [1, 1, 1]);
        let mut frame = original.clone();

        assert!(rule.apply(&mut frame));
        assert_eq!(frame.to_bytes(), original.to_bytes());
    }

    #[test]
    fn rewrite_replaces_exactly_the_protected_register_bytes() {
        let rule = RewriteRule::new(1, 1);
        let original = write_signals_frame(0x0102, [0, 0, 0]);
        let mut frame = original.clone();

        assert!(rule.apply(&mut frame));

        let before = original.to_bytes();
        let after = frame.to_bytes();
        assert_eq!(before.len(), after.len());
        let changed: Vec<usize> = (0..before.len()).filter(|i| before[*i] != after[*i]).collect();
        // MBAP(7) + fc/start/qty/bytecount(6) + register 0(2) => register 1 low byte at 16
        assert_eq!(changed, vec![16]);
        assert_eq!(&after[15..17], &[0x00, 0x01]);
        assert_eq!(frame.transaction_id, 0x0102);
        assert_eq!(frame.length_field(), original.length_field());
    }

    #[test]
    fn frames_not_covering_the_register_pass_untouched() {
        let rule = RewriteRule::new(1, 1);

        let mut occupancy = request_frame(
            5,
            1,
            &Request::WriteMultipleRegisters {
                address: 100,
                values: vec![0, 1, 0, 0],
            },
        );
        let before = occupancy.clone();
        assert!(!rule.apply(&mut occupancy));
        assert_eq!(occupancy, before);

        let mut single = request_frame(
            6,
            1,
            &Request::WriteSingleRegister {
                address: 1,
                value: 0,
            },
        );
        let before = single.clone();
        assert!(!rule.apply(&mut single));
        assert_eq!(single, before);

        let mut read = request_frame(7, 1, &Request::ReadHoldingRegisters { address: 0, count: 3 });
        assert!(!rule.apply(&mut read));
    }

    #[test]
    fn truncated_payload_is_not_rewritten() {
        let rule = RewriteRule::new(2, 1);
        // quantity claims 3 registers but only one value is present
        let mut frame = AduFrame::new(1, 1, vec![0x10, 0x00, 0x00, 0x00, 0x03, 0x06, 0x00, 0x00]);
        let before = frame.clone();
        assert!(!rule.apply(&mut frame));
        assert_eq!(frame, before);
    }

    #[test]
    fn injection_frame_uses_next_transaction_id_and_wraps() {
        let frame = injection_frame(41, 1, 1, 1);
        assert_eq!(frame.transaction_id, 42);
        assert_eq!(
            frame.to_bytes(),
            vec![0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x01]
        );

        assert_eq!(injection_transaction_id(u16::MAX), 0);
    }
}
