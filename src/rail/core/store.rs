//! 寄存器存储（Register Store）：唯一的事实来源。
//!
//! - 两个定长、0-based 区域：coils（bit）与 holding registers（16-bit）
//! - 容量在创建时确定，之后不再扩缩
//! - 每次 read/write 在自身锁内完成，跨连接的串行化由这里提供，不依赖传输层

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{address, DEFAULT_COIL_CAPACITY, DEFAULT_REGISTER_CAPACITY};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Region {
    Coils,
    HoldingRegisters,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Coils => write!(f, "coils"),
            Region::HoldingRegisters => write!(f, "holding registers"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RegisterValues {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
}

impl RegisterValues {
    pub fn region(&self) -> Region {
        match self {
            RegisterValues::Coils(_) => Region::Coils,
            RegisterValues::Registers(_) => Region::HoldingRegisters,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RegisterValues::Coils(bits) => bits.len(),
            RegisterValues::Registers(words) => words.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{region} out of range: address={address} count={count} capacity={capacity}")]
    OutOfRange {
        region: Region,
        address: u16,
        count: usize,
        capacity: usize,
    },
}

#[derive(Debug)]
struct Tables {
    coils: Vec<bool>,
    registers: Vec<u16>,
}

#[derive(Debug)]
pub struct RegisterStore {
    tables: Mutex<Tables>,
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new(DEFAULT_COIL_CAPACITY, DEFAULT_REGISTER_CAPACITY)
    }
}

impl RegisterStore {
    pub fn new(coil_capacity: u16, register_capacity: u16) -> Self {
        Self {
            tables: Mutex::new(Tables {
                coils: vec![false; coil_capacity as usize],
                registers: vec![0; register_capacity as usize],
            }),
        }
    }

    /// 创建并写入上电默认值：道岔在正线，其余全部为 0。
    pub fn with_defaults(coil_capacity: u16, register_capacity: u16) -> Result<Self, StoreError> {
        let store = Self::new(coil_capacity, register_capacity);
        store.write_coils(address::CO_TURNOUT_MAIN, &[true, false])?;
        Ok(store)
    }

    pub fn capacity(&self, region: Region) -> usize {
        let tables = self.tables.lock();
        match region {
            Region::Coils => tables.coils.len(),
            Region::HoldingRegisters => tables.registers.len(),
        }
    }

    pub fn read(&self, region: Region, address: u16, count: u16) -> Result<RegisterValues, StoreError> {
        match region {
            Region::Coils => self.read_coils(address, count).map(RegisterValues::Coils),
            Region::HoldingRegisters => self
                .read_registers(address, count)
                .map(RegisterValues::Registers),
        }
    }

    pub fn write(&self, address: u16, values: &RegisterValues) -> Result<(), StoreError> {
        match values {
            RegisterValues::Coils(bits) => self.write_coils(address, bits),
            RegisterValues::Registers(words) => self.write_registers(address, words),
        }
    }

    pub fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, StoreError> {
        let tables = self.tables.lock();
        let range = checked_range(Region::Coils, tables.coils.len(), address, count as usize)?;
        Ok(tables.coils[range].to_vec())
    }

    pub fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, StoreError> {
        let tables = self.tables.lock();
        let range = checked_range(
            Region::HoldingRegisters,
            tables.registers.len(),
            address,
            count as usize,
        )?;
        Ok(tables.registers[range].to_vec())
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let range = checked_range(Region::Coils, tables.coils.len(), address, values.len())?;
        tables.coils[range].copy_from_slice(values);
        Ok(())
    }

    pub fn write_registers(&self, address: u16, values: &[u16]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let range = checked_range(
            Region::HoldingRegisters,
            tables.registers.len(),
            address,
            values.len(),
        )?;
        tables.registers[range].copy_from_slice(values);
        Ok(())
    }

    pub fn coil(&self, address: u16) -> Result<bool, StoreError> {
        Ok(self.read_coils(address, 1)?[0])
    }

    pub fn set_coil(&self, address: u16, value: bool) -> Result<(), StoreError> {
        self.write_coils(address, &[value])
    }

    pub fn register(&self, address: u16) -> Result<u16, StoreError> {
        Ok(self.read_registers(address, 1)?[0])
    }

    pub fn set_register(&self, address: u16, value: u16) -> Result<(), StoreError> {
        self.write_registers(address, &[value])
    }
}

fn checked_range(
    region: Region,
    capacity: usize,
    address: u16,
    count: usize,
) -> Result<std::ops::Range<usize>, StoreError> {
    let start = address as usize;
    let end = start + count;
    if end > capacity {
        return Err(StoreError::OutOfRange {
            region,
            address,
            count,
            capacity,
        });
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_put_turnout_on_main_and_everything_else_zero() {
        let store = RegisterStore::with_defaults(200, 300).unwrap();

        assert_eq!(store.read_coils(0, 2).unwrap(), vec![true, false]);
        assert!(store.read_registers(0, 300).unwrap().iter().all(|v| *v == 0));
        assert_eq!(store.capacity(Region::Coils), 200);
        assert_eq!(store.capacity(Region::HoldingRegisters), 300);
    }

    #[test]
    fn reads_past_capacity_are_rejected_not_clamped() {
        let store = RegisterStore::new(8, 16);

        let err = store.read_registers(14, 3).unwrap_err();
        assert_eq!(
            err,
            StoreError::OutOfRange {
                region: Region::HoldingRegisters,
                address: 14,
                count: 3,
                capacity: 16,
            }
        );
        assert!(store.read_coils(8, 1).is_err());
        assert_eq!(store.read_registers(14, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn failed_write_leaves_store_untouched() {
        let store = RegisterStore::new(8, 4);
        store.write_registers(2, &[7, 8]).unwrap();

        assert!(store.write_registers(3, &[1, 2]).is_err());
        assert_eq!(store.read_registers(0, 4).unwrap(), vec![0, 0, 7, 8]);
    }

    #[test]
    fn generic_read_write_dispatch_by_region() {
        let store = RegisterStore::default();
        store
            .write(100, &RegisterValues::Registers(vec![1, 0, 1, 0]))
            .unwrap();
        store.write(0, &RegisterValues::Coils(vec![false, true])).unwrap();

        let regs = store.read(Region::HoldingRegisters, 100, 4).unwrap();
        assert_eq!(regs, RegisterValues::Registers(vec![1, 0, 1, 0]));
        assert_eq!(regs.region(), Region::HoldingRegisters);

        let coils = store.read(Region::Coils, 0, 2).unwrap();
        assert_eq!(coils, RegisterValues::Coils(vec![false, true]));
        assert_eq!(store.register(102).unwrap(), 1);
        assert!(store.coil(1).unwrap());
    }
}
