//! Mock link：直接读写进程内的 `RegisterStore`，并记录每次调用。
//!
//! 用于状态机测试与离线演示；`set_online(false)` 模拟 PLC 不可达。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{LinkError, LinkFuture, PlcLink};
use crate::rail::core::store::{RegisterStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkOp {
    Connect,
    ReadCoils { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteRegisters { address: u16, values: Vec<u16> },
    WriteCoil { address: u16, value: bool },
}

impl LinkOp {
    pub fn is_write(&self) -> bool {
        matches!(self, LinkOp::WriteRegisters { .. } | LinkOp::WriteCoil { .. })
    }
}

/// Clones share the store, the journal and the online switch.
#[derive(Clone)]
pub struct StoreLink {
    store: Arc<RegisterStore>,
    connected: bool,
    online: Arc<AtomicBool>,
    journal: Arc<Mutex<Vec<LinkOp>>>,
}

impl StoreLink {
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self {
            store,
            connected: false,
            online: Arc::new(AtomicBool::new(true)),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn journal(&self) -> Vec<LinkOp> {
        self.journal.lock().clone()
    }

    pub fn writes(&self) -> Vec<LinkOp> {
        self.journal
            .lock()
            .iter()
            .filter(|op| op.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    fn begin(&mut self, op: LinkOp) -> Result<(), LinkError> {
        if !self.online.load(Ordering::SeqCst) {
            self.connected = false;
        }
        if !self.connected {
            return Err(LinkError::Disconnected);
        }
        self.journal.lock().push(op);
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T, StoreError>) -> Result<T, LinkError> {
        result.map_err(|e| {
            self.connected = false;
            LinkError::Exception {
                message: e.to_string(),
            }
        })
    }
}

impl PlcLink for StoreLink {
    fn is_connected(&self) -> bool {
        self.connected && self.online.load(Ordering::SeqCst)
    }

    fn connect(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err(LinkError::Comm {
                    message: "connection refused".to_string(),
                });
            }
            self.journal.lock().push(LinkOp::Connect);
            self.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn read_coils(&mut self, address: u16, count: u16) -> LinkFuture<'_, Vec<bool>> {
        Box::pin(async move {
            self.begin(LinkOp::ReadCoils { address, count })?;
            let result = self.store.read_coils(address, count);
            self.finish(result)
        })
    }

    fn read_holding_registers(&mut self, address: u16, count: u16) -> LinkFuture<'_, Vec<u16>> {
        Box::pin(async move {
            self.begin(LinkOp::ReadHoldingRegisters { address, count })?;
            let result = self.store.read_registers(address, count);
            self.finish(result)
        })
    }

    fn write_registers<'a>(&'a mut self, address: u16, values: &'a [u16]) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.begin(LinkOp::WriteRegisters {
                address,
                values: values.to_vec(),
            })?;
            let result = self.store.write_registers(address, values);
            self.finish(result)
        })
    }

    fn write_coil(&mut self, address: u16, value: bool) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.begin(LinkOp::WriteCoil { address, value })?;
            let result = self.store.set_coil(address, value);
            self.finish(result)
        })
    }
}
