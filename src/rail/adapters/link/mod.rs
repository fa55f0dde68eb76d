//! `PlcLink` 的实现：真实 Modbus TCP 客户端与基于内存寄存器表的 mock。

pub mod mock;
pub mod modbus_tcp;

pub use crate::rail::core::link::{LinkError, LinkFuture, PlcLink};
