//! 远端寄存器访问端口（port）：模式仲裁状态机只通过这个接口读写 PLC。
//!
//! 具体实现在 `adapters::link`（tokio-modbus TCP、内存 mock）。

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("disconnected")]
    Disconnected,

    #[error("timeout")]
    Timeout,

    #[error("comm error: {message}")]
    Comm { message: String },

    #[error("modbus exception: {message}")]
    Exception { message: String },
}

pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// Client side of the register protocol.
///
/// A failed call leaves the link disconnected; callers reconnect on their own
/// schedule via [`PlcLink::connect`].
pub trait PlcLink: Send {
    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> LinkFuture<'_, ()>;

    fn disconnect(&mut self);

    fn read_coils(&mut self, address: u16, count: u16) -> LinkFuture<'_, Vec<bool>>;

    fn read_holding_registers(&mut self, address: u16, count: u16) -> LinkFuture<'_, Vec<u16>>;

    fn write_registers<'a>(&'a mut self, address: u16, values: &'a [u16]) -> LinkFuture<'a, ()>;

    fn write_coil(&mut self, address: u16, value: bool) -> LinkFuture<'_, ()>;
}
