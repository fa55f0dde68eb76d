//! Modbus TCP link（tokio-modbus 客户端）。
//!
//! 每个请求都套一层 `tokio::time::timeout`；任何失败都丢弃连接，由上层在下次轮询时重连。

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::error::Elapsed;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;

use super::{LinkError, LinkFuture, PlcLink};
use crate::rail::core::model::SimulatorConfig;

pub struct ModbusTcpLink {
    addr: SocketAddr,
    unit_id: u8,
    request_timeout: Duration,
    ctx: Option<Context>,
}

impl ModbusTcpLink {
    pub fn new(addr: SocketAddr, unit_id: u8, request_timeout: Duration) -> Self {
        Self {
            addr,
            unit_id,
            request_timeout,
            ctx: None,
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Result<Self, LinkError> {
        let addr = config.plc_addr.parse().map_err(|e| LinkError::Comm {
            message: format!("invalid socket addr {}: {e}", config.plc_addr),
        })?;
        Ok(Self::new(
            addr,
            config.unit_id,
            Duration::from_millis(config.request_timeout_ms),
        ))
    }

    fn settle<T>(
        &mut self,
        result: Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T, LinkError> {
        let err = match result {
            Ok(Ok(Ok(value))) => return Ok(value),
            Ok(Ok(Err(exception))) => LinkError::Exception {
                message: exception.to_string(),
            },
            Ok(Err(e)) => LinkError::Comm {
                message: e.to_string(),
            },
            Err(_) => LinkError::Timeout,
        };
        self.ctx = None;
        Err(err)
    }
}

impl PlcLink for ModbusTcpLink {
    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn connect(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let connecting = tcp::connect_slave(self.addr, Slave(self.unit_id));
            let ctx = tokio::time::timeout(self.request_timeout, connecting)
                .await
                .map_err(|_| LinkError::Timeout)?
                .map_err(|e| LinkError::Comm {
                    message: e.to_string(),
                })?;
            self.ctx = Some(ctx);
            Ok(())
        })
    }

    fn disconnect(&mut self) {
        self.ctx = None;
    }

    fn read_coils(&mut self, address: u16, count: u16) -> LinkFuture<'_, Vec<bool>> {
        Box::pin(async move {
            let timeout = self.request_timeout;
            let ctx = self.ctx.as_mut().ok_or(LinkError::Disconnected)?;
            let result = tokio::time::timeout(timeout, ctx.read_coils(address, count)).await;
            let mut coils = self.settle(result)?;
            coils.truncate(count as usize);
            Ok(coils)
        })
    }

    fn read_holding_registers(&mut self, address: u16, count: u16) -> LinkFuture<'_, Vec<u16>> {
        Box::pin(async move {
            let timeout = self.request_timeout;
            let ctx = self.ctx.as_mut().ok_or(LinkError::Disconnected)?;
            let result =
                tokio::time::timeout(timeout, ctx.read_holding_registers(address, count)).await;
            self.settle(result)
        })
    }

    fn write_registers<'a>(&'a mut self, address: u16, values: &'a [u16]) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let timeout = self.request_timeout;
            let ctx = self.ctx.as_mut().ok_or(LinkError::Disconnected)?;
            let result =
                tokio::time::timeout(timeout, ctx.write_multiple_registers(address, values)).await;
            self.settle(result)
        })
    }

    fn write_coil(&mut self, address: u16, value: bool) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let timeout = self.request_timeout;
            let ctx = self.ctx.as_mut().ok_or(LinkError::Disconnected)?;
            let result = tokio::time::timeout(timeout, ctx.write_single_coil(address, value)).await;
            self.settle(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_without_connection_report_disconnected() {
        let mut link = ModbusTcpLink::new(
            "127.0.0.1:1".parse().unwrap(),
            1,
            Duration::from_millis(200),
        );
        assert!(!link.is_connected());
        assert_eq!(
            link.read_coils(0, 2).await.unwrap_err(),
            LinkError::Disconnected
        );
        assert_eq!(
            link.write_registers(0, &[1, 0, 0]).await.unwrap_err(),
            LinkError::Disconnected
        );
    }

    #[test]
    fn invalid_plc_addr_is_rejected() {
        let config = SimulatorConfig {
            plc_addr: "not-an-addr".to_string(),
            ..SimulatorConfig::default()
        };
        assert!(matches!(
            ModbusTcpLink::from_config(&config),
            Err(LinkError::Comm { .. })
        ));
    }
}
