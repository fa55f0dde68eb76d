//! Modbus TCP 服务端：每个连接一个任务，按 MBAP 分帧后交给 codec 执行。
//!
//! - 半包跨多次 read 累积（`FrameBuffer`）
//! - 非法帧 / 不支持的功能码 / 越界请求：记日志并关闭该连接，不回异常帧
//! - 只服务配置的 unit id（`plc.unitId`）；发往其他站号的请求同样按非法请求关闭连接

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::rail::core::codec::{serve_frame, CodecError};
use crate::rail::core::frame::{FrameBuffer, FrameError};
use crate::rail::core::store::RegisterStore;

const READ_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct PlcServer {
    listener: TcpListener,
    store: Arc<RegisterStore>,
    unit_id: u8,
}

impl PlcServer {
    pub async fn bind(addr: &str, store: Arc<RegisterStore>, unit_id: u8) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store,
            unit_id,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; returns once `stop` flips to true or its sender is dropped.
    pub async fn serve(self, mut stop: watch::Receiver<bool>) {
        log::info!(
            "[plc] listening on {} (unit {})",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.unit_id
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let store = self.store.clone();
                            let unit_id = self.unit_id;
                            let stop = stop.clone();
                            tokio::spawn(async move {
                                log::info!("[plc][conn] {peer} connected");
                                match handle_connection(stream, store, unit_id, stop).await {
                                    Ok(()) => log::info!("[plc][conn] {peer} closed"),
                                    Err(err) => log::warn!("[plc][conn] {peer} dropped: {err}"),
                                }
                            });
                        }
                        Err(err) => log::warn!("[plc] accept failed: {err}"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("[plc] server stopped");
    }
}

/// Serve one client until it disconnects, sends something unservable, or `stop` fires.
pub async fn handle_connection(
    mut stream: TcpStream,
    store: Arc<RegisterStore>,
    unit_id: u8,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ServeError> {
    let mut buffer = FrameBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = tokio::select! {
            read = stream.read(&mut chunk) => read?,
            _ = stop.changed() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }

        buffer.extend(&chunk[..n]);
        while let Some(request) = buffer.next_frame()? {
            let response = serve_frame(&store, unit_id, &request)?;
            stream.write_all(&response.to_bytes()).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::rail::core::codec::{request_frame, Request};
    use crate::rail::core::frame::AduFrame;

    async fn start() -> (SocketAddr, Arc<RegisterStore>, watch::Sender<bool>) {
        let store = Arc::new(RegisterStore::with_defaults(200, 300).unwrap());
        let server = PlcServer::bind("127.0.0.1:0", store.clone(), 1).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.serve(stop_rx));
        (addr, store, stop_tx)
    }

    async fn read_frame(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> AduFrame {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = buffer.next_frame().unwrap() {
                return frame;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed the connection");
            buffer.extend(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn request_split_across_writes_is_answered_once() {
        let (addr, store, _stop) = start().await;
        store.write_registers(0, &[1, 0, 1]).unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = request_frame(0x0A0B, 1, &Request::ReadHoldingRegisters { address: 0, count: 3 })
            .to_bytes();
        stream.write_all(&bytes[..5]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stream.write_all(&bytes[5..]).await.unwrap();

        let response = read_frame(&mut stream, &mut FrameBuffer::new()).await;
        assert_eq!(response.transaction_id, 0x0A0B);
        assert_eq!(response.unit_id, 1);
        assert_eq!(response.pdu, vec![0x03, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn out_of_range_request_closes_the_connection() {
        let (addr, _store, _stop) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = request_frame(1, 1, &Request::ReadHoldingRegisters { address: 299, count: 2 })
            .to_bytes();
        stream.write_all(&bytes).await.unwrap();

        let mut chunk = [0u8; 64];
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn request_for_another_unit_closes_the_connection() {
        let (addr, store, _stop) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = request_frame(
            1,
            7,
            &Request::WriteSingleRegister {
                address: 50,
                value: 1,
            },
        )
        .to_bytes();
        stream.write_all(&bytes).await.unwrap();

        let mut chunk = [0u8; 64];
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(store.register(50).unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_length_field_closes_the_connection() {
        let (addr, _store, _stop) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x03])
            .await
            .unwrap();

        let mut chunk = [0u8; 64];
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let (addr, store, _stop) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut bytes = request_frame(
            1,
            1,
            &Request::WriteSingleRegister {
                address: 50,
                value: 1,
            },
        )
        .to_bytes();
        bytes.extend(request_frame(2, 1, &Request::ReadCoils { address: 0, count: 2 }).to_bytes());
        stream.write_all(&bytes).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let first = read_frame(&mut stream, &mut buffer).await;
        let second = read_frame(&mut stream, &mut buffer).await;
        assert_eq!(first.transaction_id, 1);
        assert_eq!(first.pdu, vec![0x06, 0x00, 0x32, 0x00, 0x01]);
        assert_eq!(second.transaction_id, 2);
        assert_eq!(second.pdu, vec![0x01, 0x01, 0x01]);
        assert_eq!(store.register(50).unwrap(), 1);
    }
}
