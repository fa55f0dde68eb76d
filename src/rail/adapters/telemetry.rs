//! 遥测输出：每帧一个 JSON 对象，UDP 发给 HMI；发送失败直接忽略。

use std::io;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;

use crate::rail::core::automaton::YardSnapshot;

pub trait TelemetrySink: Send {
    fn publish(&mut self, snapshot: &YardSnapshot);
}

/// Seconds since the Unix epoch with millisecond resolution.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub struct UdpTelemetrySink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTelemetrySink {
    pub async fn connect(target: &str) -> io::Result<Self> {
        let target: SocketAddr = target.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid telemetry addr {target}: {e}"),
            )
        })?;
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self { socket, target })
    }
}

impl TelemetrySink for UdpTelemetrySink {
    fn publish(&mut self, snapshot: &YardSnapshot) {
        let bytes = match serde_json::to_vec(snapshot) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::debug!("[sim] telemetry encode failed: {err}");
                return;
            }
        };
        if let Err(err) = self.socket.try_send_to(&bytes, self.target) {
            log::debug!("[sim] telemetry send failed: {err}");
        }
    }
}

/// Used when telemetry is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&mut self, _snapshot: &YardSnapshot) {}
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::TimeZone;

    use super::*;
    use crate::rail::core::automaton::{Automaton, AutomatonTiming};

    #[test]
    fn unix_seconds_keeps_milliseconds() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        assert_eq!(unix_seconds(at), 1_700_000_000.25);
    }

    #[tokio::test]
    async fn snapshot_arrives_as_one_json_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap().to_string();
        let mut sink = UdpTelemetrySink::connect(&target).await.unwrap();

        let now = Instant::now();
        let snapshot = Automaton::new(AutomatonTiming::default(), now).snapshot(now, 12.5);
        sink.publish(&snapshot);

        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["t"], 12.5);
        assert_eq!(value["comms"], "OFF");
        assert_eq!(value["trains"]["T2"]["loc"], "S");
    }

    #[tokio::test]
    async fn invalid_target_is_rejected() {
        assert!(UdpTelemetrySink::connect("hmi").await.is_err());
    }
}
