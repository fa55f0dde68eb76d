//! 帧改写代理（gateway）：夹在 SCADA/仿真客户端与 PLC 之间。
//!
//! 每个客户端连接一个 session：
//! - client -> server：按 MBAP 分帧，记录最近的 transaction id，命中规则的帧改写后转发
//! - server -> client：字节透传
//! - 注入：控制台通过 broadcast 发出强制值，session 用 `last + 1` 作为 transaction id 发单寄存器写
//!
//! 上游 socket 只有一个写者（mpsc 队列 + 独占 `OwnedWriteHalf`），改写后的转发帧与注入帧
//! 不会在字节层面交错。
//!
//! 关闭顺序：客户端 EOF 后先把队列里的帧写完并半关上游，再把 PLC 剩余的应答转回客户端；
//! PLC 先断开或上游写失败时，session 立即结束并关闭两端。

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::rail::core::frame::{FrameBuffer, FrameError};
use crate::rail::core::model::GatewayConfig;
use crate::rail::core::rewrite::{injection_frame, RewriteRule};

const READ_CHUNK: usize = 4096;
const UPSTREAM_QUEUE: usize = 64;
const INJECTION_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Sends forced values to every live session.
#[derive(Clone)]
pub struct Injector {
    tx: broadcast::Sender<u16>,
}

impl Injector {
    /// Returns how many sessions received the value.
    pub fn inject(&self, value: u16) -> usize {
        self.tx.send(value).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<u16> {
        self.tx.subscribe()
    }
}

#[derive(Clone, Copy, Debug)]
struct SessionSettings {
    upstream_addr: SocketAddr,
    unit_id: u8,
    rule: RewriteRule,
}

pub struct Gateway {
    listener: TcpListener,
    settings: SessionSettings,
    injector: Injector,
}

impl Gateway {
    pub async fn bind(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let upstream_addr = config.upstream_addr.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid upstream addr {}: {e}", config.upstream_addr),
            )
        })?;
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let (tx, _) = broadcast::channel(INJECTION_QUEUE);
        Ok(Self {
            listener,
            settings: SessionSettings {
                upstream_addr,
                unit_id: config.unit_id,
                rule: RewriteRule::new(config.protected_register, config.forced_value),
            },
            injector: Injector { tx },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }

    pub async fn serve(self, mut stop: watch::Receiver<bool>) {
        log::info!(
            "[gateway] listening on {} -> upstream {} (register {} forced to {})",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.settings.upstream_addr,
            self.settings.rule.protected_register,
            self.settings.rule.forced_value
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            let settings = self.settings;
                            let injections = self.injector.subscribe();
                            let stop = stop.clone();
                            tokio::spawn(async move {
                                let session_id = Uuid::new_v4();
                                log::info!("[gateway][session] {session_id} opened for {peer}");
                                match run_session(client, settings, injections, stop, session_id).await {
                                    Ok(()) => log::info!("[gateway][session] {session_id} closed"),
                                    Err(err) => log::warn!("[gateway][session] {session_id} ended: {err}"),
                                }
                            });
                        }
                        Err(err) => log::warn!("[gateway] accept failed: {err}"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("[gateway] stopped");
    }
}

async fn run_session(
    client: TcpStream,
    settings: SessionSettings,
    mut injections: broadcast::Receiver<u16>,
    mut stop: watch::Receiver<bool>,
    session_id: Uuid,
) -> Result<(), GatewayError> {
    let upstream = TcpStream::connect(settings.upstream_addr).await?;
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, upstream_wr) = upstream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(UPSTREAM_QUEUE);
    let injection_tx = tx.clone();
    let last_tid = AtomicU16::new(0);

    // Both senders live inside `feeders`; once the client is done they are
    // dropped and the writer drains whatever is still queued.
    let feeders = async {
        let relay_tx = tx;
        let injection_tx = injection_tx;
        tokio::select! {
            res = relay_requests(&mut client_rd, &relay_tx, settings.rule, &last_tid, session_id) => res,
            () = forward_injections(&mut injections, &injection_tx, &last_tid, settings, session_id) => Ok(()),
        }
    };
    let to_plc = async {
        let writer = write_upstream(upstream_wr, rx);
        tokio::pin!(writer);
        tokio::select! {
            res = &mut writer => res,
            res = feeders => {
                res?;
                writer.await
            }
        }
    };
    let to_client = async {
        tokio::io::copy(&mut upstream_rd, &mut client_wr).await?;
        let _ = client_wr.shutdown().await;
        Ok::<(), GatewayError>(())
    };
    tokio::pin!(to_plc, to_client);

    // client side finished: keep relaying replies until the PLC closes too
    let session = async {
        tokio::select! {
            res = &mut to_plc => {
                res?;
                to_client.as_mut().await
            }
            res = &mut to_client => res,
        }
    };

    tokio::select! {
        res = session => res,
        _ = stop.changed() => Ok(()),
    }
}

async fn relay_requests(
    reader: &mut OwnedReadHalf,
    upstream: &mpsc::Sender<Vec<u8>>,
    rule: RewriteRule,
    last_tid: &AtomicU16,
    session_id: Uuid,
) -> Result<(), GatewayError> {
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend(&chunk[..n]);

        loop {
            let mut frame = match buffer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("[gateway][session] {session_id} malformed client traffic: {err}");
                    return Err(err.into());
                }
            };
            last_tid.store(frame.transaction_id, Ordering::SeqCst);
            if rule.apply(&mut frame) {
                log::debug!(
                    "[gateway][session] {session_id} rewrote register {} to {} (tid={})",
                    rule.protected_register,
                    rule.forced_value,
                    frame.transaction_id
                );
            }
            if upstream.send(frame.to_bytes()).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// The only task that writes to the upstream socket; returns once every
/// sender is gone and the queue is drained.
async fn write_upstream(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
) -> Result<(), GatewayError> {
    while let Some(bytes) = frames.recv().await {
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    // queue closed: half-close so the PLC answers what it has and hangs up
    writer.shutdown().await?;
    Ok(())
}

/// Never completes unless the upstream queue is gone.
async fn forward_injections(
    injections: &mut broadcast::Receiver<u16>,
    upstream: &mpsc::Sender<Vec<u8>>,
    last_tid: &AtomicU16,
    settings: SessionSettings,
    session_id: Uuid,
) {
    loop {
        let value = match injections.recv().await {
            Ok(value) => value,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("[gateway][session] {session_id} skipped {skipped} injections");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
                return;
            }
        };

        let frame = injection_frame(
            last_tid.load(Ordering::SeqCst),
            settings.unit_id,
            settings.rule.protected_register,
            value,
        );
        log::warn!(
            "[gateway][session] {session_id} injected register {} = {} (tid={})",
            settings.rule.protected_register,
            value,
            frame.transaction_id
        );
        if upstream.send(frame.to_bytes()).await.is_err() {
            return;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Inject(u16),
    Quit,
}

/// `g` -> proceed (1), `r` -> stop (0), `q` -> leave the console.
pub fn parse_console_command(line: &str) -> Option<ConsoleCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "g" => Some(ConsoleCommand::Inject(1)),
        "r" => Some(ConsoleCommand::Inject(0)),
        "q" => Some(ConsoleCommand::Quit),
        _ => None,
    }
}

/// Reads commands line by line until `q` or EOF; relaying is unaffected either way.
pub async fn run_console<R>(reader: R, injector: Injector) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_console_command(&line) {
            Some(ConsoleCommand::Inject(value)) => {
                let sessions = injector.inject(value);
                log::warn!("[gateway] manual override value={value} sent to {sessions} session(s)");
            }
            Some(ConsoleCommand::Quit) => {
                log::info!("[gateway] console closed, relaying continues");
                break;
            }
            None => {
                if !line.trim().is_empty() {
                    log::info!("[gateway] unknown command {:?} (g = proceed, r = stop, q = quit)", line.trim());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_commands_are_case_insensitive() {
        assert_eq!(parse_console_command("g"), Some(ConsoleCommand::Inject(1)));
        assert_eq!(parse_console_command(" R \n"), Some(ConsoleCommand::Inject(0)));
        assert_eq!(parse_console_command("Q"), Some(ConsoleCommand::Quit));
        assert_eq!(parse_console_command("x"), None);
        assert_eq!(parse_console_command(""), None);
    }

    #[tokio::test]
    async fn injector_without_sessions_reaches_nobody() {
        let config = GatewayConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..GatewayConfig::default()
        };
        let gateway = Gateway::bind(&config).await.unwrap();
        assert_eq!(gateway.injector().inject(1), 0);
    }

    #[tokio::test]
    async fn console_stops_at_quit() {
        let (tx, _rx_keepalive) = broadcast::channel(4);
        let mut rx = tx.subscribe();
        let injector = Injector { tx };

        let input: &[u8] = b"g\nr\nq\ng\n";
        run_console(input, injector).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_upstream_addr_is_rejected() {
        let config = GatewayConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            upstream_addr: "plc".to_string(),
            ..GatewayConfig::default()
        };
        assert!(matches!(
            Gateway::bind(&config).await,
            Err(GatewayError::Io(_))
        ));
    }
}
