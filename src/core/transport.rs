//! 传输层 - TCP 字节管道
//!
//! 协议没有长度前缀：发送端写完后关闭写方向，接收端读到 EOF 即视为收到
//! 完整压缩包。接收端解包成功后回复 `OK`，发送端据此判断是否可以提交快照。

use crate::error::{HotpushError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 流式发送的分块大小
pub const CHUNK_SIZE: usize = 256 * 1024;
/// 接收端确认报文
pub const ACK: &[u8] = b"OK";

/// 把压缩包送达某台设备
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// 成功返回发送的字节数；只有收到设备确认才算成功
    async fn deliver(&self, device: &str, archive: &Path) -> Result<u64>;
}

/// TCP 发送端
#[derive(Debug, Clone)]
pub struct TcpSender {
    port: u16,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl TcpSender {
    pub fn new(port: u16, connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            ack_timeout,
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(HotpushError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(HotpushError::Connect {
                addr: addr.to_string(),
                reason: format!("{:?} 内未建立连接", self.connect_timeout),
            }),
        }
    }
}

/// 设备地址：自带端口时原样使用，IPv6 字面量加方括号
pub fn device_addr(device: &str, port: u16) -> String {
    let device = device.trim();
    if device.parse::<SocketAddr>().is_ok() {
        return device.to_string();
    }
    if let Ok(ip) = device.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match device.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => device.to_string(),
        _ => format!("{}:{}", device, port),
    }
}

#[async_trait]
impl ArchiveSink for TcpSender {
    async fn deliver(&self, device: &str, archive: &Path) -> Result<u64> {
        let addr = device_addr(device, self.port);
        let mut stream = self.connect(&addr).await?;
        debug!("已连接设备 {}", addr);

        let transport_err = |e: std::io::Error| HotpushError::Transport {
            addr: addr.clone(),
            source: e,
        };

        let mut file = tokio::fs::File::open(archive)
            .await
            .map_err(|e| HotpushError::io(archive, e))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;

        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| HotpushError::io(archive, e))?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.map_err(transport_err)?;
            sent += n as u64;
        }

        // 关闭写方向，接收端据此判断数据结束
        stream.shutdown().await.map_err(transport_err)?;
        info!("已发送 {} 字节到 {}，等待确认", sent, addr);

        let mut reply = Vec::new();
        match timeout(
            self.ack_timeout,
            (&mut stream).take(16).read_to_end(&mut reply),
        )
        .await
        {
            Ok(Ok(_)) if reply.starts_with(ACK) => {
                info!("设备 {} 已确认", addr);
                Ok(sent)
            }
            Ok(Ok(_)) => {
                warn!("设备 {} 未返回确认: {:?}", addr, String::from_utf8_lossy(&reply));
                Err(HotpushError::NoAck(addr.clone()))
            }
            Ok(Err(e)) => Err(transport_err(e)),
            Err(_) => {
                warn!("等待设备 {} 确认超时", addr);
                Err(HotpushError::NoAck(addr.clone()))
            }
        }
    }
}

/// 事件循环交给连接任务的处理结果
///
/// 连接任务写完（或放弃写）确认后通过 `written` 回执。
#[derive(Debug)]
pub struct AckReply {
    pub applied: bool,
    written: oneshot::Sender<bool>,
}

impl AckReply {
    /// 回执确认是否已写入并关闭连接
    pub fn written(self, delivered: bool) {
        let _ = self.written.send(delivered);
    }
}

/// 接收到的完整压缩包，连同确认回执
#[derive(Debug)]
pub struct IncomingArchive {
    pub peer: SocketAddr,
    pub data: Vec<u8>,
    ack: oneshot::Sender<AckReply>,
}

impl IncomingArchive {
    /// 构造一个待处理的压缩包，返回的接收端在处理完成后得到结果
    pub fn new(peer: SocketAddr, data: Vec<u8>) -> (Self, oneshot::Receiver<AckReply>) {
        let (ack, rx) = oneshot::channel();
        (Self { peer, data, ack }, rx)
    }

    /// 通知连接任务处理结果，并等待 `OK` 写完
    ///
    /// 返回 `true` 表示确认已写入套接字并关闭了写方向。
    pub async fn acknowledge(self, applied: bool) -> bool {
        let (written, written_rx) = oneshot::channel();
        // 连接已被取消时接收方不存在
        if self.ack.send(AckReply { applied, written }).is_err() {
            return false;
        }
        written_rx.await.unwrap_or(false)
    }
}

/// 设备端接收服务
pub struct ReceiverServer {
    listener: TcpListener,
}

impl ReceiverServer {
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| HotpushError::Transport { addr, source: e })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| HotpushError::Transport {
                addr: "listener".to_string(),
                source: e,
            })
    }

    /// 接受连接直到取消
    ///
    /// 每个连接一个任务，任务独占自己的接收缓冲区；收完后把数据交给事件循环
    /// 并等待处理结果。
    pub async fn run(self, tx: mpsc::Sender<IncomingArchive>, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!("接收服务已启动: {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("收到连接: {}", peer);
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("连接 {} 随服务关闭而中断", peer);
                            }
                            result = handle_connection(stream, peer, tx) => {
                                if let Err(e) = result {
                                    error!("处理连接 {} 失败: {}", peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("接受连接失败: {}", e);
                }
            }
        }

        info!("接收服务已停止");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<IncomingArchive>,
) -> Result<()> {
    let transport_err = |e: std::io::Error| HotpushError::Transport {
        addr: peer.to_string(),
        source: e,
    };

    let mut data = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buf).await.map_err(transport_err)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }

    if data.is_empty() {
        debug!("连接 {} 没有发送数据", peer);
        return Ok(());
    }
    info!("从 {} 收到 {:.1} KB", peer, data.len() as f64 / 1024.0);

    let (incoming, ack_rx) = IncomingArchive::new(peer, data);
    if tx.send(incoming).await.is_err() {
        warn!("事件循环已关闭，丢弃来自 {} 的数据", peer);
        return Ok(());
    }

    match ack_rx.await {
        Ok(reply) if reply.applied => {
            let result = async {
                stream.write_all(ACK).await?;
                stream.shutdown().await
            }
            .await;
            reply.written(result.is_ok());
            result.map_err(transport_err)?;
        }
        Ok(reply) => {
            warn!("更新未成功应用，不向 {} 发送确认", peer);
            reply.written(false);
        }
        Err(_) => {
            warn!("事件循环未返回处理结果，不向 {} 发送确认", peer);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_server() -> (u16, mpsc::Receiver<IncomingArchive>, CancellationToken) {
        let server = ReceiverServer::bind("127.0.0.1", 0).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(tx, cancel.clone()));
        (port, rx, cancel)
    }

    fn sender(port: u16) -> TcpSender {
        TcpSender::new(port, Duration::from_secs(1), Duration::from_secs(3))
    }

    fn payload(dir: &Path, len: usize) -> std::path::PathBuf {
        let path = dir.join("app_copy.zip");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_stream_until_close_and_ack() {
        let (port, mut rx, cancel) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        // 超过一个分块
        let archive = payload(dir.path(), CHUNK_SIZE * 2 + 17);
        let expected = std::fs::read(&archive).unwrap();

        let receiver = tokio::spawn(async move {
            let incoming = rx.recv().await.unwrap();
            let ok = incoming.data == expected;
            incoming.acknowledge(ok).await
        });

        let sent = sender(port).deliver("127.0.0.1", &archive).await.unwrap();
        assert_eq!(sent, (CHUNK_SIZE * 2 + 17) as u64);
        assert!(receiver.await.unwrap());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_rejected_apply_is_no_ack() {
        let (port, mut rx, cancel) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let archive = payload(dir.path(), 100);

        let receiver = tokio::spawn(async move {
            let incoming = rx.recv().await.unwrap();
            incoming.acknowledge(false).await
        });

        let err = sender(port).deliver("127.0.0.1", &archive).await.unwrap_err();
        assert!(matches!(err, HotpushError::NoAck(_)));
        assert!(err.is_transport());
        assert!(!receiver.await.unwrap());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();
        let archive = payload(dir.path(), 10);

        let err = sender(port).deliver("127.0.0.1", &archive).await.unwrap_err();
        assert!(matches!(err, HotpushError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_cancel_stops_accepting() {
        let server = ReceiverServer::bind("127.0.0.1", 0).await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(tx, cancel.clone()));
        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_acknowledge_returns_after_ok_is_readable() {
        let (port, mut rx, cancel) = start_server().await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"archive bytes").await.unwrap();
        client.shutdown().await.unwrap();

        let incoming = rx.recv().await.unwrap();
        assert!(incoming.acknowledge(true).await);

        // 确认返回时 OK 已经在发送端的接收缓冲区里
        let std_client = client.into_std().unwrap();
        std_client.set_nonblocking(true).unwrap();
        let mut reply = [0u8; 2];
        let n = std::io::Read::read(&mut &std_client, &mut reply).unwrap();
        assert_eq!(&reply[..n], ACK);
        cancel.cancel();
    }

    #[test]
    fn test_device_addr_forms() {
        assert_eq!(device_addr("192.168.1.5", 8050), "192.168.1.5:8050");
        assert_eq!(device_addr("192.168.1.5:9000", 8050), "192.168.1.5:9000");
        assert_eq!(device_addr("::1", 8050), "[::1]:8050");
        assert_eq!(device_addr("[fe80::1]:9000", 8050), "[fe80::1]:9000");
        assert_eq!(device_addr("phone.local", 8050), "phone.local:8050");
        assert_eq!(device_addr("phone.local:9001", 8050), "phone.local:9001");
    }
}
