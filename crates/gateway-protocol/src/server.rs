//! MLLP监听器实现
//!
//! 每个连接一对任务：读取任务负责PROXY头和MLLP分帧，处理任务按到达顺序
//! 逐条处理并回写ACK。两者之间用通道连接，分帧状态从不跨连接共享。

use crate::mllp::{MllpCodec, DEFAULT_MAX_FRAME_BYTES};
use crate::proxy_protocol::{self, HEADER_LEN, SIGNATURE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use gateway_core::{ProxyProtocolInfo, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn, Instrument};

/// MLLP监听器配置
#[derive(Debug, Clone)]
pub struct MllpServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
    pub proxy_protocol: bool,
    pub read_timeout: Duration,
}

impl Default for MllpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2575,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            proxy_protocol: true,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// 单个连接的地址信息
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub listener_port: u16,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub proxy: Option<ProxyProtocolInfo>,
}

/// 读取任务交给处理任务的事件
#[derive(Debug, Clone)]
pub enum Inbound {
    Frame(Bytes),
    /// 读取超时时缓冲区内仍有未完成的帧
    ReadTimeout { partial_bytes: usize },
}

/// 连接上每条入站事件的处理者，返回需要回写的确认消息体
#[async_trait]
pub trait MllpProcessor: Send + Sync {
    async fn process(&self, inbound: Inbound, connection: &ConnectionInfo) -> Option<String>;
}

/// MLLP服务器
#[derive(Clone)]
pub struct MllpServer {
    config: MllpServerConfig,
    processor: Arc<dyn MllpProcessor>,
}

impl MllpServer {
    pub fn new(config: MllpServerConfig, processor: Arc<dyn MllpProcessor>) -> Self {
        Self { config, processor }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// 绑定端口并开始接受连接
    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("MLLP listener started on {}", addr);
        self.serve(listener).await
    }

    /// 在已绑定的监听器上接受连接
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    debug!("Accepted MLLP connection from {}", remote_addr);
                    let server = self.clone();
                    let span = tracing::info_span!("mllp", port = server.config.port, peer = %remote_addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_connection(stream, remote_addr).await {
                                error!("MLLP connection failed: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!("Failed to accept MLLP connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let local_address = stream.local_addr().ok();

        let (proxy, leftover) = if self.config.proxy_protocol {
            self.read_proxy_header(&mut stream).await?
        } else {
            (None, BytesMut::new())
        };
        if let Some(info) = &proxy {
            debug!("PROXY header: {}", info);
        }

        let connection = ConnectionInfo {
            listener_port: self.config.port,
            local_address,
            remote_address: Some(remote_addr),
            proxy,
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, MllpCodec::new(self.config.max_frame_bytes));
        reader.read_buffer_mut().extend_from_slice(&leftover);
        let mut writer = FramedWrite::new(write_half, MllpCodec::new(self.config.max_frame_bytes));

        let (tx, mut rx) = mpsc::channel::<Inbound>(32);
        let read_timeout = self.config.read_timeout;

        let read_task = tokio::spawn(
            async move {
                loop {
                    match tokio::time::timeout(read_timeout, reader.next()).await {
                        Ok(Some(Ok(frame))) => {
                            if tx.send(Inbound::Frame(frame)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Err(e))) => {
                            // 帧级损坏才关闭连接
                            warn!("Closing MLLP connection: {}", e);
                            break;
                        }
                        Ok(None) => {
                            debug!("MLLP connection closed by peer");
                            break;
                        }
                        Err(_) => {
                            let partial_bytes = reader.read_buffer().len();
                            if partial_bytes == 0 {
                                continue;
                            }
                            warn!("Read timeout with {} buffered bytes", partial_bytes);
                            reader.read_buffer_mut().clear();
                            reader.decoder_mut().reset();
                            if tx.send(Inbound::ReadTimeout { partial_bytes }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        while let Some(inbound) = rx.recv().await {
            if let Some(ack) = self.processor.process(inbound, &connection).await {
                if let Err(e) = writer.send(Bytes::from(ack)).await {
                    error!("Failed to write MLLP acknowledgement: {}", e);
                    break;
                }
            }
        }

        read_task.abort();
        Ok(())
    }

    // 读取并解码PROXY v2头部，返回剩余已读数据
    async fn read_proxy_header(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(Option<ProxyProtocolInfo>, BytesMut)> {
        let mut buf = BytesMut::with_capacity(512);
        let read = async {
            loop {
                let prefix = buf.len().min(SIGNATURE.len());
                if SIGNATURE[..prefix] != buf[..prefix] {
                    break;
                }
                let wanted = proxy_protocol::header_len(&buf).unwrap_or(HEADER_LEN);
                if buf.len() >= wanted {
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    break;
                }
            }
            Ok::<(), std::io::Error>(())
        };

        match tokio::time::timeout(self.config.read_timeout, read).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Timed out reading PROXY header");
                return Ok((None, buf));
            }
        }

        let decoded = proxy_protocol::decode(&buf);
        let info = decoded.info.clone();
        let leftover = BytesMut::from(decoded.payload);
        Ok((info, leftover))
    }
}
