//! 接入网关主程序

use anyhow::Result;
use clap::Parser;
use gateway_admin::{init_logging, GatewayConfig, LogFormat, QueueProvider};
use gateway_core::RequestContextBuilder;
use gateway_integration::{
    default_handlers, AmqpQueue, ApiServer, ApiState, InMemoryQueue, IngestionPersistence,
    IngestionProcessor, IngestionRouter, InputKind, MessageGroupService, MessageQueue,
    MllpIngestService,
};
use gateway_protocol::{MllpProcessor, MllpServer};
use gateway_storage::BlobStorage;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// 接入网关命令行参数
#[derive(Parser, Debug)]
#[command(name = "gateway-server")]
#[command(about = "医疗数据接入网关 (HTTP / MLLP / SOAP)")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 日志格式 (text / json)
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format)?;

    info!("启动接入网关...");
    let config = GatewayConfig::load(args.config.as_deref())?;

    let storage = BlobStorage::from_config(&config.storage)?;
    let mut amqp = None;
    let queue: Arc<dyn MessageQueue> = match config.queue.provider {
        QueueProvider::Amqp => {
            let queue = Arc::new(AmqpQueue::new(config.queue_config()));
            queue.connect().await?;
            amqp = Some(queue.clone());
            queue as Arc<dyn MessageQueue>
        }
        QueueProvider::Memory => {
            warn!("Using in-memory queue, messages are not delivered downstream");
            Arc::new(InMemoryQueue::new()) as Arc<dyn MessageQueue>
        }
    };

    let processor = Arc::new(IngestionProcessor::new(
        RequestContextBuilder::new(config.context_settings()?),
        MessageGroupService::default(),
        IngestionPersistence::new(storage, queue, config.persistence_timeouts()),
    ));
    let router = IngestionRouter::new(default_handlers(processor.clone()));
    router.validate(&InputKind::ALL)?;

    info!("网关配置:");
    info!("  HTTP地址: {}", config.http_address());
    info!("  MLLP端口: {:?}", config.mllp.ports);
    info!(
        "  存储桶: {} / {}",
        config.storage.data_bucket, config.storage.metadata_bucket
    );

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let mut state = ApiState::new(processor.clone(), router.clone());
    state.local_address = config.http_address().parse().ok();
    state.max_body_bytes = config.server.max_body_bytes;
    state.read_timeout = config.read_timeout();
    let http_address = config.http_address();
    tasks.spawn(async move { ApiServer::new(state).run(&http_address).await });

    let mllp_service: Arc<dyn MllpProcessor> = Arc::new(MllpIngestService::new(processor, router));
    for server_config in config.mllp_servers() {
        let server = MllpServer::new(server_config, mllp_service.clone());
        tasks.spawn(async move { server.start().await.map_err(anyhow::Error::from) });
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("收到停止信号，正在关闭...");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => {
                warn!("Listener exited unexpectedly");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("服务器运行失败: {}", e);
                Err(e)
            }
            Err(e) => Err(e.into()),
        },
    };

    tasks.abort_all();
    if let Some(queue) = amqp {
        if let Err(e) = queue.disconnect().await {
            warn!("Failed to close queue connection: {}", e);
        }
    }
    outcome
}
