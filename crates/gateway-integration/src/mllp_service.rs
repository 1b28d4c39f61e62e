//! MLLP事务处理
//!
//! 每个帧独立成一个事务：解析MSH → 构建上下文 → 预先生成ACK → 分发持久化。
//! 成功时回写ACK；任何应用层失败都回写NAK，连接保持。

use crate::dispatch::{IngestionRouter, SourceInput, TextPayload};
use crate::processor::IngestionProcessor;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use gateway_core::{utils::generate_interaction_id, ContextRequest, MessageSourceType};
use gateway_protocol::{
    AckOutcome, AcknowledgementBuilder, ConnectionInfo, Hl7Message, Inbound, MllpProcessor,
    MshHeader,
};
use std::sync::Arc;
use tracing::{error, info, warn};

const HL7_CONTENT_TYPE: &str = "text/plain";

/// 将MLLP帧接入处理流水线
pub struct MllpIngestService {
    processor: Arc<IngestionProcessor>,
    router: IngestionRouter,
    acks: AcknowledgementBuilder,
}

impl MllpIngestService {
    pub fn new(processor: Arc<IngestionProcessor>, router: IngestionRouter) -> Self {
        let acks = AcknowledgementBuilder::new(processor.ingestion_api_version());
        Self {
            processor,
            router,
            acks,
        }
    }

    async fn handle_frame(&self, frame: Bytes, connection: &ConnectionInfo) -> String {
        let payload = TextPayload::from_bytes(frame, HL7_CONTENT_TYPE);

        let message = match Hl7Message::parse(&payload.body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejected frame on port {}: {}", connection.listener_port, e);
                return self.nak(&MshHeader::default(), &generate_interaction_id(), &e.to_string());
            }
        };
        let msh = message.msh();

        let mut request = ContextRequest::new(MessageSourceType::Mllp, "/mllp");
        request.full_request_url = match connection.local_address {
            Some(addr) => format!("mllp://{}", addr),
            None => format!("mllp://0.0.0.0:{}", connection.listener_port),
        };
        request.protocol = "MLLP".to_string();
        request.file_name = format!("{}.hl7", msh.control_id_or_unknown());
        request.file_size = payload.raw.len() as u64;
        request.user_agent = Some(msh.user_agent());
        request.local_address = connection.local_address;
        request.remote_address = connection.remote_address;
        request.proxy = connection.proxy.clone();
        let mut context = self.processor.build_context(request);

        let ack = self.acks.hl7v2(
            &msh,
            &context.interaction_id,
            &AckOutcome::Accepted,
            context.upload_time,
        );
        let input = SourceInput::Text(payload.with_acknowledgement(ack.clone()));

        match self.router.route(input, &mut context).await {
            Ok(result) => {
                info!(
                    interaction_id = %context.interaction_id,
                    port = connection.listener_port,
                    "ACK for control id {} (group {})",
                    msh.control_id_or_unknown(),
                    result.get("messageGroupId").map(String::as_str).unwrap_or_default()
                );
                ack
            }
            Err(e) => {
                error!(
                    interaction_id = %context.interaction_id,
                    port = connection.listener_port,
                    "MLLP transaction failed: {}",
                    e
                );
                let nak = self.nak(&msh, &context.interaction_id, &e.to_string());
                if let Err(e) = self
                    .processor
                    .persistence()
                    .replace_acknowledgement(&context, &nak)
                    .await
                {
                    warn!(
                        interaction_id = %context.interaction_id,
                        "Stored acknowledgement no longer matches the reply: {}",
                        e
                    );
                }
                nak
            }
        }
    }

    fn nak(&self, msh: &MshHeader, interaction_id: &str, reason: &str) -> String {
        self.acks.hl7v2(
            msh,
            interaction_id,
            &AckOutcome::Rejected(reason.to_string()),
            Utc::now(),
        )
    }
}

#[async_trait]
impl MllpProcessor for MllpIngestService {
    async fn process(&self, inbound: Inbound, connection: &ConnectionInfo) -> Option<String> {
        match inbound {
            Inbound::Frame(frame) => Some(self.handle_frame(frame, connection).await),
            Inbound::ReadTimeout { partial_bytes } => {
                warn!(
                    port = connection.listener_port,
                    "Read timeout with {} buffered bytes",
                    partial_bytes
                );
                Some(self.nak(
                    &MshHeader::default(),
                    &generate_interaction_id(),
                    "Timed out reading message",
                ))
            }
        }
    }
}
