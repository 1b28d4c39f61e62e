//! 来源处理器实现
//!
//! 注册顺序即优先级：文件上传 → HL7v2文本 → 其它原始文本。
//! SOAP请求在传输层已按绑定区分，不经过这里。

use crate::dispatch::{SourceHandler, SourceInput};
use crate::processor::IngestionProcessor;
use async_trait::async_trait;
use gateway_core::{RequestContext, Result};
use gateway_protocol::Hl7Message;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const MSH_MARKER: &str = "MSH";

/// 默认的处理器列表
pub fn default_handlers(processor: Arc<IngestionProcessor>) -> Vec<Arc<dyn SourceHandler>> {
    vec![
        Arc::new(MultipartFileHandler::new(processor.clone())),
        Arc::new(MllpHandler::new(processor.clone())),
        Arc::new(RawTextHandler::new(processor)),
    ]
}

/// 文件上传
pub struct MultipartFileHandler {
    processor: Arc<IngestionProcessor>,
}

impl MultipartFileHandler {
    pub fn new(processor: Arc<IngestionProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl SourceHandler for MultipartFileHandler {
    fn name(&self) -> &str {
        "multipart-file"
    }

    fn can_handle(&self, input: &SourceInput) -> bool {
        matches!(input, SourceInput::File(_))
    }

    async fn handle(
        &self,
        input: SourceInput,
        context: &mut RequestContext,
    ) -> Result<HashMap<String, String>> {
        let file = match input {
            SourceInput::File(file) => file,
            other => return Err(unexpected(self.name(), &other)),
        };
        self.processor
            .ingest(context, file.bytes, &file.content_type, None)
            .await
    }
}

/// HL7v2消息（以MSH段开头的文本）
///
/// ZNT段存在时，把分组字段写入来源特定参数；已由传输层写入的参数不覆盖。
pub struct MllpHandler {
    processor: Arc<IngestionProcessor>,
}

impl MllpHandler {
    pub fn new(processor: Arc<IngestionProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl SourceHandler for MllpHandler {
    fn name(&self) -> &str {
        "mllp"
    }

    fn can_handle(&self, input: &SourceInput) -> bool {
        match input {
            SourceInput::Text(text) => text.body.trim_start().starts_with(MSH_MARKER),
            SourceInput::File(_) => false,
        }
    }

    async fn handle(
        &self,
        input: SourceInput,
        context: &mut RequestContext,
    ) -> Result<HashMap<String, String>> {
        let text = match input {
            SourceInput::Text(text) => text,
            other => return Err(unexpected(self.name(), &other)),
        };

        let message = Hl7Message::parse(&text.body)?;
        if let Some(znt) = message.znt() {
            for (name, value) in znt.into_parameters() {
                context.additional_parameters.entry(name).or_insert(value);
            }
        }
        debug!(
            interaction_id = %context.interaction_id,
            "HL7 message with {} segments, control id {}",
            message.segment_count(),
            message.msh().control_id_or_unknown()
        );

        self.processor
            .ingest(
                context,
                text.raw,
                &text.content_type,
                text.acknowledgement.as_deref(),
            )
            .await
    }
}

/// 其它原始文本（JSON、XML、CSV等）
pub struct RawTextHandler {
    processor: Arc<IngestionProcessor>,
}

impl RawTextHandler {
    pub fn new(processor: Arc<IngestionProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl SourceHandler for RawTextHandler {
    fn name(&self) -> &str {
        "raw-text"
    }

    fn can_handle(&self, input: &SourceInput) -> bool {
        matches!(input, SourceInput::Text(_))
    }

    async fn handle(
        &self,
        input: SourceInput,
        context: &mut RequestContext,
    ) -> Result<HashMap<String, String>> {
        let text = match input {
            SourceInput::Text(text) => text,
            other => return Err(unexpected(self.name(), &other)),
        };
        self.processor
            .ingest(
                context,
                text.raw,
                &text.content_type,
                text.acknowledgement.as_deref(),
            )
            .await
    }
}

fn unexpected(handler: &str, input: &SourceInput) -> gateway_core::GatewayError {
    gateway_core::GatewayError::Dispatch(format!(
        "Handler {} cannot process {} input",
        handler,
        input.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{InputKind, IngestionRouter, TextPayload, UploadedFile};
    use crate::processor::tests::memory_processor;
    use bytes::Bytes;
    use gateway_core::{ContextRequest, MessageSourceType, GatewayError};
    use gateway_storage::Bucket;

    const ADT: &str = "MSH|^~\\&|SendingApp|SendingFacility|ReceivingApp|ReceivingFacility|202507171330||ADT^A01|123456|P|2.5\rEVN|A01|202507171330\rZNT||ADT^A01|A01|R^Routine||||NYEC:F1\r";

    fn text(body: &str) -> SourceInput {
        SourceInput::Text(TextPayload::from_bytes(Bytes::from(body.to_string()), "text/plain"))
    }

    #[test]
    fn test_handler_selection() {
        let (processor, _, _) = memory_processor();
        let router = IngestionRouter::new(default_handlers(Arc::new(processor)));

        assert_eq!(router.find_handler(&text(ADT)).unwrap().name(), "mllp");
        assert_eq!(router.find_handler(&text("  MSH|^~\\&|A")).unwrap().name(), "mllp");
        assert_eq!(router.find_handler(&text("{\"a\":1}")).unwrap().name(), "raw-text");
        let file = SourceInput::File(UploadedFile {
            file_name: "MSH.txt".to_string(),
            content_type: "text/plain".to_string(),
            bytes: Bytes::from_static(b"MSH|"),
        });
        assert_eq!(router.find_handler(&file).unwrap().name(), "multipart-file");
        assert!(router.validate(&InputKind::ALL).is_ok());
    }

    #[tokio::test]
    async fn test_mllp_handler_extracts_znt_group() {
        let (processor, _storage, queue) = memory_processor();
        let processor = Arc::new(processor);
        let router = IngestionRouter::new(default_handlers(processor.clone()));
        let mut context = processor.build_context(ContextRequest::new(MessageSourceType::Mllp, "/mllp"));

        let input = SourceInput::Text(
            TextPayload::from_bytes(Bytes::from_static(ADT.as_bytes()), "text/plain")
                .with_acknowledgement("MSA|AA|123456"),
        );
        let result = router.route(input, &mut context).await.unwrap();

        assert_eq!(result["messageGroupId"], "NYEC_F1_ADT_R");
        assert_eq!(context.parameter("QE"), Some("NYEC"));
        assert!(result.contains_key("fullS3AcknowledgementPath"));
        assert_eq!(queue.group("NYEC_F1_ADT_R").len(), 1);
    }

    #[tokio::test]
    async fn test_mllp_handler_keeps_transport_parameters() {
        let (processor, _, _) = memory_processor();
        let handler = MllpHandler::new(Arc::new(processor.clone()));
        let mut request = ContextRequest::new(MessageSourceType::Mllp, "/mllp");
        request
            .additional_parameters
            .insert("QE".to_string(), "HEALTHIX".to_string());
        let mut context = processor.build_context(request);

        let result = handler.handle(text(ADT), &mut context).await.unwrap();
        assert_eq!(result["messageGroupId"], "HEALTHIX_F1_ADT_R");
    }

    #[tokio::test]
    async fn test_file_handler_rejects_text() {
        let (processor, _, _) = memory_processor();
        let handler = MultipartFileHandler::new(Arc::new(processor.clone()));
        let mut context = processor.build_context(ContextRequest::new(MessageSourceType::HttpIngest, "/ingest"));
        assert!(matches!(
            handler.handle(text("x"), &mut context).await,
            Err(GatewayError::Dispatch(_))
        ));
    }

    #[tokio::test]
    async fn test_raw_text_handler_stores_original_bytes() {
        let (processor, storage, queue) = memory_processor();
        let handler = RawTextHandler::new(Arc::new(processor.clone()));
        let mut context = processor.build_context(ContextRequest::new(MessageSourceType::HttpIngest, "/ingest"));
        let raw = Bytes::from_static(b"name=Ren\xE9e\n");

        handler
            .handle(SourceInput::Text(TextPayload::from_bytes(raw.clone(), "text/plain")), &mut context)
            .await
            .unwrap();

        let stored = storage.get(Bucket::Data, &context.keys.data_key).await.unwrap();
        assert_eq!(stored, raw);
        assert_eq!(queue.messages().len(), 1);
    }
}
