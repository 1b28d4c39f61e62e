//! 来源处理器分发
//!
//! 处理器按声明的优先级依次询问 `can_handle`，第一个匹配的处理器负责处理。
//! 没有处理器匹配属于部署缺陷，启动时通过 [`IngestionRouter::validate`] 发现。

use async_trait::async_trait;
use bytes::Bytes;
use gateway_core::{GatewayError, RequestContext, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 上传的文件
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// 文本消息体（HL7v2或其它原始文本）
///
/// `raw` 是线上收到的原始字节，持久化、大小和摘要都基于它；
/// `body` 只是用于识别和解析的文本视图，非UTF-8字节会被替换。
#[derive(Debug, Clone)]
pub struct TextPayload {
    pub body: String,
    pub raw: Bytes,
    pub content_type: String,
    /// 预先构建好的确认消息，会作为第三个对象持久化
    pub acknowledgement: Option<String>,
}

impl TextPayload {
    pub fn from_bytes(raw: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            body: String::from_utf8_lossy(&raw).into_owned(),
            raw,
            content_type: content_type.into(),
            acknowledgement: None,
        }
    }

    pub fn with_acknowledgement(mut self, acknowledgement: impl Into<String>) -> Self {
        self.acknowledgement = Some(acknowledgement.into());
        self
    }
}

/// 处理器的原始输入
#[derive(Debug, Clone)]
pub enum SourceInput {
    File(UploadedFile),
    Text(TextPayload),
}

impl SourceInput {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceInput::File(_) => "file",
            SourceInput::Text(_) => "text",
        }
    }
}

/// 各传输入口会产生的输入形态，启动校验使用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    MultipartFile,
    Hl7Text,
    RawText,
}

impl InputKind {
    pub const ALL: [InputKind; 3] = [InputKind::MultipartFile, InputKind::Hl7Text, InputKind::RawText];

    /// 该形态的代表性输入
    pub fn sample(&self) -> SourceInput {
        match self {
            InputKind::MultipartFile => SourceInput::File(UploadedFile {
                file_name: "sample.json".to_string(),
                content_type: "application/json".to_string(),
                bytes: Bytes::from_static(b"{}"),
            }),
            InputKind::Hl7Text => SourceInput::Text(TextPayload::from_bytes(
                Bytes::from_static(b"MSH|^~\\&|SAMPLE"),
                "application/hl7-v2",
            )),
            InputKind::RawText => SourceInput::Text(TextPayload::from_bytes(
                Bytes::from_static(b"sample"),
                "text/plain",
            )),
        }
    }
}

/// 来源处理器接口
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// 获取处理器名称
    fn name(&self) -> &str;

    /// 是否能处理该输入
    fn can_handle(&self, input: &SourceInput) -> bool;

    /// 处理输入，返回结果摘要
    async fn handle(
        &self,
        input: SourceInput,
        context: &mut RequestContext,
    ) -> Result<HashMap<String, String>>;
}

/// 入站路由器，处理器列表启动后不可变
#[derive(Clone)]
pub struct IngestionRouter {
    handlers: Arc<Vec<Arc<dyn SourceHandler>>>,
}

impl IngestionRouter {
    pub fn new(handlers: Vec<Arc<dyn SourceHandler>>) -> Self {
        info!(
            "Registered source handlers: {:?}",
            handlers.iter().map(|h| h.name()).collect::<Vec<_>>()
        );
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// 第一个能处理该输入的处理器
    pub fn find_handler(&self, input: &SourceInput) -> Option<&Arc<dyn SourceHandler>> {
        self.handlers.iter().find(|h| h.can_handle(input))
    }

    /// 分发到匹配的处理器
    pub async fn route(
        &self,
        input: SourceInput,
        context: &mut RequestContext,
    ) -> Result<HashMap<String, String>> {
        let handler = self.find_handler(&input).ok_or_else(|| {
            error!(
                interaction_id = %context.interaction_id,
                "No handler registered for {} input",
                input.kind()
            );
            GatewayError::Dispatch(format!("No handler registered for {} input", input.kind()))
        })?;
        debug!(
            interaction_id = %context.interaction_id,
            "Dispatching {} input to {}",
            input.kind(),
            handler.name()
        );
        handler.handle(input, context).await
    }

    /// 启动校验：每种输入形态都必须有处理器
    pub fn validate(&self, kinds: &[InputKind]) -> Result<()> {
        for kind in kinds {
            match self.find_handler(&kind.sample()) {
                Some(handler) => debug!("{:?} input handled by {}", kind, handler.name()),
                None => {
                    return Err(GatewayError::Dispatch(format!(
                        "No source handler registered for {:?}",
                        kind
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{ContextRequest, ContextSettings, MessageSourceType, RequestContextBuilder};

    struct NamedHandler {
        name: &'static str,
        accepts_text: bool,
    }

    #[async_trait]
    impl SourceHandler for NamedHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, input: &SourceInput) -> bool {
            matches!(input, SourceInput::Text(_)) == self.accepts_text
        }

        async fn handle(
            &self,
            _input: SourceInput,
            _context: &mut RequestContext,
        ) -> Result<HashMap<String, String>> {
            let mut result = HashMap::new();
            result.insert("handler".to_string(), self.name.to_string());
            Ok(result)
        }
    }

    fn context() -> RequestContext {
        RequestContextBuilder::new(ContextSettings::default())
            .build(ContextRequest::new(MessageSourceType::HttpIngest, "/ingest"))
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let router = IngestionRouter::new(vec![
            Arc::new(NamedHandler { name: "first", accepts_text: true }),
            Arc::new(NamedHandler { name: "second", accepts_text: true }),
            Arc::new(NamedHandler { name: "files", accepts_text: false }),
        ]);
        let mut ctx = context();

        let result = router
            .route(InputKind::RawText.sample(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result["handler"], "first");

        let result = router
            .route(InputKind::MultipartFile.sample(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result["handler"], "files");
    }

    #[tokio::test]
    async fn test_no_handler_is_dispatch_error() {
        let router = IngestionRouter::new(vec![Arc::new(NamedHandler {
            name: "text-only",
            accepts_text: true,
        })]);
        let mut ctx = context();
        assert!(matches!(
            router.route(InputKind::MultipartFile.sample(), &mut ctx).await,
            Err(GatewayError::Dispatch(_))
        ));
    }

    #[test]
    fn test_validate_reports_missing_kind() {
        let router = IngestionRouter::new(vec![Arc::new(NamedHandler {
            name: "text-only",
            accepts_text: true,
        })]);
        assert!(router.validate(&[InputKind::Hl7Text, InputKind::RawText]).is_ok());
        assert!(matches!(
            router.validate(&InputKind::ALL),
            Err(GatewayError::Dispatch(_))
        ));
    }
}
