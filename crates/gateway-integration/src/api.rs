//! HTTP接入接口
//!
//! - `POST /ingest`、`POST /hold`：multipart文件上传或原始消息体
//! - `POST /ws`、`/ws/pix`、`/ws/pnr`：SOAP (PIX ITI-8 / PnR ITI-41)
//! - `GET /`、`GET /health`：健康检查

use crate::dispatch::{IngestionRouter, SourceInput, TextPayload, UploadedFile};
use crate::processor::IngestionProcessor;
use axum::{
    body::to_bytes,
    extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::Utc;
use gateway_core::{
    utils::generate_interaction_id, ContextRequest, GatewayError, MessageSourceType, Result,
};
use gateway_protocol::{
    soap::{parse_request, SOAP11_NS, SOAP12_NS},
    AckOutcome, AcknowledgementBuilder, SoapOperation, SoapRequest, SoapVersion,
};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const READ_STAGE: &str = "read";

/// API共享状态
#[derive(Clone)]
pub struct ApiState {
    pub processor: Arc<IngestionProcessor>,
    pub router: IngestionRouter,
    pub acks: AcknowledgementBuilder,
    /// HTTP监听地址，请求未携带转发头时作为目标地址
    pub local_address: Option<SocketAddr>,
    pub max_body_bytes: usize,
    /// 读取请求体（含multipart）的时限
    pub read_timeout: Duration,
}

impl ApiState {
    pub fn new(processor: Arc<IngestionProcessor>, router: IngestionRouter) -> Self {
        let acks = AcknowledgementBuilder::new(processor.ingestion_api_version());
        Self {
            processor,
            router,
            acks,
            local_address: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    fn context_request(&self, source: MessageSourceType, request: &Request) -> ContextRequest {
        let uri: &Uri = request.uri();
        let mut context_request = ContextRequest::new(source, uri.path());
        context_request.headers = header_map(request.headers());
        context_request.full_request_url = uri.to_string();
        context_request.query_params = uri.query().map(str::to_string);
        context_request.protocol = format!("{:?}", request.version());
        context_request.local_address = self.local_address;
        context_request.remote_address = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        context_request
    }
}

/// HTTP错误响应
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub interaction_id: Option<String>,
}

impl ApiError {
    pub fn new(error: GatewayError, interaction_id: Option<String>) -> Self {
        Self {
            error,
            interaction_id,
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.error {
            GatewayError::Validation(_)
            | GatewayError::Hl7(_)
            | GatewayError::Soap(_)
            | GatewayError::Framing(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout { stage } if stage == READ_STAGE => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self::new(error, None)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": true,
            "message": self.error.to_string(),
            "status": status.as_u16(),
            "interactionId": self.interaction_id,
        });
        (status, Json(body)).into_response()
    }
}

/// API处理器
pub struct ApiHandler;

impl ApiHandler {
    /// 健康检查
    pub async fn health_check(State(state): State<ApiState>) -> Json<HashMap<String, String>> {
        let mut status = HashMap::new();
        status.insert("status".to_string(), "healthy".to_string());
        status.insert("timestamp".to_string(), Utc::now().to_rfc3339());
        status.insert(
            "version".to_string(),
            state.processor.ingestion_api_version().to_string(),
        );
        Json(status)
    }

    pub async fn ingest(
        State(state): State<ApiState>,
        request: Request,
    ) -> std::result::Result<Json<HashMap<String, String>>, ApiError> {
        Self::ingest_as(state, MessageSourceType::HttpIngest, request).await
    }

    /// 暂存入口，下游不做即时处理
    pub async fn hold(
        State(state): State<ApiState>,
        request: Request,
    ) -> std::result::Result<Json<HashMap<String, String>>, ApiError> {
        Self::ingest_as(state, MessageSourceType::HttpHold, request).await
    }

    /// 按Body根元素识别PIX或PnR
    pub async fn soap(State(state): State<ApiState>, request: Request) -> Response {
        Self::soap_as(state, None, request).await
    }

    pub async fn pix(State(state): State<ApiState>, request: Request) -> Response {
        Self::soap_as(state, Some(SoapOperation::Pix), request).await
    }

    pub async fn pnr(State(state): State<ApiState>, request: Request) -> Response {
        Self::soap_as(state, Some(SoapOperation::Pnr), request).await
    }

    async fn ingest_as(
        state: ApiState,
        source: MessageSourceType,
        request: Request,
    ) -> std::result::Result<Json<HashMap<String, String>>, ApiError> {
        let mut context_request = state.context_request(source, &request);
        let (input, file_name, file_size) =
            within_read_timeout(&state, read_input(&state, request)).await?;
        context_request.file_name = file_name;
        context_request.file_size = file_size;

        let mut context = state.processor.build_context(context_request);
        info!(
            interaction_id = %context.interaction_id,
            tenant_id = %context.tenant_id,
            "Received {} upload {} ({} bytes)",
            context.message_source_type,
            context.file_name,
            context.file_size
        );

        match state.router.route(input, &mut context).await {
            Ok(result) => Ok(Json(result)),
            Err(e) => {
                error!(interaction_id = %context.interaction_id, "Ingestion failed: {}", e);
                Err(ApiError::new(e, Some(context.interaction_id)))
            }
        }
    }

    /// SOAP调用方总是收到信封：能解析请求时回复否定确认，否则回复SOAP Fault
    async fn soap_as(state: ApiState, expected: Option<SoapOperation>, request: Request) -> Response {
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut context_request = state.context_request(MessageSourceType::SoapPix, &request);

        let body = match within_read_timeout(&state, read_body(&state, request)).await {
            Ok(body) => body,
            Err(e) => return soap_fault(&state, fallback_version(&content_type, &[]), &e),
        };
        let parsed = std::str::from_utf8(&body)
            .map_err(|_| GatewayError::Soap("SOAP body is not valid UTF-8".to_string()))
            .and_then(parse_request);
        let soap = match parsed {
            Ok(soap) => soap,
            Err(e) => return soap_fault(&state, fallback_version(&content_type, &body), &e),
        };

        let detected = soap.operation();
        let Some(operation) = expected.or(detected) else {
            let interaction_id = generate_interaction_id();
            warn!(
                interaction_id = %interaction_id,
                "Unsupported SOAP body element {}",
                soap.body_root
            );
            let reason = format!("Unsupported SOAP body element {}", soap.body_root);
            return soap_reply(
                &soap,
                state.acks.soap_response(
                    &soap,
                    SoapOperation::Pix,
                    &interaction_id,
                    &AckOutcome::Rejected(reason),
                    Utc::now(),
                ),
            );
        };

        context_request.source_type = match operation {
            SoapOperation::Pix => MessageSourceType::SoapPix,
            SoapOperation::Pnr => MessageSourceType::SoapPnr,
        };
        context_request.file_name = format!("{}.xml", soap.body_root);
        context_request.file_size = body.len() as u64;
        let mut context = state.processor.build_context(context_request);

        if detected != Some(operation) {
            warn!(
                interaction_id = %context.interaction_id,
                "Expected {:?} request, received {}",
                operation,
                soap.body_root
            );
            let reason = format!("Unexpected request element {}", soap.body_root);
            return soap_reply(
                &soap,
                state.acks.soap_response(
                    &soap,
                    operation,
                    &context.interaction_id,
                    &AckOutcome::Rejected(reason),
                    Utc::now(),
                ),
            );
        }

        let ack = state.acks.soap_response(
            &soap,
            operation,
            &context.interaction_id,
            &AckOutcome::Accepted,
            context.upload_time,
        );
        match state
            .processor
            .ingest(&mut context, body, soap.version.content_type(), Some(&ack))
            .await
        {
            Ok(_) => soap_reply(&soap, ack),
            Err(e) => {
                error!(interaction_id = %context.interaction_id, "SOAP ingestion failed: {}", e);
                let nak = state.acks.soap_response(
                    &soap,
                    operation,
                    &context.interaction_id,
                    &AckOutcome::Rejected(e.to_string()),
                    Utc::now(),
                );
                if let Err(e) = state
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
                soap_reply(&soap, nak)
            }
        }
    }
}

fn soap_reply(request: &SoapRequest, envelope: String) -> Response {
    (
        [(header::CONTENT_TYPE, request.version.content_type())],
        envelope,
    )
        .into_response()
}

// SOAP 1.2的Sender故障对应400，SOAP 1.1的故障一律500
fn soap_fault(state: &ApiState, version: SoapVersion, error: &GatewayError) -> Response {
    let interaction_id = generate_interaction_id();
    warn!(interaction_id = %interaction_id, "SOAP request rejected: {}", error);
    let status = match version {
        SoapVersion::Soap11 => StatusCode::INTERNAL_SERVER_ERROR,
        SoapVersion::Soap12 => StatusCode::BAD_REQUEST,
    };
    let envelope = state
        .acks
        .soap_fault(version, &interaction_id, &error.to_string());
    (status, [(header::CONTENT_TYPE, version.content_type())], envelope).into_response()
}

/// 无法解析信封时推断回复版本：信封命名空间优先，其次Content-Type，默认SOAP 1.2
fn fallback_version(content_type: &str, body: &[u8]) -> SoapVersion {
    let body = String::from_utf8_lossy(body);
    if body.contains(SOAP11_NS) {
        SoapVersion::Soap11
    } else if body.contains(SOAP12_NS) {
        SoapVersion::Soap12
    } else if content_type.to_ascii_lowercase().starts_with("text/xml") {
        SoapVersion::Soap11
    } else {
        SoapVersion::Soap12
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn within_read_timeout<T>(
    state: &ApiState,
    read: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(state.read_timeout, read).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Request body not received within {:?}", state.read_timeout);
            Err(GatewayError::timeout(READ_STAGE))
        }
    }
}

async fn read_body(state: &ApiState, request: Request) -> Result<Bytes> {
    let body = to_bytes(request.into_body(), state.max_body_bytes)
        .await
        .map_err(|e| GatewayError::Validation(format!("Failed to read request body: {}", e)))?;
    if body.is_empty() {
        return Err(GatewayError::Validation("Request body is empty".to_string()));
    }
    Ok(body)
}

/// 读取multipart的第一个文件部分，或整个原始消息体
async fn read_input(state: &ApiState, request: Request) -> Result<(SourceInput, String, u64)> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| GatewayError::Validation(e.to_string()))?
        {
            let Some(file_name) = field.file_name().map(str::to_string) else {
                continue;
            };
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| GatewayError::Validation(e.to_string()))?;
            let size = bytes.len() as u64;
            let input = SourceInput::File(UploadedFile {
                file_name: file_name.clone(),
                content_type,
                bytes,
            });
            return Ok((input, file_name, size));
        }
        return Err(GatewayError::Validation(
            "Multipart request has no file part".to_string(),
        ));
    }

    let body = read_body(state, request).await?;
    let file_name = format!("payload-{}{}", uuid::Uuid::new_v4(), extension_for(&content_type));
    let size = body.len() as u64;
    let input = match std::str::from_utf8(&body) {
        Ok(_) => SourceInput::Text(TextPayload::from_bytes(body, content_type)),
        Err(_) => SourceInput::File(UploadedFile {
            file_name: file_name.clone(),
            content_type,
            bytes: body,
        }),
    };
    Ok((input, file_name, size))
}

fn extension_for(content_type: &str) -> &'static str {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("json") {
        ".json"
    } else if content_type.contains("hl7") {
        ".hl7"
    } else if content_type.contains("xml") {
        ".xml"
    } else if content_type.starts_with("text/") {
        ".txt"
    } else {
        ".dat"
    }
}

/// 创建API路由
pub fn create_api_routes(state: ApiState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/", get(ApiHandler::health_check))
        .route("/health", get(ApiHandler::health_check))
        .route("/ingest", post(ApiHandler::ingest))
        .route("/hold", post(ApiHandler::hold))
        .route("/ws", post(ApiHandler::soap))
        .route("/ws/pix", post(ApiHandler::pix))
        .route("/ws/pnr", post(ApiHandler::pnr))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API服务器
pub struct ApiServer {
    app: Router,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        Self {
            app: create_api_routes(state),
        }
    }

    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        info!("Starting HTTP ingestion server on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::default_handlers;
    use crate::message_queue::InMemoryQueue;
    use crate::processor::tests::memory_processor;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use futures::StreamExt;
    use gateway_storage::{BlobStorage, Bucket};
    use tower::ServiceExt;

    const PIX: &str = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://www.w3.org/2005/08/addressing">
  <soap:Header>
    <wsa:MessageID>urn:uuid:aaaa-bbbb</wsa:MessageID>
  </soap:Header>
  <soap:Body>
    <PRPA_IN201301UV02 xmlns="urn:hl7-org:v3" ITSVersion="XML_1.0">
      <id root="1.2.3.4" extension="MSG-001"/>
    </PRPA_IN201301UV02>
  </soap:Body>
</soap:Envelope>"#;

    const PNR: &str = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <xdsb:ProvideAndRegisterDocumentSetRequest xmlns:xdsb="urn:ihe:iti:xds-b:2007"/>
  </s:Body>
</s:Envelope>"#;

    fn app() -> (Router, BlobStorage, Arc<InMemoryQueue>) {
        app_with_read_timeout(DEFAULT_READ_TIMEOUT)
    }

    fn app_with_read_timeout(read_timeout: Duration) -> (Router, BlobStorage, Arc<InMemoryQueue>) {
        let (processor, storage, queue) = memory_processor();
        let processor = Arc::new(processor);
        let router = IngestionRouter::new(default_handlers(processor.clone()));
        let mut state = ApiState::new(processor, router);
        state.read_timeout = read_timeout;
        (create_api_routes(state), storage, queue)
    }

    /// 发送一段数据后不再发送，也不结束
    fn stalled_body(first_chunk: &'static [u8]) -> Body {
        let chunks = futures::stream::once(async move {
            Ok::<_, std::io::Error>(Bytes::from_static(first_chunk))
        })
        .chain(futures::stream::pending());
        Body::from_stream(chunks)
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post(uri: &str, content_type: &str, body: &'static str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _, _) = app();
        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let (app, storage, queue) = app();
        let body = "--XBOUNDARY\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"lab.json\"\r\n\
Content-Type: application/json\r\n\
\r\n\
{\"a\":1}\r\n\
--XBOUNDARY--\r\n";
        let mut request = post("/ingest?q=1", "multipart/form-data; boundary=XBOUNDARY", body);
        request
            .headers_mut()
            .insert("x-tenant-id", "acme".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "Success");
        assert_eq!(json["messageGroupId"], "acme");

        let messages = queue.group("acme");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].file_name, "lab.json");
        let key = messages[0]
            .s3_data_object_path
            .trim_start_matches("s3://ingestion-data/");
        let stored = storage.get(Bucket::Data, key).await.unwrap();
        assert_eq!(&stored[..], b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_raw_body_gets_generated_file_name() {
        let (app, _, queue) = app();
        let response = app
            .oneshot(post("/ingest", "application/json", "{\"b\":2}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let messages = queue.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].file_name.starts_with("payload-"));
        assert!(messages[0].file_name.ends_with(".json"));
        assert_eq!(messages[0].source_type, "HTTP_INGEST");
    }

    #[tokio::test]
    async fn test_hold_route() {
        let (app, _, queue) = app();
        let response = app
            .oneshot(post("/hold", "text/plain", "held payload"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.messages()[0].source_type, "HTTP_HOLD");
    }

    #[tokio::test]
    async fn test_empty_body_is_bad_request() {
        let (app, _, queue) = app();
        let response = app.oneshot(post("/ingest", "text/plain", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], true);
        assert_eq!(json["status"], 400);
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_pix_request_returns_mcci() {
        let (app, _, queue) = app();
        let response = app
            .oneshot(post("/ws/pix", "application/soap+xml", PIX))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/soap+xml; charset=utf-8"
        );
        let body = body_string(response).await;
        assert!(body.contains("MCCI_IN000002UV01"));
        assert!(body.contains("<typeCode code=\"CA\"/>"));
        assert!(body.contains("<wsa:RelatesTo>urn:uuid:aaaa-bbbb</wsa:RelatesTo>"));

        let messages = queue.messages();
        assert_eq!(messages[0].source_type, "SOAP_PIX");
        assert!(messages[0].full_s3_acknowledgement_path.is_some());
    }

    #[tokio::test]
    async fn test_pnr_detected_on_generic_endpoint() {
        let (app, _, _) = app();
        let response = app
            .oneshot(post("/ws", "text/xml", PNR))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("ResponseStatusType:Success"));
    }

    #[tokio::test]
    async fn test_wrong_operation_gets_negative_ack() {
        let (app, _, queue) = app();
        let response = app
            .oneshot(post("/ws/pnr", "text/xml", PIX))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("ResponseStatusType:Failure"));
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_upload_times_out() {
        let (app, _, queue) = app_with_read_timeout(Duration::from_millis(50));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/ingest")
            .header("content-type", "application/json")
            .body(stalled_body(b"{\"partial\":"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], true);
        assert_eq!(json["status"], 408);
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_soap_request_gets_fault() {
        let (app, _, queue) = app_with_read_timeout(Duration::from_millis(50));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/ws")
            .header("content-type", "application/soap+xml")
            .body(stalled_body(b"<soap:Envelope"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/soap+xml; charset=utf-8"
        );
        let body = body_string(response).await;
        assert!(body.contains("<soap:Value>soap:Sender</soap:Value>"));
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_soap_body_gets_negative_ack() {
        let (app, _, queue) = app();
        let ping = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" xmlns:wsa="http://www.w3.org/2005/08/addressing">
  <s:Header><wsa:MessageID>urn:uuid:ping-1</wsa:MessageID></s:Header>
  <s:Body><Ping/></s:Body>
</s:Envelope>"#;
        let response = app.oneshot(post("/ws", "text/xml", ping)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/xml; charset=utf-8"
        );
        let body = body_string(response).await;
        assert!(body.starts_with("<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\""));
        assert!(body.contains("<typeCode code=\"CE\"/>"));
        assert!(body.contains("Unsupported SOAP body element Ping"));
        assert!(body.contains("<wsa:RelatesTo>urn:uuid:ping-1</wsa:RelatesTo>"));
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_soap_gets_fault_in_request_version() {
        let (app, _, queue) = app();
        let broken = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body></s:Envelope>"#;
        let response = app
            .oneshot(post("/ws/pix", "application/soap+xml", broken))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/xml; charset=utf-8"
        );
        let body = body_string(response).await;
        assert!(body.contains("<faultcode>soap:Client</faultcode>"));
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_soap_gets_fault() {
        let (app, _, _) = app();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/ws")
            .header("content-type", "application/soap+xml")
            .body(Body::from(vec![0x3c, 0xff, 0xfe, 0x3e]))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.starts_with("<soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope\""));
        assert!(body.contains("SOAP body is not valid UTF-8"));
    }
}
