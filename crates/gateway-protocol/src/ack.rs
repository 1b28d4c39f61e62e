//! 确认消息构建
//!
//! 三种互不兼容的确认格式：
//! - HL7v2 ACK / NAK (MLLP)
//! - HL7v3 MCCI_IN000002UV01 (PIX, ITI-8)
//! - ebXML RegistryResponse (PnR, ITI-41)
//!
//! 请求连信封都无法解析时回复SOAP Fault。
//! 构建过程从不失败：上游出错时仍然返回格式正确的否定确认。

use crate::hl7::MshHeader;
use crate::soap::{InstanceId, SoapOperation, SoapRequest, SoapVersion, HL7V3_NS, WSA_NS};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::warn;
use uuid::Uuid;

pub const MCCI_INTERACTION_OID: &str = "2.16.840.1.113883.1.6";
pub const MCCI_INTERACTION: &str = "MCCI_IN000002UV01";
pub const PIX_RESPONSE_ACTION: &str = "urn:hl7-org:v3:MCCI_IN000002UV01";
pub const PNR_RESPONSE_ACTION: &str = "urn:ihe:iti:2007:ProvideAndRegisterDocumentSet-bResponse";
pub const SOAP_FAULT_ACTION: &str = "http://www.w3.org/2005/08/addressing/soap/fault";
pub const REGISTRY_RS_NS: &str = "urn:oasis:names:tc:ebxml-regrep:xsd:rs:3.0";
pub const REGISTRY_SUCCESS: &str = "urn:oasis:names:tc:ebxml-regrep:ResponseStatusType:Success";
pub const REGISTRY_FAILURE: &str = "urn:oasis:names:tc:ebxml-regrep:ResponseStatusType:Failure";
pub const INTERACTION_ID_NS: &str = "urn:techbd:custom";
const WSA_ANONYMOUS: &str = "http://www.w3.org/2005/08/addressing/anonymous";

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Rejected(String),
}

impl AckOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AckOutcome::Accepted)
    }
}

/// 确认消息构建器
#[derive(Debug, Clone)]
pub struct AcknowledgementBuilder {
    ingestion_api_version: String,
}

impl AcknowledgementBuilder {
    pub fn new(ingestion_api_version: impl Into<String>) -> Self {
        Self {
            ingestion_api_version: ingestion_api_version.into(),
        }
    }

    /// HL7v2 ACK/NAK，收发方互换
    pub fn hl7v2(
        &self,
        msh: &MshHeader,
        interaction_id: &str,
        outcome: &AckOutcome,
        now: DateTime<Utc>,
    ) -> String {
        let control_id = msh.control_id_or_unknown();
        let header = format!(
            "MSH|^~\\&|{}|{}|{}|{}|{}||ACK^R01|{}|P|2.3\r",
            msh.receiving_application_or_unknown(),
            msh.receiving_facility_or_unknown(),
            msh.sending_application_or_unknown(),
            msh.sending_facility_or_unknown(),
            now.format("%Y%m%d%H%M%S"),
            control_id
        );
        match outcome {
            AckOutcome::Accepted => format!(
                "{}MSA|AA|{}\rNTE|1||InteractionID: {} | IngestionApiVersion: {}\r",
                header, control_id, interaction_id, self.ingestion_api_version
            ),
            AckOutcome::Rejected(reason) => format!(
                "{}MSA|AE|{}\rNTE|1||{}\r",
                header,
                control_id,
                sanitize_hl7_text(reason)
            ),
        }
    }

    /// HL7v3 MCCI_IN000002UV01 确认（不含SOAP信封）
    pub fn mcci(&self, request: &SoapRequest, outcome: &AckOutcome, now: DateTime<Utc>) -> String {
        let mut xml = XmlBuffer::new();
        write_mcci(&mut xml, request, outcome, now);
        xml.into_string()
    }

    /// ebXML RegistryResponse
    pub fn registry_response(&self, outcome: &AckOutcome) -> String {
        let mut xml = XmlBuffer::new();
        write_registry_response(&mut xml, outcome);
        xml.into_string()
    }

    /// 按事务类型构建完整的SOAP响应
    pub fn soap_response(
        &self,
        request: &SoapRequest,
        operation: SoapOperation,
        interaction_id: &str,
        outcome: &AckOutcome,
        now: DateTime<Utc>,
    ) -> String {
        let action = match operation {
            SoapOperation::Pix => PIX_RESPONSE_ACTION,
            SoapOperation::Pnr => PNR_RESPONSE_ACTION,
        };
        let mut xml = XmlBuffer::new();
        write_envelope(
            &mut xml,
            request.version,
            action,
            request.message_id.as_deref(),
            interaction_id,
            |xml| match operation {
                SoapOperation::Pix => write_mcci(xml, request, outcome, now),
                SoapOperation::Pnr => write_registry_response(xml, outcome),
            },
        );
        xml.into_string()
    }

    /// 请求无法解析为信封时的SOAP Fault，错误归于调用方
    pub fn soap_fault(&self, version: SoapVersion, interaction_id: &str, reason: &str) -> String {
        let mut xml = XmlBuffer::new();
        write_envelope(&mut xml, version, SOAP_FAULT_ACTION, None, interaction_id, |xml| {
            xml.start("soap:Fault", &[]);
            match version {
                SoapVersion::Soap12 => {
                    xml.start("soap:Code", &[]);
                    xml.text_element("soap:Value", &[], "soap:Sender");
                    xml.end("soap:Code");
                    xml.start("soap:Reason", &[]);
                    xml.text_element("soap:Text", &[("xml:lang", "en")], reason);
                    xml.end("soap:Reason");
                }
                SoapVersion::Soap11 => {
                    xml.text_element("faultcode", &[], "soap:Client");
                    xml.text_element("faultstring", &[], reason);
                }
            }
            xml.end("soap:Fault");
        });
        xml.into_string()
    }
}

/// 内存中的XML写入器，元素名和属性值由quick-xml转义
struct XmlBuffer {
    writer: Writer<Vec<u8>>,
}

impl XmlBuffer {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::with_capacity(1024)),
        }
    }

    fn write(&mut self, event: Event<'_>) {
        // 目标是内存缓冲区，不会出现IO错误
        if let Err(e) = self.writer.write_event(event) {
            warn!("Failed to write acknowledgement XML: {}", e);
        }
    }

    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) {
        let element = BytesStart::new(name).with_attributes(attributes.iter().copied());
        self.write(Event::Start(element));
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) {
        let element = BytesStart::new(name).with_attributes(attributes.iter().copied());
        self.write(Event::Empty(element));
    }

    fn end(&mut self, name: &str) {
        self.write(Event::End(BytesEnd::new(name)));
    }

    fn text_element(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) {
        self.start(name, attributes);
        self.write(Event::Text(BytesText::new(text)));
        self.end(name);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner()).into_owned()
    }
}

/// 用WS-Addressing头包装SOAP响应
fn write_envelope(
    xml: &mut XmlBuffer,
    version: SoapVersion,
    action: &str,
    relates_to: Option<&str>,
    interaction_id: &str,
    body: impl FnOnce(&mut XmlBuffer),
) {
    xml.start(
        "soap:Envelope",
        &[("xmlns:soap", version.namespace()), ("xmlns:wsa", WSA_NS)],
    );
    xml.start("soap:Header", &[]);
    xml.text_element("wsa:Action", &[], action);
    xml.text_element("wsa:MessageID", &[], &format!("urn:uuid:{}", Uuid::new_v4()));
    if let Some(relates_to) = relates_to {
        xml.text_element("wsa:RelatesTo", &[], relates_to);
    }
    xml.text_element("wsa:To", &[], WSA_ANONYMOUS);
    xml.text_element(
        "techbd:InteractionID",
        &[("xmlns:techbd", INTERACTION_ID_NS)],
        interaction_id,
    );
    xml.end("soap:Header");
    xml.start("soap:Body", &[]);
    body(xml);
    xml.end("soap:Body");
    xml.end("soap:Envelope");
}

fn write_mcci(xml: &mut XmlBuffer, request: &SoapRequest, outcome: &AckOutcome, now: DateTime<Utc>) {
    let message_id = Uuid::new_v4().to_string();
    let creation_time = now.format("%Y%m%d%H%M%S").to_string();

    xml.start(
        MCCI_INTERACTION,
        &[("xmlns", HL7V3_NS), ("ITSVersion", "XML_1.0")],
    );
    xml.empty("id", &[("root", message_id.as_str())]);
    xml.empty("creationTime", &[("value", creation_time.as_str())]);
    xml.empty(
        "interactionId",
        &[("root", MCCI_INTERACTION_OID), ("extension", MCCI_INTERACTION)],
    );
    xml.empty("processingCode", &[("code", "P")]);
    xml.empty("processingModeCode", &[("code", "T")]);
    xml.empty("acceptAckCode", &[("code", "NE")]);
    // 响应的接收方是原请求的发送方
    write_device(xml, "receiver", "RCV", &request.sender_ids);
    write_device(xml, "sender", "SND", &request.receiver_ids);

    let type_code = if outcome.is_accepted() { "CA" } else { "CE" };
    xml.start("acknowledgement", &[]);
    xml.empty("typeCode", &[("code", type_code)]);
    xml.start("targetMessage", &[]);
    match &request.hl7_message_id {
        Some(id) => write_instance_id(xml, id),
        None => xml.empty("id", &[("nullFlavor", "UNK")]),
    }
    xml.end("targetMessage");
    if let AckOutcome::Rejected(reason) = outcome {
        xml.start("acknowledgementDetail", &[("typeCode", "E")]);
        xml.text_element("text", &[], reason);
        xml.end("acknowledgementDetail");
    }
    xml.end("acknowledgement");
    xml.end(MCCI_INTERACTION);
}

fn write_registry_response(xml: &mut XmlBuffer, outcome: &AckOutcome) {
    let status = if outcome.is_accepted() {
        REGISTRY_SUCCESS
    } else {
        REGISTRY_FAILURE
    };
    xml.empty(
        "rs:RegistryResponse",
        &[("xmlns:rs", REGISTRY_RS_NS), ("status", status)],
    );
}

fn write_device(xml: &mut XmlBuffer, element: &str, type_code: &str, ids: &[InstanceId]) {
    xml.start(element, &[("typeCode", type_code)]);
    xml.start(
        "device",
        &[("classCode", "DEV"), ("determinerCode", "INSTANCE")],
    );
    if ids.is_empty() {
        xml.empty("id", &[("nullFlavor", "UNK")]);
    }
    for id in ids {
        write_instance_id(xml, id);
    }
    xml.end("device");
    xml.end(element);
}

fn write_instance_id(xml: &mut XmlBuffer, id: &InstanceId) {
    let mut attributes = Vec::with_capacity(2);
    if let Some(root) = &id.root {
        attributes.push(("root", root.as_str()));
    }
    if let Some(extension) = &id.extension {
        attributes.push(("extension", extension.as_str()));
    }
    xml.empty("id", &attributes);
}

// 原因文本不能破坏段结构
fn sanitize_hl7_text(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\r' | '\n' | '|' => ' ',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hl7::Hl7Message;
    use crate::soap::parse_request;
    use crate::soap::tests::{PIX_REQUEST, PNR_REQUEST};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 17, 13, 30, 5).unwrap()
    }

    const ADT: &str = "MSH|^~\\&|SendingApp|SendingFacility|ReceivingApp|ReceivingFacility|202507171330||ADT^A01|123456|P|2.5\rPID|1||42\r";

    #[test]
    fn test_hl7v2_ack_swaps_sender_and_receiver() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        let msh = Hl7Message::parse(ADT).unwrap().msh();
        let ack = builder.hl7v2(&msh, "iid-1", &AckOutcome::Accepted, now());

        assert!(ack.starts_with(
            "MSH|^~\\&|ReceivingApp|ReceivingFacility|SendingApp|SendingFacility|20250717133005||ACK^R01|123456|P|2.3\r"
        ));
        assert!(ack.contains("MSA|AA|123456\r"));
        assert!(ack.contains("NTE|1||InteractionID: iid-1 | IngestionApiVersion: 1.0.0"));
    }

    #[test]
    fn test_hl7v2_nak() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        let msh = Hl7Message::parse(ADT).unwrap().msh();
        let nak = builder.hl7v2(
            &msh,
            "iid-1",
            &AckOutcome::Rejected("queue|down\r".to_string()),
            now(),
        );
        assert!(nak.contains("MSA|AE|123456\r"));
        assert!(nak.contains("NTE|1||queue down \r"));
    }

    #[test]
    fn test_hl7v2_ack_with_empty_msh() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        let ack = builder.hl7v2(&MshHeader::default(), "iid", &AckOutcome::Accepted, now());
        assert!(ack.starts_with("MSH|^~\\&|UNKNOWN|UNKNOWN|UNKNOWN|UNKNOWN|"));
        assert!(ack.contains("MSA|AA|UNKNOWN"));
    }

    #[test]
    fn test_mcci_success() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        let request = parse_request(PIX_REQUEST).unwrap();
        let xml = builder.mcci(&request, &AckOutcome::Accepted, now());

        assert!(xml.starts_with("<MCCI_IN000002UV01 xmlns=\"urn:hl7-org:v3\""));
        assert!(xml.contains(
            "<interactionId root=\"2.16.840.1.113883.1.6\" extension=\"MCCI_IN000002UV01\"/>"
        ));
        assert!(xml.contains("<creationTime value=\"20250717133005\"/>"));
        assert!(xml.contains("<acceptAckCode code=\"NE\"/>"));
        assert!(xml.contains(
            "<receiver typeCode=\"RCV\"><device classCode=\"DEV\" determinerCode=\"INSTANCE\"><id root=\"2.16.840.1.113883.3.72.6.2\" extension=\"EHR\"/>"
        ));
        assert!(xml.contains("<typeCode code=\"CA\"/>"));
        assert!(xml.contains("<targetMessage><id root=\"1.2.3.4\" extension=\"MSG-001\"/></targetMessage>"));
        assert!(!xml.contains("acknowledgementDetail"));
    }

    #[test]
    fn test_mcci_error_detail_is_escaped() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        let request = parse_request(PIX_REQUEST).unwrap();
        let xml = builder.mcci(
            &request,
            &AckOutcome::Rejected("blob <timeout> & retry".to_string()),
            now(),
        );
        assert!(xml.contains("<typeCode code=\"CE\"/>"));
        assert!(xml.contains(
            "<acknowledgementDetail typeCode=\"E\"><text>blob &lt;timeout&gt; &amp; retry</text></acknowledgementDetail>"
        ));
    }

    #[test]
    fn test_registry_response_status() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        assert_eq!(
            builder.registry_response(&AckOutcome::Accepted),
            "<rs:RegistryResponse xmlns:rs=\"urn:oasis:names:tc:ebxml-regrep:xsd:rs:3.0\" status=\"urn:oasis:names:tc:ebxml-regrep:ResponseStatusType:Success\"/>"
        );
        assert!(builder
            .registry_response(&AckOutcome::Rejected("x".to_string()))
            .contains("ResponseStatusType:Failure"));
    }

    #[test]
    fn test_soap_response_envelope() {
        let builder = AcknowledgementBuilder::new("1.0.0");
        let request = parse_request(PIX_REQUEST).unwrap();
        let xml = builder.soap_response(
            &request,
            SoapOperation::Pix,
            "iid-9",
            &AckOutcome::Accepted,
            now(),
        );
        assert!(xml.starts_with(
            "<soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope\""
        ));
        assert!(xml.contains("<wsa:Action>urn:hl7-org:v3:MCCI_IN000002UV01</wsa:Action>"));
        assert!(xml.contains(
            "<wsa:RelatesTo>urn:uuid:11111111-2222-3333-4444-555555555555</wsa:RelatesTo>"
        ));
        assert!(xml.contains(">iid-9</techbd:InteractionID>"));

        // 响应本身也是可解析的SOAP
        let reparsed = parse_request(&xml).unwrap();
        assert_eq!(reparsed.body_root, MCCI_INTERACTION);

        let pnr = parse_request(PNR_REQUEST).unwrap();
        let xml = builder.soap_response(
            &pnr,
            SoapOperation::Pnr,
            "iid-10",
            &AckOutcome::Rejected("boom".to_string()),
            now(),
        );
        assert!(xml.starts_with(
            "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\""
        ));
        assert!(!xml.contains("RelatesTo"));
        assert!(xml.contains("ResponseStatusType:Failure"));
    }

    #[test]
    fn test_soap_fault_versions() {
        let builder = AcknowledgementBuilder::new("1.0.0");

        let xml = builder.soap_fault(SoapVersion::Soap12, "iid-11", "Invalid XML: <eof>");
        assert!(xml.contains("<soap:Value>soap:Sender</soap:Value>"));
        assert!(xml.contains("<soap:Text xml:lang=\"en\">Invalid XML: &lt;eof&gt;</soap:Text>"));
        assert!(xml.contains(SOAP_FAULT_ACTION));
        let reparsed = parse_request(&xml).unwrap();
        assert_eq!(reparsed.version, SoapVersion::Soap12);
        assert_eq!(reparsed.body_root, "Fault");

        let xml = builder.soap_fault(SoapVersion::Soap11, "iid-12", "Request body is empty");
        assert!(xml.contains("<faultcode>soap:Client</faultcode>"));
        assert!(xml.contains("<faultstring>Request body is empty</faultstring>"));
        assert_eq!(parse_request(&xml).unwrap().version, SoapVersion::Soap11);
    }
}
