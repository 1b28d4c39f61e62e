//! HL7 v2 消息字段访问
//!
//! 只做确认消息和消息分组所需的最小解析：MSH按位置取字段，
//! ZNT取分组参数。不做语义校验。

use gateway_core::{parameter_names, GatewayError, Result, UNKNOWN_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

const FIELD_SEPARATOR: char = '|';
const COMPONENT_SEPARATOR: char = '^';

/// MSH段头部字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MshHeader {
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub receiving_application: Option<String>,
    pub receiving_facility: Option<String>,
    pub timestamp: Option<String>,
    pub message_type: Option<String>,
    pub control_id: Option<String>,
    pub processing_id: Option<String>,
    pub version: Option<String>,
}

impl MshHeader {
    pub fn sending_application_or_unknown(&self) -> &str {
        self.sending_application.as_deref().unwrap_or(UNKNOWN_FIELD)
    }

    pub fn sending_facility_or_unknown(&self) -> &str {
        self.sending_facility.as_deref().unwrap_or(UNKNOWN_FIELD)
    }

    pub fn receiving_application_or_unknown(&self) -> &str {
        self.receiving_application.as_deref().unwrap_or(UNKNOWN_FIELD)
    }

    pub fn receiving_facility_or_unknown(&self) -> &str {
        self.receiving_facility.as_deref().unwrap_or(UNKNOWN_FIELD)
    }

    pub fn control_id_or_unknown(&self) -> &str {
        self.control_id.as_deref().unwrap_or(UNKNOWN_FIELD)
    }

    /// MLLP来源的User-Agent: `App@Facility`
    pub fn user_agent(&self) -> String {
        match (&self.sending_application, &self.sending_facility) {
            (None, None) => "MLLP Listener".to_string(),
            (app, facility) => format!(
                "{}@{}",
                app.as_deref().unwrap_or("UnknownApp"),
                facility.as_deref().unwrap_or("UnknownFacility")
            ),
        }
    }
}

/// ZNT段中用于消息分组的字段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZntFields {
    pub message_code: Option<String>,
    pub delivery_type: Option<String>,
    pub qe: Option<String>,
    pub facility: Option<String>,
}

impl ZntFields {
    /// 写入来源特定参数，缺失字段不写
    pub fn into_parameters(self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let pairs = [
            (parameter_names::MESSAGE_CODE, self.message_code),
            (parameter_names::DELIVERY_TYPE, self.delivery_type),
            (parameter_names::QE, self.qe),
            (parameter_names::FACILITY, self.facility),
        ];
        for (name, value) in pairs {
            if let Some(v) = value {
                params.insert(name.to_string(), v);
            }
        }
        params
    }
}

/// 按段切分后的HL7 v2消息
#[derive(Debug, Clone)]
pub struct Hl7Message {
    segments: Vec<Vec<String>>,
}

impl Hl7Message {
    /// 解析消息，首段必须是MSH
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<Vec<String>> = raw
            .split(|c| c == '\r' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.split(FIELD_SEPARATOR).map(str::to_string).collect())
            .collect();

        match segments.first().and_then(|s| s.first()) {
            Some(name) if name == "MSH" => {}
            Some(name) => {
                return Err(GatewayError::Hl7(format!(
                    "Message must start with MSH segment, found {}",
                    name
                )))
            }
            None => return Err(GatewayError::Hl7("Empty message".to_string())),
        }

        debug!("Parsed HL7 message with {} segments", segments.len());
        Ok(Self { segments })
    }

    /// 查找指定名称的第一个段
    pub fn segment(&self, name: &str) -> Option<&[String]> {
        self.segments
            .iter()
            .find(|s| s.first().map(String::as_str) == Some(name))
            .map(Vec::as_slice)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// MSH字段按 `|` 切分后的位置读取（MSH-1 本身是分隔符，所以索引比字段号小1）
    pub fn msh(&self) -> MshHeader {
        let msh = self.segment("MSH").unwrap_or(&[]);
        let field = |i: usize| non_empty(msh.get(i));
        MshHeader {
            sending_application: field(2),
            sending_facility: field(3),
            receiving_application: field(4),
            receiving_facility: field(5),
            timestamp: field(6),
            message_type: field(8),
            control_id: field(9),
            processing_id: field(10),
            version: field(11),
        }
    }

    /// 读取ZNT段的分组字段
    pub fn znt(&self) -> Option<ZntFields> {
        let znt = self.segment("ZNT")?;
        let message_code = first_component(znt.get(2));
        let delivery_type = first_component(znt.get(4));

        let (qe, facility) = match non_empty(znt.get(8)) {
            Some(value) => match value.split_once(':') {
                Some((qe, facility)) => (
                    Some(qe.to_string()).filter(|v| !v.is_empty()),
                    Some(facility.to_string()).filter(|v| !v.is_empty()),
                ),
                None => (None, Some(value)),
            },
            None => (None, None),
        };

        Some(ZntFields {
            message_code,
            delivery_type,
            qe,
            facility,
        })
    }
}

fn first_component(value: Option<&String>) -> Option<String> {
    non_empty(value)
        .and_then(|v| v.split(COMPONENT_SEPARATOR).next().map(str::to_string))
        .filter(|v| !v.is_empty())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
