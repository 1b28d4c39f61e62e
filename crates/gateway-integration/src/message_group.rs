//! 消息分组
//!
//! 按顺序遍历分组策略，第一个 `supports` 为真的策略计算分组键；
//! 都不匹配时使用默认分组。策略必须是上下文的纯函数，同一上下文
//! 多次计算得到完全相同的键，下游FIFO顺序依赖这一点。

use gateway_core::{
    header_names, parameter_names, utils::non_blank, MessageSourceType, RequestContext,
    DEFAULT_MESSAGE_GROUP_ID,
};
use std::sync::Arc;
use tracing::{info, warn};

/// 分组策略接口
pub trait MessageGroupStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, context: &RequestContext) -> bool;

    fn create_group_id(&self, context: &RequestContext) -> String;
}

/// MLLP分组：`{QE}_{facility}_{messageCode}_{deliveryType}`，只拼接非空部分
pub struct MllpGroupStrategy;

impl MessageGroupStrategy for MllpGroupStrategy {
    fn name(&self) -> &str {
        "mllp"
    }

    fn supports(&self, context: &RequestContext) -> bool {
        context.message_source_type == MessageSourceType::Mllp
    }

    fn create_group_id(&self, context: &RequestContext) -> String {
        let parts: Vec<&str> = [
            parameter_names::QE,
            parameter_names::FACILITY,
            parameter_names::MESSAGE_CODE,
            parameter_names::DELIVERY_TYPE,
        ]
        .iter()
        .filter_map(|name| context.parameter(name))
        .collect();

        if !parts.is_empty() {
            return parts.join("_");
        }
        non_blank(context.destination_port.as_deref())
            .unwrap_or(DEFAULT_MESSAGE_GROUP_ID)
            .to_string()
    }
}

/// 来源 + 消息类型分组：`{sourceId}_{msgType}`，两者都存在时才匹配
pub struct SourceMessageTypeGroupStrategy;

impl MessageGroupStrategy for SourceMessageTypeGroupStrategy {
    fn name(&self) -> &str {
        "source_message_type"
    }

    fn supports(&self, context: &RequestContext) -> bool {
        context.parameter(parameter_names::SOURCE_ID).is_some()
            && context.parameter(parameter_names::MESSAGE_TYPE).is_some()
    }

    fn create_group_id(&self, context: &RequestContext) -> String {
        format!(
            "{}_{}",
            context.parameter(parameter_names::SOURCE_ID).unwrap_or_default(),
            context.parameter(parameter_names::MESSAGE_TYPE).unwrap_or_default()
        )
    }
}

/// 租户分组：请求显式携带租户头时使用租户id，暂存（hold）流量除外
pub struct TenantGroupStrategy;

impl MessageGroupStrategy for TenantGroupStrategy {
    fn name(&self) -> &str {
        "tenant"
    }

    fn supports(&self, context: &RequestContext) -> bool {
        !matches!(
            context.message_source_type,
            MessageSourceType::HttpHold | MessageSourceType::Mllp
        ) && context.header(header_names::TENANT_ID).is_some()
    }

    fn create_group_id(&self, context: &RequestContext) -> String {
        context.tenant_id.clone()
    }
}

/// 地址分组：`{sourceIp}_{destinationIp}_{destinationPort}`
pub struct AddressGroupStrategy;

impl MessageGroupStrategy for AddressGroupStrategy {
    fn name(&self) -> &str {
        "address"
    }

    fn supports(&self, context: &RequestContext) -> bool {
        non_blank(context.source_ip.as_deref()).is_some()
            && non_blank(context.destination_ip.as_deref()).is_some()
            && non_blank(context.destination_port.as_deref()).is_some()
    }

    fn create_group_id(&self, context: &RequestContext) -> String {
        format!(
            "{}_{}_{}",
            context.source_ip.as_deref().unwrap_or_default().trim(),
            context.destination_ip.as_deref().unwrap_or_default().trim(),
            context.destination_port.as_deref().unwrap_or_default().trim()
        )
    }
}

/// 消息分组服务，策略列表启动后不可变
#[derive(Clone)]
pub struct MessageGroupService {
    strategies: Arc<Vec<Box<dyn MessageGroupStrategy>>>,
}

impl MessageGroupService {
    pub fn new(strategies: Vec<Box<dyn MessageGroupStrategy>>) -> Self {
        Self {
            strategies: Arc::new(strategies),
        }
    }

    /// 计算分组键并写入上下文
    pub fn assign(&self, context: &mut RequestContext) -> String {
        let group_id = self.group_id(context);
        context.message_group_id = Some(group_id.clone());
        group_id
    }

    /// 只计算不写入
    pub fn group_id(&self, context: &RequestContext) -> String {
        for strategy in self.strategies.iter() {
            if strategy.supports(context) {
                let group_id = strategy.create_group_id(context);
                info!(
                    interaction_id = %context.interaction_id,
                    group_key = %group_id,
                    "Selected message group strategy [{}]",
                    strategy.name()
                );
                return group_id;
            }
        }
        warn!(
            interaction_id = %context.interaction_id,
            "No strategy matched, using default message group ID"
        );
        DEFAULT_MESSAGE_GROUP_ID.to_string()
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for MessageGroupService {
    fn default() -> Self {
        Self::new(vec![
            Box::new(MllpGroupStrategy),
            Box::new(SourceMessageTypeGroupStrategy),
            Box::new(TenantGroupStrategy),
            Box::new(AddressGroupStrategy),
        ])
    }
}
