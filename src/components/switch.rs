//! 分支节点
//!
//! 分支节点只写入 `outputRoute`,由图遍历按 `fromPort` 选择出边;
//! 没有匹配的出边时走 `default` 端口,仍没有则丢弃。

use super::{descriptor, field_str};
use crate::engine::{parse_config, NodeHandler, NodeKind, DEFAULT_PORT};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use crate::utils::truthy;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// 分支条件
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchCase {
    /// 分支名称,对应连接的 fromPort
    pub name: String,
    /// JS 条件表达式,可访问 msg / metadata / msgType
    pub condition: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchConfig {
    pub cases: Vec<SwitchCase>,
    /// 无条件命中时的分支名称
    #[serde(default)]
    pub default_route: Option<String>,
}

/// 条件分支节点,按顺序取第一个为真的分支
#[derive(Debug)]
pub struct SwitchNode {
    config: SwitchConfig,
}

impl SwitchNode {
    fn evaluate_case(&self, ctx: &NodeContext<'_>, case: &SwitchCase, msg: &Message) -> bool {
        let script = format!("return ({});", case.condition);
        match ctx.evaluator().evaluate(&script, msg) {
            Ok(result) => truthy(&result),
            Err(e) => {
                // 条件本身出错视为不命中,继续下一个分支
                warn!(parent: ctx.span(), "Switch case {} failed: {}", case.name, e);
                false
            }
        }
    }
}

#[async_trait]
impl NodeHandler for SwitchNode {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let route = self
            .config
            .cases
            .iter()
            .find(|case| self.evaluate_case(ctx, case, msg))
            .map(|case| case.name.as_str())
            .or(self.config.default_route.as_deref())
            .unwrap_or(DEFAULT_PORT);

        debug!(parent: ctx.span(), "Switch routed to {}", route);
        Ok(NodeOutcome::Single(msg.route_to(route)))
    }
}

impl NodeKind for SwitchNode {
    const TYPE: &'static str = "switch";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "条件分支",
            "根据 JS 条件选择不同的处理分支",
            NodeCategory::Flow,
            json!({
                "type": "object",
                "required": ["cases"],
                "properties": {
                    "cases": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "condition"],
                            "properties": {
                                "name": { "type": "string", "minLength": 1 },
                                "condition": { "type": "string", "minLength": 1 },
                                "description": { "type": "string" }
                            }
                        }
                    },
                    "defaultRoute": { "type": "string" }
                }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

fn default_entity_field() -> String {
    "entityType".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeSwitchConfig {
    #[serde(default = "default_entity_field")]
    pub field: String,
}

/// 按实体类型分支,路由名即实体类型
#[derive(Debug)]
pub struct EntityTypeSwitch {
    config: EntityTypeSwitchConfig,
}

#[async_trait]
impl NodeHandler for EntityTypeSwitch {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let route = match field_str(msg, &self.config.field) {
            Some(entity_type) => entity_type,
            None => {
                debug!(parent: ctx.span(), "No {} on message, using default route", self.config.field);
                DEFAULT_PORT
            }
        };
        Ok(NodeOutcome::Single(msg.route_to(route)))
    }
}

impl NodeKind for EntityTypeSwitch {
    const TYPE: &'static str = "entity-type-switch";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "实体类型分支",
            "以实体类型作为输出路由",
            NodeCategory::Flow,
            json!({
                "type": "object",
                "properties": { "field": { "type": "string" } }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

/// 按消息类型分支
#[derive(Debug)]
pub struct MessageTypeSwitch;

#[async_trait]
impl NodeHandler for MessageTypeSwitch {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        Ok(NodeOutcome::Single(msg.route_to(&msg.msg_type)))
    }
}

impl NodeKind for MessageTypeSwitch {
    const TYPE: &'static str = "message-type-switch";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "消息类型分支",
            "以消息类型作为输出路由",
            NodeCategory::Flow,
            json!({ "type": "object" }),
        )
    }

    fn from_config(_config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self)
    }
}
