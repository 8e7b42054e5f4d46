use super::{descriptor, field_str, field_value};
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use crate::utils::{as_number, truthy};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn compare(self, left: f64, right: f64) -> bool {
        match self {
            Operator::Gt => left > right,
            Operator::Ge => left >= right,
            Operator::Lt => left < right,
            Operator::Le => left <= right,
            Operator::Eq => (left - right).abs() < f64::EPSILON,
            Operator::Ne => (left - right).abs() >= f64::EPSILON,
        }
    }
}

fn pass_if(passed: bool, msg: &Message) -> NodeOutcome {
    if passed {
        NodeOutcome::Single(msg.clone())
    } else {
        NodeOutcome::None
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdFilterConfig {
    pub field: String,
    pub operator: Operator,
    pub threshold: f64,
}

/// 数值阈值过滤
#[derive(Debug)]
pub struct ThresholdFilter {
    config: ThresholdFilterConfig,
}

#[async_trait]
impl NodeHandler for ThresholdFilter {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(value) = field_value(msg, &self.config.field) else {
            debug!("Field {} missing, message filtered", self.config.field);
            return Ok(NodeOutcome::None);
        };
        let Some(number) = as_number(value) else {
            warn!(
                "Field {} is not numeric ({}), message filtered",
                self.config.field, value
            );
            return Ok(NodeOutcome::None);
        };

        Ok(pass_if(
            self.config.operator.compare(number, self.config.threshold),
            msg,
        ))
    }
}

impl NodeKind for ThresholdFilter {
    const TYPE: &'static str = "threshold-filter";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "阈值过滤",
            "字段数值与阈值比较,不满足或非数值时丢弃消息",
            NodeCategory::Filter,
            json!({
                "type": "object",
                "required": ["field", "operator", "threshold"],
                "properties": {
                    "field": { "type": "string" },
                    "operator": { "enum": [">", ">=", "<", "<=", "==", "!="] },
                    "threshold": { "type": "number" }
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

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    /// 函数体,可访问 `msg`、`metadata`、`msgType`
    pub script: String,
}

/// 脚本谓词过滤
#[derive(Debug)]
pub struct ScriptFilter {
    config: ScriptConfig,
}

#[async_trait]
impl NodeHandler for ScriptFilter {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let result = ctx.evaluator().evaluate(&self.config.script, msg)?;
        Ok(pass_if(truthy(&result), msg))
    }
}

impl NodeKind for ScriptFilter {
    const TYPE: &'static str = "script-filter";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "脚本过滤",
            "执行 JavaScript 谓词,结果为假时丢弃消息",
            NodeCategory::Filter,
            json!({
                "type": "object",
                "required": ["script"],
                "properties": { "script": { "type": "string", "minLength": 1 } }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

fn default_entity_type_field() -> String {
    "entityType".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeFilterConfig {
    pub entity_types: Vec<String>,
    #[serde(default = "default_entity_type_field")]
    pub field: String,
}

/// 实体类型过滤
#[derive(Debug)]
pub struct EntityTypeFilter {
    config: EntityTypeFilterConfig,
}

#[async_trait]
impl NodeHandler for EntityTypeFilter {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let passed = field_str(msg, &self.config.field)
            .is_some_and(|t| self.config.entity_types.iter().any(|e| e.eq_ignore_ascii_case(t)));
        Ok(pass_if(passed, msg))
    }
}

impl NodeKind for EntityTypeFilter {
    const TYPE: &'static str = "entity-type-filter";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "实体类型过滤",
            "仅放行指定实体类型的消息",
            NodeCategory::Filter,
            json!({
                "type": "object",
                "required": ["entityTypes"],
                "properties": {
                    "entityTypes": { "type": "array", "items": { "type": "string" } },
                    "field": { "type": "string" }
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

#[derive(Debug, Clone, Deserialize)]
pub struct AlarmStatusFilterConfig {
    pub statuses: Vec<String>,
}

/// 告警状态过滤,读取 `alarmStatus`
#[derive(Debug)]
pub struct AlarmStatusFilter {
    config: AlarmStatusFilterConfig,
}

#[async_trait]
impl NodeHandler for AlarmStatusFilter {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let passed = field_str(msg, "alarmStatus")
            .is_some_and(|s| self.config.statuses.iter().any(|e| e.eq_ignore_ascii_case(s)));
        Ok(pass_if(passed, msg))
    }
}

impl NodeKind for AlarmStatusFilter {
    const TYPE: &'static str = "alarm-status-filter";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "告警状态过滤",
            "仅放行指定告警状态的消息",
            NodeCategory::Filter,
            json!({
                "type": "object",
                "required": ["statuses"],
                "properties": {
                    "statuses": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
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

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldPresenceConfig {
    pub fields: Vec<String>,
    #[serde(default)]
    pub mode: PresenceMode,
}

/// 字段存在性过滤
#[derive(Debug)]
pub struct FieldPresenceFilter {
    config: FieldPresenceConfig,
}

#[async_trait]
impl NodeHandler for FieldPresenceFilter {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let present = |field: &String| field_value(msg, field).is_some_and(|v| !v.is_null());
        let passed = match self.config.mode {
            PresenceMode::All => self.config.fields.iter().all(present),
            PresenceMode::Any => self.config.fields.iter().any(present),
        };
        Ok(pass_if(passed, msg))
    }
}

impl NodeKind for FieldPresenceFilter {
    const TYPE: &'static str = "field-presence-filter";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "字段存在过滤",
            "检查 data / metadata 中的字段是否存在",
            NodeCategory::Filter,
            json!({
                "type": "object",
                "required": ["fields"],
                "properties": {
                    "fields": { "type": "array", "items": { "type": "string" } },
                    "mode": { "enum": ["all", "any"] }
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
