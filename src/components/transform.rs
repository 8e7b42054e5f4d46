use super::filter::ScriptConfig;
use super::{descriptor, field_str, field_value};
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use crate::utils::{as_number, number_value};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// 脚本转换
///
/// 脚本返回对象:
/// * 含 `msg` / `metadata` / `msgType` 键时分别浅合并到 data、metadata,替换消息类型
/// * 否则整个对象浅合并到 data
/// * 返回 `null` 时丢弃消息
#[derive(Debug)]
pub struct ScriptTransform {
    config: ScriptConfig,
}

impl ScriptTransform {
    fn apply(msg: &Message, result: Value) -> Result<NodeOutcome, RuleError> {
        let mut result = match result {
            Value::Null => return Ok(NodeOutcome::None),
            Value::Object(map) => map,
            other => {
                return Err(RuleError::ScriptError(format!(
                    "转换脚本必须返回对象,实际为 {}",
                    other
                )))
            }
        };

        let structured = ["msg", "metadata", "msgType"]
            .iter()
            .any(|key| result.contains_key(*key));
        if !structured {
            return Ok(NodeOutcome::Single(msg.merge_data(result)));
        }

        let mut derived = msg.clone();
        if let Some(Value::Object(data)) = result.remove("msg") {
            derived.data.extend(data);
        }
        if let Some(Value::Object(metadata)) = result.remove("metadata") {
            derived.metadata.extend(metadata);
        }
        if let Some(Value::String(msg_type)) = result.remove("msgType") {
            derived.msg_type = msg_type;
        }
        Ok(NodeOutcome::Single(derived))
    }
}

#[async_trait]
impl NodeHandler for ScriptTransform {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let result = ctx.evaluator().evaluate(&self.config.script, msg)?;
        Self::apply(msg, result)
    }
}

impl NodeKind for ScriptTransform {
    const TYPE: &'static str = "script-transform";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "脚本转换",
            "执行 JavaScript,将返回对象合并到消息",
            NodeCategory::Transform,
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

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Sqrt,
    Abs,
    Round,
    Ceil,
    Floor,
}

fn default_result_field() -> String {
    "result".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MathConfig {
    pub operation: MathOperation,
    /// 操作数字段名,按顺序参与运算
    pub operands: Vec<String>,
    #[serde(default = "default_result_field")]
    pub result_field: String,
}

/// 算术运算节点
#[derive(Debug)]
pub struct MathNode {
    config: MathConfig,
}

impl MathNode {
    /// 非数值操作数不参与运算
    fn operand_values(&self, msg: &Message) -> Vec<f64> {
        self.config
            .operands
            .iter()
            .filter_map(|name| {
                let number = field_value(msg, name).and_then(as_number);
                if number.is_none() {
                    debug!("Operand {} is not numeric, skipped", name);
                }
                number
            })
            .collect()
    }

    pub fn compute(operation: MathOperation, values: &[f64]) -> Result<f64, RuleError> {
        let (&first, rest) = values
            .split_first()
            .ok_or_else(|| RuleError::NodeExecutionError("没有可用的数值操作数".to_string()))?;

        let result = match operation {
            MathOperation::Add => values.iter().sum(),
            MathOperation::Multiply => values.iter().product(),
            MathOperation::Subtract => rest.iter().fold(first, |acc, v| acc - v),
            MathOperation::Divide => {
                if rest.iter().any(|v| *v == 0.0) {
                    return Err(RuleError::NodeExecutionError("除数为零".to_string()));
                }
                rest.iter().fold(first, |acc, v| acc / v)
            }
            MathOperation::Power => {
                let exponent = rest.first().ok_or_else(|| {
                    RuleError::NodeExecutionError("power 需要两个操作数".to_string())
                })?;
                first.powf(*exponent)
            }
            MathOperation::Sqrt => first.sqrt(),
            MathOperation::Abs => first.abs(),
            MathOperation::Round => first.round(),
            MathOperation::Ceil => first.ceil(),
            MathOperation::Floor => first.floor(),
        };

        if result.is_finite() {
            Ok(result)
        } else {
            Err(RuleError::NodeExecutionError(format!(
                "运算结果无效: {}",
                result
            )))
        }
    }
}

#[async_trait]
impl NodeHandler for MathNode {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let values = self.operand_values(msg);
        let result = Self::compute(self.config.operation, &values)?;
        Ok(NodeOutcome::Single(msg.merge_data([(
            self.config.result_field.clone(),
            number_value(result),
        )])))
    }
}

impl NodeKind for MathNode {
    const TYPE: &'static str = "math";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "算术运算",
            "对操作数字段做加减乘除、乘方、开方、取整等运算",
            NodeCategory::Transform,
            json!({
                "type": "object",
                "required": ["operation", "operands"],
                "properties": {
                    "operation": {
                        "enum": ["add", "subtract", "multiply", "divide", "power",
                                 "sqrt", "abs", "round", "ceil", "floor"]
                    },
                    "operands": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                    "resultField": { "type": "string" }
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

/// 新发起者来源
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum OriginatorSource {
    /// 从消息字段读取
    #[serde(rename_all = "camelCase")]
    Field { field: String },
    /// 取关联资产中的第一个
    #[serde(rename_all = "camelCase")]
    Related { relation_type: String },
}

/// 更换消息发起者(资产 id),原发起者记录在 `metadata.originalAssetId`
#[derive(Debug)]
pub struct OriginatorChange {
    source: OriginatorSource,
}

#[async_trait]
impl NodeHandler for OriginatorChange {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(current) = msg.asset_id() else {
            warn!("Message has no originator, dropped");
            return Ok(NodeOutcome::None);
        };

        let originator = match &self.source {
            OriginatorSource::Field { field } => field_str(msg, field).map(str::to_string),
            OriginatorSource::Related { relation_type } => {
                match ctx
                    .collaborators()
                    .directory
                    .related_assets(current, relation_type)
                    .await
                {
                    Ok(related) => related.into_iter().next(),
                    Err(e) => {
                        warn!("Failed to resolve related originator: {:#}", e);
                        None
                    }
                }
            }
        };

        let Some(originator) = originator else {
            warn!("No new originator for {}, message dropped", current);
            return Ok(NodeOutcome::None);
        };

        let derived = msg
            .merge_data([("assetId".to_string(), Value::String(originator))])
            .annotate("originalAssetId", Value::String(current.to_string()));
        Ok(NodeOutcome::Single(derived))
    }
}

impl NodeKind for OriginatorChange {
    const TYPE: &'static str = "originator-change";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "更换发起者",
            "按字段或关联关系替换消息的资产 id",
            NodeCategory::Transform,
            json!({
                "type": "object",
                "required": ["source"],
                "properties": {
                    "source": { "enum": ["field", "related"] },
                    "field": { "type": "string" },
                    "relationType": { "type": "string" }
                }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            source: parse_config(Self::TYPE, config)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    pub name: String,
}

/// 在 metadata 中记录检查点
#[derive(Debug)]
pub struct CheckpointNode {
    config: CheckpointConfig,
}

#[async_trait]
impl NodeHandler for CheckpointNode {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        Ok(NodeOutcome::Single(msg.merge_metadata([
            ("checkpoint".to_string(), json!(self.config.name)),
            ("checkpointTs".to_string(), json!(msg.timestamp)),
        ])))
    }
}

impl NodeKind for CheckpointNode {
    const TYPE: &'static str = "checkpoint";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "检查点",
            "在 metadata 中记录命名检查点",
            NodeCategory::Transform,
            json!({
                "type": "object",
                "required": ["name"],
                "properties": { "name": { "type": "string" } }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

/// 确认消息,写入 `metadata.acknowledged`
#[derive(Debug)]
pub struct AcknowledgeNode;

#[async_trait]
impl NodeHandler for AcknowledgeNode {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        Ok(NodeOutcome::Single(msg.merge_metadata([
            ("acknowledged".to_string(), Value::Bool(true)),
            ("acknowledgedTs".to_string(), json!(msg.timestamp)),
        ])))
    }
}

impl NodeKind for AcknowledgeNode {
    const TYPE: &'static str = "acknowledge";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "确认",
            "标记消息已确认",
            NodeCategory::Transform,
            json!({ "type": "object" }),
        )
    }

    fn from_config(_config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self)
    }
}
