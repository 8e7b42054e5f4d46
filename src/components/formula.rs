use super::{descriptor, field_value};
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use crate::utils::{as_number, number_value};
use async_trait::async_trait;
use evalexpr::{eval_number_with_context, ContextWithMutableVariables, HashMapContext};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

fn default_result_field() -> String {
    "result".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaConfig {
    /// 表达式,如 `(power_in - power_out) / power_in * 100`
    pub expression: String,
    /// 变量名 -> 字段路径;未配置时使用整个 data 中的数值字段
    #[serde(default)]
    pub variables: Option<BTreeMap<String, String>>,
    #[serde(default = "default_result_field")]
    pub result_field: String,
}

/// 公式计算节点
#[derive(Debug)]
pub struct FormulaNode {
    config: FormulaConfig,
}

impl FormulaNode {
    fn scope(&self, msg: &Message) -> Result<HashMapContext, RuleError> {
        let mut context = HashMapContext::new();
        let mut bind = |name: &str, value: &Value| -> Result<(), RuleError> {
            let Some(number) = as_number(value) else {
                debug!("Variable {} is not numeric, left unbound", name);
                return Ok(());
            };
            context
                .set_value(name.to_string(), evalexpr::Value::Float(number))
                .map_err(|e| RuleError::NodeExecutionError(format!("变量 {} 设置失败: {}", name, e)))
        };

        match &self.config.variables {
            Some(mapping) => {
                for (name, field) in mapping {
                    if let Some(value) = field_value(msg, field) {
                        bind(name, value)?;
                    }
                }
            }
            None => {
                for (name, value) in &msg.data {
                    bind(name, value)?;
                }
            }
        }
        Ok(context)
    }
}

#[async_trait]
impl NodeHandler for FormulaNode {
    async fn execute(&self, _ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let context = self.scope(msg)?;
        let result = eval_number_with_context(&self.config.expression, &context).map_err(|e| {
            RuleError::NodeExecutionError(format!(
                "公式 '{}' 计算失败: {}",
                self.config.expression, e
            ))
        })?;

        Ok(NodeOutcome::Single(msg.merge_data([(
            self.config.result_field.clone(),
            number_value(result),
        )])))
    }
}

impl NodeKind for FormulaNode {
    const TYPE: &'static str = "formula";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "公式计算",
            "对变量作用域求值数学表达式,结果写入 data",
            NodeCategory::Transform,
            json!({
                "type": "object",
                "required": ["expression"],
                "properties": {
                    "expression": { "type": "string", "minLength": 1 },
                    "variables": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    },
                    "resultField": { "type": "string" }
                }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        let config: FormulaConfig = parse_config(Self::TYPE, config)?;
        evalexpr::build_operator_tree(&config.expression).map_err(|e| {
            RuleError::ConfigError(format!("{}: 表达式无效 '{}': {}", Self::TYPE, config.expression, e))
        })?;
        Ok(Self { config })
    }
}
