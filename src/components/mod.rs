//! 内置节点目录
//!
//! 每个节点类型是一个 [`NodeKind`]: 强类型配置 + JSON Schema 描述符 + 执行逻辑。
//! 启动时通过 [`register_builtin_nodes`] 一次性注册。

mod action;
mod enrich;
mod filter;
mod flow;
mod formula;
mod log;
mod switch;
mod transform;

pub use action::*;
pub use enrich::*;
pub use filter::*;
pub use flow::*;
pub use formula::FormulaNode;
pub use log::LogNode;
pub use switch::*;
pub use transform::*;

use crate::engine::{NodeKind, NodeRegistry};
use crate::types::{Message, NodeCategory, NodeDescriptor};
use crate::utils::value_at_path;
use serde_json::Value;

/// 注册全部内置节点类型
pub fn register_builtin_nodes(registry: &mut NodeRegistry) {
    // 过滤
    registry.register_kind::<ThresholdFilter>();
    registry.register_kind::<ScriptFilter>();
    registry.register_kind::<EntityTypeFilter>();
    registry.register_kind::<AlarmStatusFilter>();
    registry.register_kind::<FieldPresenceFilter>();

    // 转换
    registry.register_kind::<ScriptTransform>();
    registry.register_kind::<MathNode>();
    registry.register_kind::<FormulaNode>();
    registry.register_kind::<OriginatorChange>();
    registry.register_kind::<CheckpointNode>();
    registry.register_kind::<AcknowledgeNode>();
    registry.register_kind::<LogNode>();

    // 富化
    registry.register_kind::<FetchAssetAttributes>();
    registry.register_kind::<FetchAssetTelemetry>();
    registry.register_kind::<FetchRelatedAssets>();
    registry.register_kind::<TenantAttributes>();

    // 动作
    registry.register_kind::<CreateAlarm>();
    registry.register_kind::<ClearAlarm>();
    registry.register_kind::<SetStatus>();
    registry.register_kind::<UpdateTwinFeature>();
    registry.register_kind::<DeleteAttributes>();
    registry.register_kind::<PublishNode>();
    registry.register_kind::<SaveTimeseries>();
    registry.register_kind::<AssignCustomer>();
    registry.register_kind::<UnassignCustomer>();
    registry.register_kind::<CreateRelation>();
    registry.register_kind::<DeleteRelation>();

    // 流程控制
    registry.register_kind::<SwitchNode>();
    registry.register_kind::<EntityTypeSwitch>();
    registry.register_kind::<MessageTypeSwitch>();
    registry.register_kind::<RuleChainNode>();
    registry.register_kind::<RouteToComponents>();
    registry.register_kind::<DelayNode>();
}

/// 注册了全部内置节点的注册表
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtin_nodes(&mut registry);
    registry
}

pub(crate) fn descriptor<N: NodeKind>(
    name: &str,
    description: &str,
    category: NodeCategory,
    config_schema: Value,
) -> NodeDescriptor {
    NodeDescriptor {
        type_name: N::TYPE.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        category,
        config_schema,
    }
}

/// 按路径取字段: `metadata.` 前缀读 metadata,否则先 data 后 metadata
pub(crate) fn field_value<'m>(msg: &'m Message, path: &str) -> Option<&'m Value> {
    if let Some(path) = path.strip_prefix("metadata.") {
        return value_at_path(&msg.metadata, path);
    }
    let path = path.strip_prefix("data.").unwrap_or(path);
    value_at_path(&msg.data, path).or_else(|| value_at_path(&msg.metadata, path))
}

/// 取字符串字段
pub(crate) fn field_str<'m>(msg: &'m Message, path: &str) -> Option<&'m str> {
    field_value(msg, path).and_then(Value::as_str)
}

/// 从配置字段读取资产 id,缺省时回退到 `assetId` / `thingId`
pub(crate) fn asset_id_of<'m>(msg: &'m Message, field: &str) -> Option<&'m str> {
    field_str(msg, field).or_else(|| msg.asset_id())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::collaborators::memory::{InMemoryRuleRepository, MemoryBackends};
    use crate::config::EngineConfig;
    use crate::engine::{NodeHandler, NodeKind, RuleEngine};
    use crate::types::{Message, NodeContext, NodeOutcome, RuleError, RuleNode};
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use uuid::Uuid;

    /// 单节点测试夹具: 内存协作者 + 注册了内置节点的引擎
    pub struct Harness {
        pub engine: RuleEngine,
        pub backends: MemoryBackends,
        pub repository: Arc<InMemoryRuleRepository>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        pub fn with_config(config: EngineConfig) -> Self {
            let backends = MemoryBackends::default();
            let repository = Arc::new(InMemoryRuleRepository::new());
            let engine = RuleEngine::new(
                config,
                super::builtin_registry(),
                backends.collaborators(),
                repository.clone(),
            )
            .unwrap();
            Self {
                engine,
                backends,
                repository,
            }
        }

        /// 用给定配置构造节点并对消息执行一次
        pub async fn run<N: NodeKind>(
            &self,
            config: Value,
            msg: &Message,
        ) -> Result<NodeOutcome, RuleError> {
            let config = config.as_object().cloned().unwrap_or_default();
            let handler = N::from_config(&config)?;
            let node = rule_node(N::TYPE, config);
            let ctx = NodeContext::new(&node, Uuid::nil(), "t1", 0, &self.engine);
            handler.execute(&ctx, msg).await
        }
    }

    pub fn rule_node(type_name: &str, config: Map<String, Value>) -> RuleNode {
        RuleNode {
            id: format!("{}-1", type_name),
            type_name: type_name.to_string(),
            position: None,
            config,
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            entry: false,
        }
    }

    pub fn msg(data: Value) -> Message {
        Message::from_value("telemetry", data)
    }

    pub fn single(outcome: NodeOutcome) -> Message {
        match outcome {
            NodeOutcome::Single(msg) => msg,
            other => panic!("expected a single message, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_complete() {
        let registry = builtin_registry();
        let types = registry.list_types();
        for expected in [
            "threshold-filter",
            "script-filter",
            "entity-type-filter",
            "alarm-status-filter",
            "field-presence-filter",
            "script-transform",
            "math",
            "formula",
            "originator-change",
            "checkpoint",
            "acknowledge",
            "log",
            "fetch-asset-attributes",
            "fetch-asset-telemetry",
            "fetch-related-assets",
            "tenant-attributes",
            "create-alarm",
            "clear-alarm",
            "set-status",
            "update-twin-feature",
            "delete-attributes",
            "publish",
            "save-timeseries",
            "assign-customer",
            "unassign-customer",
            "create-relation",
            "delete-relation",
            "switch",
            "entity-type-switch",
            "message-type-switch",
            "rule-chain",
            "route-to-components",
            "delay",
        ] {
            assert!(types.contains(expected), "missing node type {}", expected);
            assert!(registry.descriptor(expected).is_some());
        }
        assert_eq!(types.len(), 33);
    }

    #[test]
    fn test_descriptor_schemas_compile() {
        for descriptor in builtin_registry().descriptors() {
            assert!(
                jsonschema::validator_for(&descriptor.config_schema).is_ok(),
                "invalid schema for {}",
                descriptor.type_name
            );
        }
    }
}
