use crate::types::{Message, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// 节点处理器特征,定义了节点的核心处理逻辑
///
/// 节点对单次调用无状态: 输入消息只读,结果通过 [`NodeOutcome`] 返回。
#[async_trait]
pub trait NodeHandler: Send + Sync + fmt::Debug {
    /// 处理消息
    ///
    /// # Returns
    /// * `Ok(NodeOutcome)` - 替换消息 / 扇出消息 / 丢弃
    /// * `Err(RuleError)` - 仅当前分支终止
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError>;
}

/// 内置节点类型: 类型标识 + 描述符 + 配置解析
pub trait NodeKind: NodeHandler + Sized + 'static {
    const TYPE: &'static str;

    fn descriptor() -> NodeDescriptor;

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError>;
}

/// 将节点配置解析为强类型配置
pub fn parse_config<T: DeserializeOwned>(
    type_name: &str,
    config: &Map<String, Value>,
) -> Result<T, RuleError> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| RuleError::ConfigError(format!("{}: {}", type_name, e)))
}

/// 节点工厂函数类型,用于根据配置创建节点实例
pub type NodeFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn NodeHandler>, RuleError> + Send + Sync>;

/// 节点注册表,管理所有已注册的节点类型
///
/// 启动时一次性注册全部节点,之后只读共享,无需加锁。
#[derive(Default)]
pub struct NodeRegistry {
    /// 存储节点工厂函数,key为节点类型名称
    factories: HashMap<String, NodeFactory>,
    /// 存储节点描述符,key为节点类型名称
    descriptors: BTreeMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册节点类型,重复注册会覆盖并告警
    pub fn register(&mut self, type_name: &str, factory: NodeFactory) {
        if self
            .factories
            .insert(type_name.to_string(), factory)
            .is_some()
        {
            tracing::warn!("Node type {} re-registered, previous factory replaced", type_name);
        }
    }

    /// 注册节点类型及其描述符
    pub fn register_with_descriptor(&mut self, descriptor: NodeDescriptor, factory: NodeFactory) {
        let type_name = descriptor.type_name.clone();
        self.register(&type_name, factory);
        self.descriptors.insert(type_name, descriptor);
    }

    /// 注册内置节点类型
    pub fn register_kind<N: NodeKind>(&mut self) {
        let factory: NodeFactory = Arc::new(|config: &Map<String, Value>| {
            Ok(Arc::new(N::from_config(config)?) as Arc<dyn NodeHandler>)
        });
        self.register_with_descriptor(N::descriptor(), factory);
    }

    /// 根据节点类型和配置创建节点处理器实例
    pub fn create(
        &self,
        type_name: &str,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn NodeHandler>, RuleError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| RuleError::UnknownNodeType(type_name.to_string()))?;
        factory(config)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// 获取所有已注册的节点类型名称(有序)
    pub fn list_types(&self) -> BTreeSet<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&NodeDescriptor> {
        self.descriptors.get(type_name)
    }

    /// 获取所有已注册节点的描述符,按类型名排序
    pub fn descriptors(&self) -> Vec<NodeDescriptor> {
        self.descriptors.values().cloned().collect()
    }

    /// 保存规则时校验节点配置: JSON Schema + 强类型解析
    pub fn validate_config(
        &self,
        type_name: &str,
        config: &Map<String, Value>,
    ) -> Result<(), RuleError> {
        if !self.contains(type_name) {
            return Err(RuleError::UnknownNodeType(type_name.to_string()));
        }

        if let Some(descriptor) = self.descriptors.get(type_name) {
            let validator = jsonschema::validator_for(&descriptor.config_schema).map_err(|e| {
                RuleError::ConfigError(format!("{} 的配置 schema 无效: {}", type_name, e))
            })?;
            let instance = Value::Object(config.clone());
            let errors: Vec<String> = validator
                .iter_errors(&instance)
                .map(|e| e.to_string())
                .collect();
            if !errors.is_empty() {
                return Err(RuleError::ConfigError(format!(
                    "{}: {}",
                    type_name,
                    errors.join("; ")
                )));
            }
        }

        self.create(type_name, config).map(|_| ())
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.list_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeCategory;
    use serde_json::json;

    #[derive(Debug)]
    struct PassNode;

    #[async_trait]
    impl NodeHandler for PassNode {
        async fn execute(
            &self,
            _ctx: &NodeContext<'_>,
            msg: &Message,
        ) -> Result<NodeOutcome, RuleError> {
            Ok(NodeOutcome::Single(msg.clone()))
        }
    }

    fn pass_factory() -> NodeFactory {
        Arc::new(|_config: &Map<String, Value>| Ok(Arc::new(PassNode) as Arc<dyn NodeHandler>))
    }

    fn descriptor(schema: Value) -> NodeDescriptor {
        NodeDescriptor {
            type_name: "pass".to_string(),
            name: "Pass".to_string(),
            description: "passes messages through".to_string(),
            category: NodeCategory::Transform,
            config_schema: schema,
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.create("nope", &Map::new()),
            Err(RuleError::UnknownNodeType(t)) if t == "nope"
        ));
    }

    #[test]
    fn test_list_types_is_ordered() {
        let mut registry = NodeRegistry::new();
        registry.register("zeta", pass_factory());
        registry.register("alpha", pass_factory());
        let types: Vec<String> = registry.list_types().into_iter().collect();
        assert_eq!(types, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_reregistration_overwrites() {
        let mut registry = NodeRegistry::new();
        registry.register("pass", pass_factory());
        registry.register(
            "pass",
            Arc::new(|_config: &Map<String, Value>| {
                Err(RuleError::ConfigError("replaced".to_string()))
            }),
        );
        assert_eq!(registry.list_types().len(), 1);
        assert!(matches!(
            registry.create("pass", &Map::new()),
            Err(RuleError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_config_against_schema() {
        let mut registry = NodeRegistry::new();
        registry.register_with_descriptor(
            descriptor(json!({
                "type": "object",
                "required": ["field"],
                "properties": { "field": { "type": "string" } }
            })),
            pass_factory(),
        );

        let good = json!({"field": "temperature"}).as_object().cloned().unwrap();
        let bad = json!({"field": 3}).as_object().cloned().unwrap();

        assert!(registry.validate_config("pass", &good).is_ok());
        assert!(matches!(
            registry.validate_config("pass", &bad),
            Err(RuleError::ConfigError(_))
        ));
        assert!(matches!(
            registry.validate_config("other", &good),
            Err(RuleError::UnknownNodeType(_))
        ));
    }
}
