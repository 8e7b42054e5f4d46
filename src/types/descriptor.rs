use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 节点分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Filter,
    Transform,
    Enrichment,
    Action,
    Flow,
}

/// 节点描述符,供配置校验与编辑器组件目录使用
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeDescriptor {
    pub type_name: String,
    pub name: String,
    pub description: String,
    pub category: NodeCategory,
    /// 节点配置的 JSON Schema
    pub config_schema: Value,
}
