mod context;
mod descriptor;
mod error;
mod execution;
mod message;
mod node;

pub use context::*;
pub use descriptor::*;
pub use error::*;
pub use execution::*;
pub use message::*;
pub use node::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 规则定义: 租户自定义的节点有向无环图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    /// 为空表示匹配所有资产类型
    #[serde(default)]
    pub applies_to_asset_types: Vec<String>,
    #[serde(default)]
    pub applies_to_assets: Option<Vec<String>>,
    /// 为空表示匹配所有触发类型
    #[serde(default)]
    pub trigger_types: Vec<TriggerType>,
    pub nodes: Vec<RuleNode>,
    #[serde(default)]
    pub connections: Vec<RuleConnection>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub config: RuleConfig,
}

impl Rule {
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        Ok(serde_json::from_str(json)?)
    }

    /// 从 JSON 文件加载规则定义
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuleError::ConfigError(format!("读取规则文件失败 {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// 资产类型 / 资产 id / 触发类型是否匹配
    pub fn applies_to(
        &self,
        asset_type: Option<&str>,
        asset_id: Option<&str>,
        trigger: &TriggerType,
    ) -> bool {
        let type_ok = self.applies_to_asset_types.is_empty()
            || asset_type.is_some_and(|t| self.applies_to_asset_types.iter().any(|a| a == t));

        let asset_ok = match &self.applies_to_assets {
            Some(assets) if !assets.is_empty() => {
                asset_id.is_some_and(|id| assets.iter().any(|a| a == id))
            }
            _ => true,
        };

        let trigger_ok = self.trigger_types.is_empty() || self.trigger_types.contains(trigger);

        type_ok && asset_ok && trigger_ok
    }
}

/// 规则状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleStatus {
    #[default]
    Draft,
    Active,
    Inactive,
    Error,
}

/// 规则执行策略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfig {
    pub execute_on_startup: bool,
    /// 0 表示不防抖
    pub debounce_ms: u64,
    /// 0 表示不限流
    pub max_executions_per_minute: u32,
    /// 0 表示使用引擎默认超时
    pub timeout_ms: u64,
}

/// 触发类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerType {
    Telemetry,
    Attributes,
    Alarm,
    Manual,
    Startup,
}

impl TriggerType {
    /// 将入站事件的 messageType 映射为触发类型
    pub fn from_message_type(message_type: &str) -> Self {
        match message_type.to_ascii_lowercase().as_str() {
            "attributes" | "attribute" | "attributes_updated" => TriggerType::Attributes,
            "alarm" | "alarm_status" => TriggerType::Alarm,
            "manual" => TriggerType::Manual,
            "startup" => TriggerType::Startup,
            _ => TriggerType::Telemetry,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Telemetry => "TELEMETRY",
            TriggerType::Attributes => "ATTRIBUTES",
            TriggerType::Alarm => "ALARM",
            TriggerType::Manual => "MANUAL",
            TriggerType::Startup => "STARTUP",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: serde_json::Value) -> Rule {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rule_defaults() {
        let rule = rule(json!({
            "id": "3f2504e0-4f89-11d3-9a0c-0305e82c3301",
            "tenantId": "t1",
            "name": "empty",
            "nodes": []
        }));
        assert_eq!(rule.status, RuleStatus::Draft);
        assert_eq!(rule.config.debounce_ms, 0);
        assert!(rule.connections.is_empty());
    }

    #[test]
    fn test_applies_to_matching() {
        let rule = rule(json!({
            "id": "3f2504e0-4f89-11d3-9a0c-0305e82c3301",
            "tenantId": "t1",
            "name": "pumps",
            "appliesToAssetTypes": ["pump"],
            "appliesToAssets": ["pump-1"],
            "triggerTypes": ["TELEMETRY"],
            "nodes": [],
            "status": "ACTIVE"
        }));

        assert!(rule.applies_to(Some("pump"), Some("pump-1"), &TriggerType::Telemetry));
        assert!(!rule.applies_to(Some("pump"), Some("pump-2"), &TriggerType::Telemetry));
        assert!(!rule.applies_to(Some("valve"), Some("pump-1"), &TriggerType::Telemetry));
        assert!(!rule.applies_to(Some("pump"), Some("pump-1"), &TriggerType::Alarm));
        assert!(!rule.applies_to(None, Some("pump-1"), &TriggerType::Telemetry));
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let rule = rule(json!({
            "id": "3f2504e0-4f89-11d3-9a0c-0305e82c3301",
            "tenantId": "t1",
            "name": "all",
            "nodes": []
        }));
        assert!(rule.applies_to(None, None, &TriggerType::Manual));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id": "3f2504e0-4f89-11d3-9a0c-0305e82c3301", "tenantId": "t1", "name": "f", "nodes": []}}"#
        )
        .unwrap();
        assert_eq!(Rule::from_file(file.path()).unwrap().name, "f");

        assert!(matches!(
            Rule::from_file("/nonexistent/rule.json"),
            Err(RuleError::ConfigError(_))
        ));
        assert!(matches!(Rule::from_json("{"), Err(RuleError::Serialization(_))));
    }

    #[test]
    fn test_trigger_type_mapping() {
        assert_eq!(TriggerType::from_message_type("ALARM"), TriggerType::Alarm);
        assert_eq!(
            TriggerType::from_message_type("attributes"),
            TriggerType::Attributes
        );
        assert_eq!(TriggerType::from_message_type("whatever"), TriggerType::Telemetry);
    }
}
