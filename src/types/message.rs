use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 消息路由键,由分支类节点写入 metadata,图遍历时消费
pub const OUTPUT_ROUTE: &str = "outputRoute";
/// 旧版分支键,与 `OUTPUT_ROUTE` 等价
pub const SWITCH_OUTPUT: &str = "switchOutput";

/// 在规则图中流转的消息
///
/// 节点从不修改输入消息,而是基于输入派生新消息;
/// 因此扇出时多个分支可以共享同一条输入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub msg_type: String,
    /// 业务数据(遥测值、资产 id 等)
    #[serde(default)]
    pub data: Map<String, Value>,
    /// 执行面信息(路由、检查点、确认标记)
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: i64,
}

impl Message {
    pub fn new(msg_type: &str, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type: msg_type.to_string(),
            data,
            metadata: Map::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 从任意 JSON 构造消息,非对象值放入 `value` 键
    pub fn from_value(msg_type: &str, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(msg_type, data)
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// 派生新消息,浅合并 `entries` 到 data
    pub fn merge_data<I>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut derived = self.clone();
        derived.data.extend(entries);
        derived
    }

    /// 派生新消息,浅合并 `entries` 到 metadata
    pub fn merge_metadata<I>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut derived = self.clone();
        derived.metadata.extend(entries);
        derived
    }

    /// 派生新消息并写入单个 metadata 键
    pub fn annotate(&self, key: &str, value: Value) -> Self {
        self.merge_metadata([(key.to_string(), value)])
    }

    /// 派生新消息并设置输出路由
    pub fn route_to(&self, route: &str) -> Self {
        self.annotate(OUTPUT_ROUTE, Value::String(route.to_string()))
    }

    /// 读取分支节点写入的路由名称
    pub fn output_route(&self) -> Option<String> {
        [OUTPUT_ROUTE, SWITCH_OUTPUT]
            .iter()
            .find_map(|key| self.metadata.get(*key))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    /// 移除路由键,返回被移除的路由
    pub(crate) fn take_route(&mut self) -> Option<String> {
        let route = self.output_route();
        self.metadata.remove(OUTPUT_ROUTE);
        self.metadata.remove(SWITCH_OUTPUT);
        route
    }

    /// 资产标识,兼容 `assetId` / `thingId`
    pub fn asset_id(&self) -> Option<&str> {
        ["assetId", "thingId"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(Value::as_str))
    }
}
