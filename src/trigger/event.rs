use crate::types::{Message, RuleError, TriggerType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 入站事件
///
/// 路由字段单独解析,其余字段全部视为遥测数据。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// 资产标识,缺省时取 `thingId`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl InboundEvent {
    pub fn new(asset_id: &str, entity_type: Option<&str>, data: Map<String, Value>) -> Self {
        Self {
            asset_id: Some(asset_id.to_string()),
            entity_type: entity_type.map(str::to_string),
            data,
            ..Self::default()
        }
    }

    pub fn from_json(payload: &str) -> Result<Self, RuleError> {
        Self::from_value(serde_json::from_str(payload)?)
    }

    pub fn from_value(value: Value) -> Result<Self, RuleError> {
        let mut event: Self = serde_json::from_value(value)?;
        if event.asset_id.is_none() {
            event.asset_id = event
                .data
                .get("thingId")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(event)
    }

    pub fn with_message_type(mut self, message_type: &str) -> Self {
        self.message_type = Some(message_type.to_string());
        self
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.message_type
            .as_deref()
            .map_or(TriggerType::Telemetry, TriggerType::from_message_type)
    }

    /// 转换为触发消息: 遥测进 data,路由信息进 metadata
    ///
    /// `assetId`、`entityType`、`alarmStatus` 同时写入 data,
    /// 模板与过滤器可以直接按字段名读取。
    pub fn to_message(&self) -> Message {
        let msg_type = self.message_type.as_deref().unwrap_or("telemetry");
        let mut data = self.data.clone();
        for (key, value) in [
            ("assetId", &self.asset_id),
            ("entityType", &self.entity_type),
            ("alarmStatus", &self.alarm_status),
        ] {
            if let Some(value) = value {
                data.entry(key)
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }

        let metadata: Map<String, Value> = [
            ("entityType", &self.entity_type),
            ("alarmStatus", &self.alarm_status),
            ("dataSourceId", &self.data_source_id),
            ("gatewayId", &self.gateway_id),
            ("messageType", &self.message_type),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_ref()
                .map(|v| (key.to_string(), Value::String(v.clone())))
        })
        .collect();

        Message::new(msg_type, data).with_metadata(metadata)
    }
}
