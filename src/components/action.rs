//! 动作节点
//!
//! 每个动作对一个外部协作者产生一次副作用,并在输出消息的 metadata 中写入标记。
//! 外部调用失败返回 [`RuleError::Collaborator`],整次执行记为失败。

use super::{asset_id_of, descriptor, field_str, field_value};
use crate::collaborators::Alarm;
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use crate::utils::render_template;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

fn default_asset_field() -> String {
    "assetId".to_string()
}

/// 缺少目标资产时丢弃消息
fn target_asset<'m>(ctx: &NodeContext<'_>, msg: &'m Message, field: &str) -> Option<&'m str> {
    let asset_id = asset_id_of(msg, field);
    if asset_id.is_none() {
        warn!("{}: no asset id in {}, message dropped", ctx.node_id(), field);
    }
    asset_id
}

fn marked<I>(msg: &Message, entries: I) -> NodeOutcome
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    NodeOutcome::Single(msg.merge_metadata(entries.into_iter().map(|(k, v)| (k.to_string(), v))))
}

fn failed(ctx: &NodeContext<'_>, e: anyhow::Error) -> RuleError {
    RuleError::collaborator(ctx.node_id(), e)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlarmConfig {
    pub alarm_type: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
    /// 写入告警详情的字段,不配置时使用整个 data
    #[serde(default)]
    pub details_fields: Option<Vec<String>>,
}

fn default_severity() -> String {
    "CRITICAL".to_string()
}

#[derive(Debug)]
pub struct CreateAlarm {
    config: CreateAlarmConfig,
}

#[async_trait]
impl NodeHandler for CreateAlarm {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };

        let details = match &self.config.details_fields {
            Some(fields) => fields
                .iter()
                .filter_map(|f| field_value(msg, f).map(|v| (f.clone(), v.clone())))
                .collect::<Map<String, Value>>(),
            None => msg.data.clone(),
        };

        let alarm_id = ctx
            .collaborators()
            .alarms
            .create_alarm(Alarm {
                asset_id: asset_id.to_string(),
                alarm_type: self.config.alarm_type.clone(),
                severity: self.config.severity.clone(),
                details: Value::Object(details),
            })
            .await
            .map_err(|e| failed(ctx, e))?;

        info!("Alarm {} ({}) created for {}", alarm_id, self.config.alarm_type, asset_id);
        Ok(marked(
            msg,
            [
                ("alarmCreated", Value::Bool(true)),
                ("alarmId", Value::String(alarm_id)),
                ("alarmType", json!(self.config.alarm_type)),
            ],
        ))
    }
}

impl NodeKind for CreateAlarm {
    const TYPE: &'static str = "create-alarm";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "创建告警",
            "为资产创建告警",
            NodeCategory::Action,
            json!({
                "type": "object",
                "required": ["alarmType"],
                "properties": {
                    "alarmType": { "type": "string" },
                    "severity": { "enum": ["CRITICAL", "MAJOR", "MINOR", "WARNING", "INDETERMINATE"] },
                    "assetIdField": { "type": "string" },
                    "detailsFields": { "type": "array", "items": { "type": "string" } }
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
#[serde(rename_all = "camelCase")]
pub struct ClearAlarmConfig {
    pub alarm_type: String,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

#[derive(Debug)]
pub struct ClearAlarm {
    config: ClearAlarmConfig,
}

#[async_trait]
impl NodeHandler for ClearAlarm {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };

        let existed = ctx
            .collaborators()
            .alarms
            .clear_alarm(asset_id, &self.config.alarm_type)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(
            msg,
            [
                ("alarmCleared", Value::Bool(true)),
                ("alarmExisted", Value::Bool(existed)),
            ],
        ))
    }
}

impl NodeKind for ClearAlarm {
    const TYPE: &'static str = "clear-alarm";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "清除告警",
            "清除资产上指定类型的活动告警",
            NodeCategory::Action,
            json!({
                "type": "object",
                "required": ["alarmType"],
                "properties": {
                    "alarmType": { "type": "string" },
                    "assetIdField": { "type": "string" }
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
#[serde(rename_all = "camelCase")]
pub struct SetStatusConfig {
    pub status: String,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

#[derive(Debug)]
pub struct SetStatus {
    config: SetStatusConfig,
}

#[async_trait]
impl NodeHandler for SetStatus {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .directory
            .set_status(asset_id, &self.config.status)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(
            msg,
            [
                ("statusUpdated", Value::Bool(true)),
                ("status", json!(self.config.status)),
            ],
        ))
    }
}

impl NodeKind for SetStatus {
    const TYPE: &'static str = "set-status";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "设置状态",
            "更新资产状态",
            NodeCategory::Action,
            json!({
                "type": "object",
                "required": ["status"],
                "properties": {
                    "status": { "type": "string" },
                    "assetIdField": { "type": "string" }
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
#[serde(rename_all = "camelCase")]
pub struct UpdateTwinFeatureConfig {
    pub feature: String,
    pub property: String,
    /// 写入值所在字段
    pub value_field: String,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

/// 更新孪生 feature 属性
#[derive(Debug)]
pub struct UpdateTwinFeature {
    config: UpdateTwinFeatureConfig,
}

#[async_trait]
impl NodeHandler for UpdateTwinFeature {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };
        let Some(value) = field_value(msg, &self.config.value_field) else {
            warn!("Value field {} missing, message dropped", self.config.value_field);
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .twin
            .update_feature_property(
                asset_id,
                &self.config.feature,
                &self.config.property,
                value.clone(),
            )
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(msg, [("twinUpdated", Value::Bool(true))]))
    }
}

impl NodeKind for UpdateTwinFeature {
    const TYPE: &'static str = "update-twin-feature";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "更新孪生属性",
            "将字段值写入数字孪生的 feature 属性",
            NodeCategory::Action,
            json!({
                "type": "object",
                "required": ["feature", "property", "valueField"],
                "properties": {
                    "feature": { "type": "string" },
                    "property": { "type": "string" },
                    "valueField": { "type": "string" },
                    "assetIdField": { "type": "string" }
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
#[serde(rename_all = "camelCase")]
pub struct DeleteAttributesConfig {
    pub keys: Vec<String>,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

#[derive(Debug)]
pub struct DeleteAttributes {
    config: DeleteAttributesConfig,
}

#[async_trait]
impl NodeHandler for DeleteAttributes {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .twin
            .delete_attributes(asset_id, &self.config.keys)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(msg, [("attributesDeleted", Value::Bool(true))]))
    }
}

impl NodeKind for DeleteAttributes {
    const TYPE: &'static str = "delete-attributes";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "删除属性",
            "删除资产的指定属性",
            NodeCategory::Action,
            json!({
                "type": "object",
                "required": ["keys"],
                "properties": {
                    "keys": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                    "assetIdField": { "type": "string" }
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

/// 发布内容
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishPayload {
    /// 仅 data
    #[default]
    Data,
    /// 完整消息
    Message,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishConfig {
    /// 主题模板,支持 `${...}` 变量
    pub topic: String,
    #[serde(default)]
    pub key_field: Option<String>,
    #[serde(default)]
    pub payload: PublishPayload,
}

/// 发布到消息总线
#[derive(Debug)]
pub struct PublishNode {
    config: PublishConfig,
}

#[async_trait]
impl NodeHandler for PublishNode {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let topic = render_template(&self.config.topic, msg);
        let key = self
            .config
            .key_field
            .as_deref()
            .and_then(|field| field_str(msg, field));
        let payload = match self.config.payload {
            PublishPayload::Data => Value::Object(msg.data.clone()),
            PublishPayload::Message => serde_json::to_value(msg)?,
        };

        ctx.collaborators()
            .bus
            .publish(&topic, key, payload)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(
            msg,
            [
                ("published", Value::Bool(true)),
                ("publishedTopic", Value::String(topic)),
            ],
        ))
    }
}

impl NodeKind for PublishNode {
    const TYPE: &'static str = "publish";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "发布消息",
            "将消息发布到消息总线主题",
            NodeCategory::Action,
            json!({
                "type": "object",
                "required": ["topic"],
                "properties": {
                    "topic": { "type": "string", "minLength": 1 },
                    "keyField": { "type": "string" },
                    "payload": { "enum": ["data", "message"] }
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
#[serde(rename_all = "camelCase")]
pub struct SaveTimeseriesConfig {
    /// 不配置时保存 data 中除资产标识外的所有字段
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

#[derive(Debug)]
pub struct SaveTimeseries {
    config: SaveTimeseriesConfig,
}

#[async_trait]
impl NodeHandler for SaveTimeseries {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };

        let values: Map<String, Value> = match &self.config.keys {
            Some(keys) => keys
                .iter()
                .filter_map(|k| field_value(msg, k).map(|v| (k.clone(), v.clone())))
                .collect(),
            None => msg
                .data
                .iter()
                .filter(|(k, _)| {
                    !matches!(
                        k.as_str(),
                        "assetId" | "thingId" | "entityType" | "alarmStatus"
                    )
                        && k.as_str() != self.config.asset_id_field
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        if values.is_empty() {
            warn!("Nothing to save for {}, message dropped", asset_id);
            return Ok(NodeOutcome::None);
        }

        ctx.collaborators()
            .timeseries
            .save(asset_id, msg.timestamp, values)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(msg, [("timeseriesSaved", Value::Bool(true))]))
    }
}

impl NodeKind for SaveTimeseries {
    const TYPE: &'static str = "save-timeseries";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "保存时序数据",
            "把消息中的遥测值写入时序存储",
            NodeCategory::Action,
            json!({
                "type": "object",
                "properties": {
                    "keys": { "type": "array", "items": { "type": "string" } },
                    "assetIdField": { "type": "string" }
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
#[serde(rename_all = "camelCase")]
pub struct AssignCustomerConfig {
    /// 固定客户 id
    #[serde(default)]
    pub customer_id: Option<String>,
    /// 或从字段读取
    #[serde(default)]
    pub customer_id_field: Option<String>,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

#[derive(Debug)]
pub struct AssignCustomer {
    config: AssignCustomerConfig,
}

#[async_trait]
impl NodeHandler for AssignCustomer {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };
        let customer_id = self.config.customer_id.as_deref().or_else(|| {
            self.config
                .customer_id_field
                .as_deref()
                .and_then(|field| field_str(msg, field))
        });
        let Some(customer_id) = customer_id else {
            warn!("No customer id for {}, message dropped", asset_id);
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .directory
            .assign_customer(asset_id, customer_id)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(
            msg,
            [
                ("customerAssigned", Value::Bool(true)),
                ("customerId", json!(customer_id)),
            ],
        ))
    }
}

impl NodeKind for AssignCustomer {
    const TYPE: &'static str = "assign-customer";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "分配客户",
            "将资产分配给客户",
            NodeCategory::Action,
            json!({
                "type": "object",
                "anyOf": [
                    { "required": ["customerId"] },
                    { "required": ["customerIdField"] }
                ],
                "properties": {
                    "customerId": { "type": "string" },
                    "customerIdField": { "type": "string" },
                    "assetIdField": { "type": "string" }
                }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        let config: AssignCustomerConfig = parse_config(Self::TYPE, config)?;
        if config.customer_id.is_none() && config.customer_id_field.is_none() {
            return Err(RuleError::ConfigError(format!(
                "{}: 需要 customerId 或 customerIdField",
                Self::TYPE
            )));
        }
        Ok(Self { config })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnassignCustomerConfig {
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

#[derive(Debug)]
pub struct UnassignCustomer {
    config: UnassignCustomerConfig,
}

#[async_trait]
impl NodeHandler for UnassignCustomer {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = target_asset(ctx, msg, &self.config.asset_id_field) else {
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .directory
            .unassign_customer(asset_id)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(msg, [("customerUnassigned", Value::Bool(true))]))
    }
}

impl NodeKind for UnassignCustomer {
    const TYPE: &'static str = "unassign-customer";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "取消分配客户",
            "解除资产与客户的关联",
            NodeCategory::Action,
            json!({
                "type": "object",
                "properties": { "assetIdField": { "type": "string" } }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

/// 关系方向,相对消息资产
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationDirection {
    /// 消息资产 -> 目标
    #[default]
    From,
    /// 目标 -> 消息资产
    To,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationConfig {
    pub relation_type: String,
    /// 关系另一端所在字段
    pub target_field: String,
    #[serde(default)]
    pub direction: RelationDirection,
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
}

impl RelationConfig {
    /// 解析 (from, to),缺少任一端返回 None
    fn endpoints<'m>(&self, ctx: &NodeContext<'_>, msg: &'m Message) -> Option<(&'m str, &'m str)> {
        let asset_id = target_asset(ctx, msg, &self.asset_id_field)?;
        let Some(target) = field_str(msg, &self.target_field) else {
            warn!("Relation target {} missing, message dropped", self.target_field);
            return None;
        };
        Some(match self.direction {
            RelationDirection::From => (asset_id, target),
            RelationDirection::To => (target, asset_id),
        })
    }
}

fn relation_schema() -> Value {
    json!({
        "type": "object",
        "required": ["relationType", "targetField"],
        "properties": {
            "relationType": { "type": "string" },
            "targetField": { "type": "string" },
            "direction": { "enum": ["from", "to"] },
            "assetIdField": { "type": "string" }
        }
    })
}

#[derive(Debug)]
pub struct CreateRelation {
    config: RelationConfig,
}

#[async_trait]
impl NodeHandler for CreateRelation {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some((from, to)) = self.config.endpoints(ctx, msg) else {
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .directory
            .create_relation(from, to, &self.config.relation_type)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(msg, [("relationCreated", Value::Bool(true))]))
    }
}

impl NodeKind for CreateRelation {
    const TYPE: &'static str = "create-relation";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "创建关系",
            "在资产之间创建关系",
            NodeCategory::Action,
            relation_schema(),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

#[derive(Debug)]
pub struct DeleteRelation {
    config: RelationConfig,
}

#[async_trait]
impl NodeHandler for DeleteRelation {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some((from, to)) = self.config.endpoints(ctx, msg) else {
            return Ok(NodeOutcome::None);
        };

        ctx.collaborators()
            .directory
            .delete_relation(from, to, &self.config.relation_type)
            .await
            .map_err(|e| failed(ctx, e))?;

        Ok(marked(msg, [("relationDeleted", Value::Bool(true))]))
    }
}

impl NodeKind for DeleteRelation {
    const TYPE: &'static str = "delete-relation";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "删除关系",
            "删除资产之间的关系",
            NodeCategory::Action,
            relation_schema(),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::{msg, single, Harness};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_and_clear_alarm() {
        let harness = Harness::new();
        let input = msg(json!({"assetId": "pump-1", "temperature": 91, "label": "north"}));

        let created = single(
            harness
                .run::<CreateAlarm>(
                    json!({"alarmType": "HighTemperature", "detailsFields": ["temperature"]}),
                    &input,
                )
                .await
                .unwrap(),
        );
        assert_eq!(created.metadata["alarmCreated"], json!(true));

        let alarms = harness.backends.alarms.alarms().await;
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].alarm.severity, "CRITICAL");
        assert_eq!(alarms[0].alarm.details, json!({"temperature": 91}));
        assert_eq!(created.metadata["alarmId"], json!(alarms[0].id));

        let cleared = single(
            harness
                .run::<ClearAlarm>(json!({"alarmType": "HighTemperature"}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(cleared.metadata["alarmExisted"], json!(true));
        assert!(harness.backends.alarms.alarms().await[0].cleared);
    }

    #[tokio::test]
    async fn test_collaborator_failure_is_fatal() {
        let harness = Harness::new();
        harness.backends.alarms.fail.set_failing(true);

        let err = harness
            .run::<CreateAlarm>(json!({"alarmType": "X"}), &msg(json!({"assetId": "pump-1"})))
            .await
            .unwrap_err();
        assert!(err.is_execution_fatal());
    }

    #[tokio::test]
    async fn test_missing_asset_drops_without_side_effect() {
        let harness = Harness::new();
        let outcome = harness
            .run::<SetStatus>(json!({"status": "OFFLINE"}), &msg(json!({"v": 1})))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(harness.backends.directory.status("pump-1").await, None);
    }

    #[tokio::test]
    async fn test_update_twin_feature() {
        let harness = Harness::new();
        let out = single(
            harness
                .run::<UpdateTwinFeature>(
                    json!({"feature": "motor", "property": "rpm", "valueField": "rpm"}),
                    &msg(json!({"thingId": "pump-1", "rpm": 1450})),
                )
                .await
                .unwrap(),
        );
        assert_eq!(out.metadata["twinUpdated"], json!(true));
        assert_eq!(
            harness
                .backends
                .twin
                .feature_property("pump-1", "motor", "rpm")
                .await,
            Some(json!(1450))
        );
    }

    #[tokio::test]
    async fn test_publish_renders_topic() {
        let harness = Harness::new();
        single(
            harness
                .run::<PublishNode>(
                    json!({"topic": "alerts/${assetId}", "keyField": "assetId"}),
                    &msg(json!({"assetId": "pump-1", "v": 2})),
                )
                .await
                .unwrap(),
        );

        let published = harness.backends.bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "alerts/pump-1");
        assert_eq!(published[0].key.as_deref(), Some("pump-1"));
        assert_eq!(published[0].payload["v"], json!(2));
    }

    #[tokio::test]
    async fn test_save_timeseries_excludes_identifiers() {
        let harness = Harness::new();
        let input = msg(json!({"assetId": "pump-1", "rpm": 1450, "temp": 40}));
        single(harness.run::<SaveTimeseries>(json!({}), &input).await.unwrap());

        let points = harness.backends.timeseries.points().await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, input.timestamp);
        assert_eq!(Value::Object(points[0].values.clone()), json!({"rpm": 1450, "temp": 40}));
    }

    #[tokio::test]
    async fn test_customer_assignment() {
        let harness = Harness::new();
        let input = msg(json!({"assetId": "pump-1", "owner": "c-7"}));

        single(
            harness
                .run::<AssignCustomer>(json!({"customerIdField": "owner"}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(
            harness.backends.directory.customer("pump-1").await.as_deref(),
            Some("c-7")
        );

        single(harness.run::<UnassignCustomer>(json!({}), &input).await.unwrap());
        assert_eq!(harness.backends.directory.customer("pump-1").await, None);

        let config = json!({}).as_object().cloned().unwrap();
        assert!(AssignCustomer::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_relations_and_attribute_deletion() {
        let harness = Harness::new();
        let input = msg(json!({"assetId": "pump-1", "site": "site-1"}));
        let relation = json!({"relationType": "Contains", "targetField": "site", "direction": "to"});

        single(harness.run::<CreateRelation>(relation.clone(), &input).await.unwrap());
        let relations = harness.backends.directory.relations().await;
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].from, "site-1");
        assert_eq!(relations[0].to, "pump-1");

        single(harness.run::<DeleteRelation>(relation, &input).await.unwrap());
        assert!(harness.backends.directory.relations().await.is_empty());

        harness
            .backends
            .twin
            .set_attributes("pump-1", json!({"a": 1, "b": 2}).as_object().cloned().unwrap())
            .await;
        single(
            harness
                .run::<DeleteAttributes>(json!({"keys": ["a"]}), &input)
                .await
                .unwrap(),
        );
        let thing = harness.backends.twin.thing("pump-1").await.unwrap();
        assert!(!thing.attributes.contains_key("a"));
        assert!(thing.attributes.contains_key("b"));
    }
}
