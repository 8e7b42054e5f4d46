//! 富化节点
//!
//! 读取外部存储并把结果合并到消息。缺少资产 id 或存储出错时记录告警,
//! 原样返回输入消息。

use super::{asset_id_of, descriptor};
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

/// 富化结果写入位置
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichTarget {
    Data,
    #[default]
    Metadata,
}

impl EnrichTarget {
    fn apply(self, msg: &Message, values: Map<String, Value>, prefix: Option<&str>) -> Message {
        let entries = values.into_iter().map(|(k, v)| match prefix {
            Some(prefix) => (format!("{}{}", prefix, k), v),
            None => (k, v),
        });
        match self {
            EnrichTarget::Data => msg.merge_data(entries),
            EnrichTarget::Metadata => msg.merge_metadata(entries),
        }
    }
}

fn unchanged(msg: &Message) -> Result<NodeOutcome, RuleError> {
    Ok(NodeOutcome::Single(msg.clone()))
}

fn default_asset_field() -> String {
    "assetId".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
    /// 不配置时读取全部键
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub target: EnrichTarget,
    #[serde(default)]
    pub prefix: Option<String>,
}

fn fetch_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "assetIdField": { "type": "string" },
            "keys": { "type": "array", "items": { "type": "string" } },
            "target": { "enum": ["data", "metadata"] },
            "prefix": { "type": "string" }
        }
    })
}

/// 读取资产属性
#[derive(Debug)]
pub struct FetchAssetAttributes {
    config: FetchConfig,
}

#[async_trait]
impl NodeHandler for FetchAssetAttributes {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = asset_id_of(msg, &self.config.asset_id_field) else {
            warn!("No asset id in {}, enrichment skipped", self.config.asset_id_field);
            return unchanged(msg);
        };

        match ctx
            .collaborators()
            .twin
            .get_attributes(asset_id, self.config.keys.as_deref())
            .await
        {
            Ok(attributes) => Ok(NodeOutcome::Single(self.config.target.apply(
                msg,
                attributes,
                self.config.prefix.as_deref(),
            ))),
            Err(e) => {
                warn!("Failed to fetch attributes of {}: {:#}", asset_id, e);
                unchanged(msg)
            }
        }
    }
}

impl NodeKind for FetchAssetAttributes {
    const TYPE: &'static str = "fetch-asset-attributes";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "读取资产属性",
            "从孪生存储读取资产属性并合并到消息",
            NodeCategory::Enrichment,
            fetch_schema(),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

/// 读取资产最新遥测
#[derive(Debug)]
pub struct FetchAssetTelemetry {
    config: FetchConfig,
}

#[async_trait]
impl NodeHandler for FetchAssetTelemetry {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = asset_id_of(msg, &self.config.asset_id_field) else {
            warn!("No asset id in {}, enrichment skipped", self.config.asset_id_field);
            return unchanged(msg);
        };

        match ctx
            .collaborators()
            .twin
            .get_latest_telemetry(asset_id, self.config.keys.as_deref())
            .await
        {
            Ok(telemetry) => Ok(NodeOutcome::Single(self.config.target.apply(
                msg,
                telemetry,
                self.config.prefix.as_deref(),
            ))),
            Err(e) => {
                warn!("Failed to fetch telemetry of {}: {:#}", asset_id, e);
                unchanged(msg)
            }
        }
    }
}

impl NodeKind for FetchAssetTelemetry {
    const TYPE: &'static str = "fetch-asset-telemetry";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "读取最新遥测",
            "从孪生存储读取资产最新遥测并合并到消息",
            NodeCategory::Enrichment,
            fetch_schema(),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

fn default_related_field() -> String {
    "relatedAssets".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedAssetsConfig {
    #[serde(default = "default_asset_field")]
    pub asset_id_field: String,
    pub relation_type: String,
    #[serde(default = "default_related_field")]
    pub result_field: String,
    #[serde(default)]
    pub target: EnrichTarget,
}

/// 读取关联资产 id 列表
#[derive(Debug)]
pub struct FetchRelatedAssets {
    config: RelatedAssetsConfig,
}

#[async_trait]
impl NodeHandler for FetchRelatedAssets {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(asset_id) = asset_id_of(msg, &self.config.asset_id_field) else {
            warn!("No asset id in {}, enrichment skipped", self.config.asset_id_field);
            return unchanged(msg);
        };

        match ctx
            .collaborators()
            .directory
            .related_assets(asset_id, &self.config.relation_type)
            .await
        {
            Ok(related) => {
                let mut values = Map::new();
                values.insert(self.config.result_field.clone(), json!(related));
                Ok(NodeOutcome::Single(self.config.target.apply(msg, values, None)))
            }
            Err(e) => {
                warn!("Failed to fetch related assets of {}: {:#}", asset_id, e);
                unchanged(msg)
            }
        }
    }
}

impl NodeKind for FetchRelatedAssets {
    const TYPE: &'static str = "fetch-related-assets";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "读取关联资产",
            "按关系类型查询关联资产 id",
            NodeCategory::Enrichment,
            json!({
                "type": "object",
                "required": ["relationType"],
                "properties": {
                    "assetIdField": { "type": "string" },
                    "relationType": { "type": "string" },
                    "resultField": { "type": "string" },
                    "target": { "enum": ["data", "metadata"] }
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

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantAttributesConfig {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub target: EnrichTarget,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// 读取租户属性,租户取自执行上下文
#[derive(Debug)]
pub struct TenantAttributes {
    config: TenantAttributesConfig,
}

#[async_trait]
impl NodeHandler for TenantAttributes {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        match ctx
            .collaborators()
            .directory
            .tenant_attributes(ctx.tenant_id, self.config.keys.as_deref())
            .await
        {
            Ok(attributes) => Ok(NodeOutcome::Single(self.config.target.apply(
                msg,
                attributes,
                self.config.prefix.as_deref(),
            ))),
            Err(e) => {
                warn!("Failed to fetch tenant attributes of {}: {:#}", ctx.tenant_id, e);
                unchanged(msg)
            }
        }
    }
}

impl NodeKind for TenantAttributes {
    const TYPE: &'static str = "tenant-attributes";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "读取租户属性",
            "读取当前租户的属性并合并到消息",
            NodeCategory::Enrichment,
            json!({
                "type": "object",
                "properties": {
                    "keys": { "type": "array", "items": { "type": "string" } },
                    "target": { "enum": ["data", "metadata"] },
                    "prefix": { "type": "string" }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::{msg, single, Harness};
    use pretty_assertions::assert_eq;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_fetch_attributes_into_metadata() {
        let harness = Harness::new();
        harness
            .backends
            .twin
            .set_attributes("pump-1", map(json!({"model": "X200", "maxRpm": 3000})))
            .await;

        let out = single(
            harness
                .run::<FetchAssetAttributes>(
                    json!({"keys": ["model"], "prefix": "attr_"}),
                    &msg(json!({"assetId": "pump-1"})),
                )
                .await
                .unwrap(),
        );
        assert_eq!(out.metadata["attr_model"], json!("X200"));
        assert!(!out.metadata.contains_key("attr_maxRpm"));
    }

    #[tokio::test]
    async fn test_fetch_telemetry_into_data() {
        let harness = Harness::new();
        harness
            .backends
            .twin
            .set_telemetry("pump-1", map(json!({"rpm": 1200})))
            .await;

        let out = single(
            harness
                .run::<FetchAssetTelemetry>(
                    json!({"target": "data", "assetIdField": "device"}),
                    &msg(json!({"device": "pump-1"})),
                )
                .await
                .unwrap(),
        );
        assert_eq!(out.data["rpm"], json!(1200));
    }

    #[tokio::test]
    async fn test_store_failure_returns_input_unchanged() {
        let harness = Harness::new();
        harness.backends.twin.fail.set_failing(true);
        let input = msg(json!({"assetId": "pump-1"}));

        let out = single(
            harness
                .run::<FetchAssetAttributes>(json!({}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_missing_asset_id_returns_input_unchanged() {
        let harness = Harness::new();
        let input = msg(json!({"temperature": 10}));
        let out = single(
            harness
                .run::<FetchAssetTelemetry>(json!({}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_related_and_tenant_attributes() {
        use crate::collaborators::AssetDirectory;
        let harness = Harness::new();
        let directory = &harness.backends.directory;
        directory.create_relation("site-1", "pump-1", "Contains").await.unwrap();
        directory.create_relation("site-1", "pump-2", "Contains").await.unwrap();
        directory
            .set_tenant_attributes("t1", map(json!({"region": "eu"})))
            .await;

        let related = single(
            harness
                .run::<FetchRelatedAssets>(
                    json!({"relationType": "Contains"}),
                    &msg(json!({"assetId": "site-1"})),
                )
                .await
                .unwrap(),
        );
        assert_eq!(related.metadata["relatedAssets"], json!(["pump-1", "pump-2"]));

        let tenant = single(
            harness
                .run::<TenantAttributes>(json!({}), &msg(json!({})))
                .await
                .unwrap(),
        );
        assert_eq!(tenant.metadata["region"], json!("eu"));
    }
}
