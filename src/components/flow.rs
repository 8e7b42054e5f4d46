//! 流程控制节点: 子规则链、按组件扇出、延迟

use super::descriptor;
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleChainConfig {
    pub rule_id: Uuid,
}

/// 子规则链节点: 内联执行另一条规则,以其终端消息继续
#[derive(Debug)]
pub struct RuleChainNode {
    config: RuleChainConfig,
}

#[async_trait]
impl NodeHandler for RuleChainNode {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let outputs = ctx
            .engine
            .run_nested(ctx, self.config.rule_id, msg.clone())
            .await?;
        debug!(
            parent: ctx.span(),
            "Rule chain {} produced {} message(s)",
            self.config.rule_id,
            outputs.len()
        );
        Ok(NodeOutcome::from(outputs))
    }
}

impl NodeKind for RuleChainNode {
    const TYPE: &'static str = "rule-chain";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "子规则链",
            "执行另一条规则并以其输出继续",
            NodeCategory::Flow,
            json!({
                "type": "object",
                "required": ["ruleId"],
                "properties": { "ruleId": { "type": "string", "format": "uuid" } }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        Ok(Self {
            config: parse_config(Self::TYPE, config)?,
        })
    }
}

fn default_mappings_key() -> String {
    "resolvedMappings".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteToComponentsConfig {
    /// metadata 中映射列表的键
    #[serde(default = "default_mappings_key")]
    pub mappings_key: String,
}

/// 已解析的组件映射
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedMapping {
    thing_id: String,
    feature: String,
    property: String,
    #[serde(default)]
    value: Value,
}

/// 按 thingId 分组映射,每个目标输出一条消息
#[derive(Debug)]
pub struct RouteToComponents {
    config: RouteToComponentsConfig,
}

impl RouteToComponents {
    /// 按首次出现顺序分组,返回 (thingId, 原始条目)
    fn group(&self, ctx: &NodeContext<'_>, mappings: &[Value]) -> Vec<(String, Vec<(ResolvedMapping, Value)>)> {
        let mut groups: Vec<(String, Vec<(ResolvedMapping, Value)>)> = Vec::new();
        for raw in mappings {
            let mapping: ResolvedMapping = match serde_json::from_value(raw.clone()) {
                Ok(mapping) => mapping,
                Err(e) => {
                    warn!(parent: ctx.span(), "Skipping malformed mapping {}: {}", raw, e);
                    continue;
                }
            };
            match groups.iter_mut().find(|(id, _)| *id == mapping.thing_id) {
                Some((_, entries)) => entries.push((mapping, raw.clone())),
                None => groups.push((mapping.thing_id.clone(), vec![(mapping, raw.clone())])),
            }
        }
        groups
    }
}

#[async_trait]
impl NodeHandler for RouteToComponents {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let Some(mappings) = msg
            .metadata
            .get(&self.config.mappings_key)
            .and_then(Value::as_array)
        else {
            debug!(parent: ctx.span(), "No {} on message, nothing to route", self.config.mappings_key);
            return Ok(NodeOutcome::None);
        };

        let outputs: Vec<Message> = self
            .group(ctx, mappings)
            .into_iter()
            .map(|(thing_id, entries)| {
                let mut features = Map::new();
                for (mapping, _) in &entries {
                    let properties = features
                        .entry(mapping.feature.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(properties) = properties {
                        properties.insert(mapping.property.clone(), mapping.value.clone());
                    }
                }
                let own: Vec<Value> = entries.into_iter().map(|(_, raw)| raw).collect();

                // 下游动作按 assetId 定位目标,须指向组件而非网关
                msg.merge_data([
                    ("assetId".to_string(), Value::String(thing_id.clone())),
                    ("thingId".to_string(), Value::String(thing_id)),
                    ("features".to_string(), Value::Object(features)),
                ])
                .annotate(&self.config.mappings_key, Value::Array(own))
            })
            .collect();

        Ok(NodeOutcome::from(outputs))
    }
}

impl NodeKind for RouteToComponents {
    const TYPE: &'static str = "route-to-components";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "路由到组件",
            "按目标 thing 分组已解析的映射,每个目标输出一条消息",
            NodeCategory::Flow,
            json!({
                "type": "object",
                "properties": { "mappingsKey": { "type": "string" } }
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
pub struct DelayConfig {
    /// 延迟时间(毫秒),上限为 `max_delay_ms`
    pub delay_ms: i64,
}

/// 延迟节点,只挂起当前执行
#[derive(Debug)]
pub struct DelayNode {
    delay_ms: u64,
}

#[async_trait]
impl NodeHandler for DelayNode {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let delay_ms = self.delay_ms.min(ctx.config().max_delay_ms);
        sleep(Duration::from_millis(delay_ms)).await;
        Ok(NodeOutcome::Single(msg.clone()))
    }
}

impl NodeKind for DelayNode {
    const TYPE: &'static str = "delay";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "延时节点",
            "延迟后原样转发消息",
            NodeCategory::Flow,
            json!({
                "type": "object",
                "required": ["delayMs"],
                "properties": { "delayMs": { "type": "integer", "minimum": 0 } }
            }),
        )
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self, RuleError> {
        let config: DelayConfig = parse_config(Self::TYPE, config)?;
        let delay_ms = u64::try_from(config.delay_ms).map_err(|_| {
            RuleError::ConfigError(format!("{}: delayMs 不能为负数: {}", Self::TYPE, config.delay_ms))
        })?;
        Ok(Self { delay_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::{msg, single, Harness};
    use crate::config::EngineConfig;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_route_to_components_fans_out_per_thing() {
        let harness = Harness::new();
        let input = msg(json!({"source": "gw-1"})).annotate(
            "resolvedMappings",
            json!([
                {"thingId": "inv-1", "feature": "power", "property": "active", "value": 10.5},
                {"thingId": "inv-2", "feature": "power", "property": "active", "value": 7},
                {"thingId": "inv-1", "feature": "grid", "property": "voltage", "value": 230}
            ]),
        );

        let outputs = harness
            .run::<RouteToComponents>(json!({}), &input)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(outputs.len(), 2);

        assert_eq!(outputs[0].data["thingId"], json!("inv-1"));
        assert_eq!(
            outputs[0].data["features"],
            json!({"power": {"active": 10.5}, "grid": {"voltage": 230}})
        );
        assert_eq!(outputs[0].metadata["resolvedMappings"].as_array().unwrap().len(), 2);

        assert_eq!(outputs[1].data["thingId"], json!("inv-2"));
        assert_eq!(outputs[1].data["features"], json!({"power": {"active": 7}}));
        assert_eq!(outputs[1].data["source"], json!("gw-1"));
    }

    #[tokio::test]
    async fn test_route_to_components_retargets_asset_id() {
        let harness = Harness::new();
        let input = msg(json!({"assetId": "gw-asset"})).annotate(
            "resolvedMappings",
            json!([{"thingId": "inv-1", "feature": "power", "property": "active", "value": 1}]),
        );

        let output = single(
            harness
                .run::<RouteToComponents>(json!({}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(output.asset_id(), Some("inv-1"));
        assert_eq!(output.data["thingId"], json!("inv-1"));
    }

    #[tokio::test]
    async fn test_route_to_components_without_mappings() {
        let harness = Harness::new();
        let outcome = harness
            .run::<RouteToComponents>(json!({}), &msg(json!({"v": 1})))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped() {
        let harness = Harness::with_config(EngineConfig {
            max_delay_ms: 100,
            ..EngineConfig::default()
        });
        let input = msg(json!({"v": 1}));

        let started = tokio::time::Instant::now();
        let out = single(
            harness
                .run::<DelayNode>(json!({"delayMs": 5000}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(out, input);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_negative_or_missing_delay_rejected() {
        for config in [json!({"delayMs": -5}), json!({})] {
            let config = config.as_object().cloned().unwrap();
            assert!(matches!(
                DelayNode::from_config(&config),
                Err(RuleError::ConfigError(_))
            ));
        }
    }
}
