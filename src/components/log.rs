use super::descriptor;
use crate::engine::{parse_config, NodeHandler, NodeKind};
use crate::types::{Message, NodeCategory, NodeContext, NodeDescriptor, NodeOutcome, RuleError};
use crate::utils::render_template;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志模板,支持 `${data.key}`、`${metadata.key}`、`${msg.type}`、`${msg.id}`
    pub template: String,
}

/// 输出格式化日志,原样转发消息
#[derive(Debug)]
pub struct LogNode {
    config: LogConfig,
}

impl LogNode {
    pub fn format_message(&self, msg: &Message) -> String {
        render_template(&self.config.template, msg)
    }
}

#[async_trait]
impl NodeHandler for LogNode {
    async fn execute(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        info!(parent: ctx.span(), "{}", self.format_message(msg));
        Ok(NodeOutcome::Single(msg.clone()))
    }
}

impl NodeKind for LogNode {
    const TYPE: &'static str = "log";

    fn descriptor() -> NodeDescriptor {
        descriptor::<Self>(
            "日志节点",
            "输出格式化日志",
            NodeCategory::Transform,
            json!({
                "type": "object",
                "required": ["template"],
                "properties": { "template": { "type": "string" } }
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

    #[test]
    fn test_format_message() {
        let config = json!({"template": "${msg.type} from ${data.assetId} at ${metadata.gatewayId}"});
        let node = LogNode::from_config(config.as_object().unwrap()).unwrap();
        let input = msg(json!({"assetId": "pump-1"})).annotate("gatewayId", json!("gw-1"));
        assert_eq!(node.format_message(&input), "telemetry from pump-1 at gw-1");
    }

    #[test_log::test(tokio::test)]
    async fn test_passes_message_through() {
        let harness = Harness::new();
        let input = msg(json!({"v": 1}));
        let out = single(
            harness
                .run::<LogNode>(json!({"template": "value ${data.v}"}), &input)
                .await
                .unwrap(),
        );
        assert_eq!(out, input);
    }
}
