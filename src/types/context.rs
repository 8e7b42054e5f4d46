use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::engine::RuleEngine;
use crate::script::ScriptEvaluator;
use crate::types::RuleNode;
use tracing::Span;
use uuid::Uuid;

/// 节点执行上下文,仅在一次节点调度期间存在
#[derive(Clone)]
pub struct NodeContext<'a> {
    /// 当前执行的节点
    pub node: &'a RuleNode,
    /// 所属规则(规则链) id
    pub rule_chain_id: Uuid,
    pub tenant_id: &'a str,
    /// 规则链嵌套深度,顶层为 0
    pub depth: usize,
    /// 规则引擎实例
    pub engine: &'a RuleEngine,
    span: Span,
}

impl<'a> NodeContext<'a> {
    pub fn new(
        node: &'a RuleNode,
        rule_chain_id: Uuid,
        tenant_id: &'a str,
        depth: usize,
        engine: &'a RuleEngine,
    ) -> Self {
        let span = tracing::info_span!(
            "node",
            node_id = %node.id,
            node_type = %node.type_name,
            rule_id = %rule_chain_id,
            tenant_id = %tenant_id,
        );
        Self {
            node,
            rule_chain_id,
            tenant_id,
            depth,
            engine,
            span,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// 日志能力: 节点内的日志都挂在该 span 下
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn collaborators(&self) -> &Collaborators {
        self.engine.collaborators()
    }

    pub fn evaluator(&self) -> &dyn ScriptEvaluator {
        self.engine.evaluator()
    }

    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }
}

impl std::fmt::Debug for NodeContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node.id)
            .field("rule_chain_id", &self.rule_chain_id)
            .field("tenant_id", &self.tenant_id)
            .field("depth", &self.depth)
            .finish()
    }
}
