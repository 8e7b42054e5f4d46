use super::accounting::ExecutionAccounting;
use super::catalog::RuleCatalog;
use super::graph::RuleGraph;
use super::node::NodeRegistry;
use crate::aop::{ExecutionInterceptor, InterceptorManager, LoggingInterceptor, NodeInterceptor};
use crate::collaborators::{Collaborators, RuleRepository};
use crate::config::EngineConfig;
use crate::script::{JsEvaluator, ScriptEvaluator};
use crate::types::{
    ExecutionFilter, ExecutionStats, ExecutionStatus, Message, NodeContext, NodeDescriptor,
    NodeOutcome, Rule, RuleError, RuleExecution, TriggerType,
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// 一次执行的结果: 执行记录 + 终端消息
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution: RuleExecution,
    /// 到达终端节点的消息,按产生顺序
    pub outputs: Vec<Message>,
}

impl ExecutionReport {
    /// 输出消息集合的结构指纹(忽略消息 id 与顺序)
    pub fn fingerprint(&self) -> String {
        let mut canonical: Vec<String> = self
            .outputs
            .iter()
            .map(|msg| {
                json!({
                    "type": msg.msg_type,
                    "data": msg.data,
                    "metadata": msg.metadata,
                })
                .to_string()
            })
            .collect();
        canonical.sort();

        let mut hasher = blake3::Hasher::new();
        for entry in &canonical {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.execution.status
    }
}

/// 图遍历过程中累积的状态,超时取消后仍可读取
#[derive(Default)]
struct WalkState {
    outputs: Vec<Message>,
    failure: Option<RuleError>,
    dispatched: usize,
}

/// 规则引擎: 执行规则图,维护活动规则与执行记账
pub struct RuleEngine {
    config: EngineConfig,
    registry: Arc<NodeRegistry>,
    collaborators: Collaborators,
    evaluator: Arc<dyn ScriptEvaluator>,
    repository: Arc<dyn RuleRepository>,
    catalog: Arc<RuleCatalog>,
    accounting: Arc<ExecutionAccounting>,
    interceptors: InterceptorManager,
}

impl RuleEngine {
    pub fn new(
        config: EngineConfig,
        registry: NodeRegistry,
        collaborators: Collaborators,
        repository: Arc<dyn RuleRepository>,
    ) -> Result<Self, RuleError> {
        config.validate()?;

        let evaluator = Arc::new(JsEvaluator::new(
            Duration::from_millis(config.script_timeout_ms),
            config.script_memory_limit_bytes,
        ));
        let mut interceptors = InterceptorManager::new();
        interceptors.register_node_interceptor(Arc::new(LoggingInterceptor));

        Ok(Self {
            catalog: Arc::new(RuleCatalog::new(repository.clone())),
            accounting: Arc::new(ExecutionAccounting::new(repository.clone())),
            config,
            registry: Arc::new(registry),
            collaborators,
            evaluator,
            repository,
            interceptors,
        })
    }

    pub fn with_node_interceptor(mut self, interceptor: Arc<dyn NodeInterceptor>) -> Self {
        self.interceptors.register_node_interceptor(interceptor);
        self
    }

    pub fn with_execution_interceptor(mut self, interceptor: Arc<dyn ExecutionInterceptor>) -> Self {
        self.interceptors
            .register_execution_interceptor(interceptor);
        self
    }

    /// 替换脚本求值器
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, registry: &prometheus::Registry) -> Result<Self, RuleError> {
        let accounting = ExecutionAccounting::new(self.repository.clone()).with_metrics(registry)?;
        self.accounting = Arc::new(accounting);
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn evaluator(&self) -> &dyn ScriptEvaluator {
        self.evaluator.as_ref()
    }

    pub fn repository(&self) -> &Arc<dyn RuleRepository> {
        &self.repository
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn accounting(&self) -> &ExecutionAccounting {
        &self.accounting
    }

    /// 编辑器使用的节点目录
    pub fn node_descriptors(&self) -> Vec<NodeDescriptor> {
        self.registry.descriptors()
    }

    /// 保存前校验规则: 图结构 + 每个节点的配置
    pub fn validate_rule(&self, rule: &Rule) -> Result<(), RuleError> {
        RuleGraph::compile(rule.clone())?;
        for node in &rule.nodes {
            self.registry
                .validate_config(&node.type_name, &node.config)
                .map_err(|e| match e {
                    RuleError::ConfigError(msg) => {
                        RuleError::ConfigError(format!("节点 {}: {}", node.id, msg))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }

    /// 校验后激活规则并刷新活动规则缓存
    pub async fn activate_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), RuleError> {
        let rule = self.load_rule(tenant_id, rule_id).await?;
        self.validate_rule(&rule)?;
        self.repository
            .activate(tenant_id, rule_id)
            .await
            .map_err(RuleError::Repository)?;
        self.catalog.reload().await?;
        info!(%rule_id, "Rule {} activated", rule.name);
        Ok(())
    }

    pub async fn deactivate_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), RuleError> {
        self.repository
            .deactivate(tenant_id, rule_id)
            .await
            .map_err(RuleError::Repository)?;
        self.catalog.reload().await?;
        info!(%rule_id, "Rule deactivated");
        Ok(())
    }

    pub async fn execution_history(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        filter: &ExecutionFilter,
    ) -> Result<Vec<RuleExecution>, RuleError> {
        self.repository
            .get_executions(tenant_id, rule_id, filter)
            .await
            .map_err(RuleError::Repository)
    }

    pub async fn execution_stats(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> Result<ExecutionStats, RuleError> {
        self.accounting.stats(tenant_id, rule_id).await
    }

    /// 加载活动规则并执行 executeOnStartup 规则
    pub async fn start(&self) -> Result<Vec<ExecutionReport>, RuleError> {
        self.catalog.reload().await?;
        Ok(self.run_startup_rules().await)
    }

    /// 对每个 executeOnStartup 的活动规则执行一次合成的 STARTUP 触发,
    /// 不受 triggerTypes / appliesTo 限制
    pub async fn run_startup_rules(&self) -> Vec<ExecutionReport> {
        let mut reports = Vec::new();
        for graph in self.catalog.all().await {
            if !graph.rule().config.execute_on_startup {
                continue;
            }
            let mut data = Map::new();
            data.insert("ruleId".to_string(), Value::String(graph.rule().id.to_string()));
            let trigger = Message::new("startup", data);
            reports.push(self.execute(&graph, trigger, TriggerType::Startup).await);
        }
        if !reports.is_empty() {
            info!("Executed {} startup rules", reports.len());
        }
        reports
    }

    /// 按 id 手动执行规则(任意状态)
    pub async fn execute_rule(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        trigger: Message,
        trigger_type: TriggerType,
    ) -> Result<ExecutionReport, RuleError> {
        let rule = self.load_rule(tenant_id, rule_id).await?;
        let graph = RuleGraph::compile(rule)?;
        Ok(self.execute(&graph, trigger, trigger_type).await)
    }

    async fn load_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<Rule, RuleError> {
        self.repository
            .find_by_id(tenant_id, rule_id)
            .await
            .map_err(RuleError::Repository)?
            .ok_or(RuleError::RuleNotFound(rule_id))
    }

    /// 执行一次规则图并记账
    ///
    /// 超时后停止派发剩余分支,记录 TIMED_OUT;动作节点的外部调用失败
    /// 记录 FAILED,其余分支照常执行完。
    pub async fn execute(
        &self,
        graph: &RuleGraph,
        trigger: Message,
        trigger_type: TriggerType,
    ) -> ExecutionReport {
        let rule = graph.rule();
        let mut execution = RuleExecution::pending(
            rule.id,
            &rule.tenant_id,
            trigger.asset_id().map(str::to_string),
            trigger_type,
            Value::Object(trigger.data.clone()),
        );

        let timeout_ms = match rule.config.timeout_ms {
            0 => self.config.default_timeout_ms,
            ms => ms,
        };
        let span = tracing::info_span!(
            "execution",
            execution_id = %execution.id,
            rule_id = %rule.id,
            trigger = %execution.trigger_type,
        );

        let started = Instant::now();
        let mut state = WalkState::default();

        let outcome = async {
            if let Err(e) = self.interceptors.before_execution(rule, &trigger).await {
                warn!("Execution rejected by interceptor: {}", e);
                return (ExecutionStatus::Failed, Some(e.to_string()));
            }

            execution.status = ExecutionStatus::Running;
            debug!("Execution started, timeout {}ms", timeout_ms);

            let walk = self.walk(graph, trigger, 0, &mut state);
            match tokio::time::timeout(Duration::from_millis(timeout_ms), walk).await {
                Ok(()) => match state.failure.take() {
                    Some(e) => (ExecutionStatus::Failed, Some(e.to_string())),
                    None => (ExecutionStatus::Completed, None),
                },
                Err(_) => {
                    warn!("Execution exceeded {}ms, remaining branches cancelled", timeout_ms);
                    (
                        ExecutionStatus::TimedOut,
                        Some(RuleError::TimeoutExceeded(timeout_ms).to_string()),
                    )
                }
            }
        }
        .instrument(span.clone())
        .await;

        let (status, error) = outcome;
        let duration_ms = started.elapsed().as_millis() as u64;
        execution.finish(status, error, duration_ms);

        span.in_scope(|| {
            info!(
                status = execution.status.as_str(),
                duration_ms,
                nodes = state.dispatched,
                outputs = state.outputs.len(),
                "Execution finished"
            )
        });

        self.accounting.record(&execution).await;
        self.interceptors.after_execution(&execution).await;

        ExecutionReport {
            execution,
            outputs: state.outputs,
        }
    }

    /// 广度优先遍历规则图
    async fn walk(&self, graph: &RuleGraph, trigger: Message, depth: usize, state: &mut WalkState) {
        let rule = graph.rule();
        let mut queue: VecDeque<(&str, Message)> = graph
            .entry_nodes()
            .iter()
            .map(|id| (id.as_str(), trigger.clone()))
            .collect();

        while let Some((node_id, msg)) = queue.pop_front() {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            let ctx = NodeContext::new(node, rule.id, &rule.tenant_id, depth, self);
            state.dispatched += 1;

            let outcome = match self.dispatch(&ctx, &msg).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_execution_fatal() => {
                    error!(parent: ctx.span(), "Action failed, execution marked FAILED: {}", e);
                    if state.failure.is_none() {
                        state.failure = Some(e);
                    }
                    continue;
                }
                Err(e) => {
                    warn!(parent: ctx.span(), "Branch dropped: {}", e);
                    continue;
                }
            };

            let terminal = graph.is_terminal(node_id);
            for mut out in outcome.into_messages() {
                let route = out.take_route();
                if terminal {
                    state.outputs.push(out);
                    continue;
                }

                let next = graph.next_connections(node_id, route.as_deref());
                if next.is_empty() {
                    debug!(
                        parent: ctx.span(),
                        route = route.as_deref().unwrap_or_default(),
                        "No connection for route, message dropped"
                    );
                }
                for conn in next {
                    queue.push_back((conn.to_node.as_str(), out.clone()));
                }
            }
        }
    }

    async fn dispatch(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<NodeOutcome, RuleError> {
        let handler = self.registry.create(&ctx.node.type_name, &ctx.node.config)?;

        self.interceptors.before_node(ctx, msg).await?;

        match handler.execute(ctx, msg).instrument(ctx.span().clone()).await {
            Ok(outcome) => {
                self.interceptors.after_node(ctx, &outcome).await?;
                Ok(outcome)
            }
            Err(e) => {
                self.interceptors.node_error(ctx, &e).await;
                Err(e)
            }
        }
    }

    /// 在当前执行内运行另一条规则,返回其终端消息
    pub fn run_nested<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        rule_id: Uuid,
        msg: Message,
    ) -> BoxFuture<'a, Result<Vec<Message>, RuleError>> {
        async move {
            let depth = ctx.depth + 1;
            if depth > self.config.max_rule_chain_depth {
                return Err(RuleError::ConfigError(format!(
                    "规则链嵌套超过最大深度 {}",
                    self.config.max_rule_chain_depth
                )));
            }

            let graph = match self.catalog.get(ctx.tenant_id, rule_id).await {
                Some(graph) => graph,
                None => {
                    let rule = self.load_rule(ctx.tenant_id, rule_id).await?;
                    Arc::new(RuleGraph::compile(rule)?)
                }
            };

            let mut state = WalkState::default();
            self.walk(&graph, msg, depth, &mut state).await;
            match state.failure {
                Some(e) => Err(e),
                None => Ok(state.outputs),
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("catalog", &self.catalog)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::InMemoryRuleRepository;
    use crate::engine::{NodeFactory, NodeHandler};
    use async_trait::async_trait;
    use serde_json::json;

    /// 把 config.tag 追加到 data.path
    #[derive(Debug)]
    struct TagNode(String);

    #[async_trait]
    impl NodeHandler for TagNode {
        async fn execute(
            &self,
            _ctx: &NodeContext<'_>,
            msg: &Message,
        ) -> Result<NodeOutcome, RuleError> {
            let mut path = msg
                .data
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            path.push_str(&self.0);
            Ok(NodeOutcome::Single(
                msg.merge_data([("path".to_string(), json!(path))]),
            ))
        }
    }

    #[derive(Debug)]
    struct FailingAction;

    #[async_trait]
    impl NodeHandler for FailingAction {
        async fn execute(
            &self,
            ctx: &NodeContext<'_>,
            _msg: &Message,
        ) -> Result<NodeOutcome, RuleError> {
            Err(RuleError::collaborator(
                ctx.node_id(),
                anyhow::anyhow!("bus unavailable"),
            ))
        }
    }

    #[derive(Debug)]
    struct BrokenNode;

    #[async_trait]
    impl NodeHandler for BrokenNode {
        async fn execute(
            &self,
            _ctx: &NodeContext<'_>,
            _msg: &Message,
        ) -> Result<NodeOutcome, RuleError> {
            Err(RuleError::NodeExecutionError("boom".to_string()))
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        let tag: NodeFactory = Arc::new(|config: &Map<String, Value>| {
            let tag = config
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Arc::new(TagNode(tag)) as Arc<dyn NodeHandler>)
        });
        registry.register("tag", tag);
        registry.register(
            "fail",
            Arc::new(|_: &Map<String, Value>| Ok(Arc::new(FailingAction) as Arc<dyn NodeHandler>)),
        );
        registry.register(
            "broken",
            Arc::new(|_: &Map<String, Value>| Ok(Arc::new(BrokenNode) as Arc<dyn NodeHandler>)),
        );
        registry
    }

    fn engine() -> (RuleEngine, Arc<InMemoryRuleRepository>) {
        let repository = Arc::new(InMemoryRuleRepository::new());
        let (collaborators, _) = Collaborators::in_memory();
        let engine = RuleEngine::new(
            EngineConfig::default(),
            registry(),
            collaborators,
            repository.clone(),
        )
        .unwrap();
        (engine, repository)
    }

    fn graph(nodes: Value, connections: Value) -> RuleGraph {
        RuleGraph::compile(
            serde_json::from_value(json!({
                "id": Uuid::new_v4(),
                "tenantId": "t1",
                "name": "test",
                "nodes": nodes,
                "connections": connections
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn paths(report: &ExecutionReport) -> Vec<String> {
        let mut paths: Vec<String> = report
            .outputs
            .iter()
            .map(|m| m.data["path"].as_str().unwrap_or_default().to_string())
            .collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_branch() {
        let (engine, repository) = engine();
        let graph = graph(
            json!([
                {"id": "a", "type": "tag", "config": {"tag": "a"}},
                {"id": "b", "type": "tag", "config": {"tag": "b"}},
                {"id": "c", "type": "tag", "config": {"tag": "c"}}
            ]),
            json!([
                {"id": "1", "fromNode": "a", "toNode": "b"},
                {"id": "2", "fromNode": "a", "toNode": "c"}
            ]),
        );

        let report = engine
            .execute(&graph, Message::new("telemetry", Map::new()), TriggerType::Telemetry)
            .await;

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert_eq!(paths(&report), vec!["ab", "ac"]);
        assert_eq!(repository.executions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_branch_error_is_contained() {
        let (engine, _) = engine();
        let graph = graph(
            json!([
                {"id": "a", "type": "tag", "config": {"tag": "a"}},
                {"id": "x", "type": "broken"},
                {"id": "u", "type": "unknown-kind"},
                {"id": "c", "type": "tag", "config": {"tag": "c"}}
            ]),
            json!([
                {"id": "1", "fromNode": "a", "toNode": "x"},
                {"id": "2", "fromNode": "a", "toNode": "u"},
                {"id": "3", "fromNode": "a", "toNode": "c"}
            ]),
        );

        let report = engine
            .execute(&graph, Message::new("telemetry", Map::new()), TriggerType::Telemetry)
            .await;

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert_eq!(paths(&report), vec!["ac"]);
    }

    #[tokio::test]
    async fn test_action_failure_fails_execution() {
        let (engine, _) = engine();
        let graph = graph(
            json!([
                {"id": "a", "type": "tag", "config": {"tag": "a"}},
                {"id": "f", "type": "fail"},
                {"id": "c", "type": "tag", "config": {"tag": "c"}}
            ]),
            json!([
                {"id": "1", "fromNode": "a", "toNode": "f"},
                {"id": "2", "fromNode": "a", "toNode": "c"}
            ]),
        );

        let report = engine
            .execute(&graph, Message::new("telemetry", Map::new()), TriggerType::Telemetry)
            .await;

        assert_eq!(report.status(), ExecutionStatus::Failed);
        assert!(!report.execution.success);
        assert!(report
            .execution
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("bus unavailable"));
        assert_eq!(paths(&report), vec!["ac"]);
    }

    #[tokio::test]
    async fn test_fingerprint_ignores_message_ids() {
        let (engine, _) = engine();
        let graph = graph(
            json!([{"id": "a", "type": "tag", "config": {"tag": "a"}}]),
            json!([]),
        );
        let mut data = Map::new();
        data.insert("temperature".to_string(), json!(21));

        let first = engine
            .execute(&graph, Message::new("telemetry", data.clone()), TriggerType::Telemetry)
            .await;
        let second = engine
            .execute(&graph, Message::new("telemetry", data), TriggerType::Telemetry)
            .await;

        assert_ne!(first.outputs[0].id, second.outputs[0].id);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn test_execute_rule_not_found() {
        let (engine, _) = engine();
        let missing = Uuid::new_v4();
        let result = engine
            .execute_rule("t1", missing, Message::new("manual", Map::new()), TriggerType::Manual)
            .await;
        assert!(matches!(result, Err(RuleError::RuleNotFound(id)) if id == missing));
    }
}
