use crate::types::{Message, NodeContext, NodeOutcome, Rule, RuleError, RuleExecution};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// 节点拦截器特征,用于在节点执行的不同阶段进行拦截处理
#[async_trait]
pub trait NodeInterceptor: Send + Sync + std::fmt::Debug {
    /// 节点执行前的拦截处理,返回错误会终止当前分支
    async fn before(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<(), RuleError>;

    /// 节点执行后的拦截处理
    async fn after(&self, ctx: &NodeContext<'_>, outcome: &NodeOutcome) -> Result<(), RuleError>;

    /// 节点执行出错时的拦截处理
    async fn error(&self, ctx: &NodeContext<'_>, error: &RuleError) -> Result<(), RuleError>;
}

/// 执行拦截器特征,包裹一次完整的规则执行
#[async_trait]
pub trait ExecutionInterceptor: Send + Sync + std::fmt::Debug {
    async fn before_execution(&self, rule: &Rule, msg: &Message) -> Result<(), RuleError>;

    async fn after_execution(&self, execution: &RuleExecution) -> Result<(), RuleError>;
}

/// 拦截器管理器,用于管理和执行所有注册的拦截器
#[derive(Debug, Default, Clone)]
pub struct InterceptorManager {
    node_interceptors: Vec<Arc<dyn NodeInterceptor>>,
    execution_interceptors: Vec<Arc<dyn ExecutionInterceptor>>,
}

impl InterceptorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node_interceptor(&mut self, interceptor: Arc<dyn NodeInterceptor>) {
        self.node_interceptors.push(interceptor);
    }

    pub fn register_execution_interceptor(&mut self, interceptor: Arc<dyn ExecutionInterceptor>) {
        self.execution_interceptors.push(interceptor);
    }

    pub async fn before_node(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<(), RuleError> {
        for interceptor in &self.node_interceptors {
            interceptor.before(ctx, msg).await?;
        }
        Ok(())
    }

    pub async fn after_node(
        &self,
        ctx: &NodeContext<'_>,
        outcome: &NodeOutcome,
    ) -> Result<(), RuleError> {
        for interceptor in &self.node_interceptors {
            interceptor.after(ctx, outcome).await?;
        }
        Ok(())
    }

    /// 错误拦截器自身出错只记录日志
    pub async fn node_error(&self, ctx: &NodeContext<'_>, error: &RuleError) {
        for interceptor in &self.node_interceptors {
            if let Err(e) = interceptor.error(ctx, error).await {
                warn!("Node error interceptor failed: {}", e);
            }
        }
    }

    pub async fn before_execution(&self, rule: &Rule, msg: &Message) -> Result<(), RuleError> {
        for interceptor in &self.execution_interceptors {
            interceptor.before_execution(rule, msg).await?;
        }
        Ok(())
    }

    pub async fn after_execution(&self, execution: &RuleExecution) {
        for interceptor in &self.execution_interceptors {
            if let Err(e) = interceptor.after_execution(execution).await {
                warn!("Execution interceptor failed: {}", e);
            }
        }
    }
}

/// 日志拦截器
#[derive(Debug)]
pub struct LoggingInterceptor;

#[async_trait]
impl NodeInterceptor for LoggingInterceptor {
    async fn before(&self, ctx: &NodeContext<'_>, msg: &Message) -> Result<(), RuleError> {
        debug!(
            parent: ctx.span(),
            msg_id = %msg.id,
            "node started"
        );
        Ok(())
    }

    async fn after(&self, ctx: &NodeContext<'_>, outcome: &NodeOutcome) -> Result<(), RuleError> {
        let produced = match outcome {
            NodeOutcome::Single(_) => 1,
            NodeOutcome::Many(msgs) => msgs.len(),
            NodeOutcome::None => 0,
        };
        debug!(parent: ctx.span(), produced, "node finished");
        Ok(())
    }

    async fn error(&self, ctx: &NodeContext<'_>, error: &RuleError) -> Result<(), RuleError> {
        debug!(parent: ctx.span(), %error, "node failed");
        Ok(())
    }
}
