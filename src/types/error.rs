use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("未知节点类型: {0}")]
    UnknownNodeType(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("外部服务调用失败({node}): {source}")]
    Collaborator {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("规则图存在环: {0}")]
    CyclicGraph(String),

    #[error("无效连接: {0}")]
    InvalidConnection(String),

    #[error("节点 id 重复: {0}")]
    DuplicateNode(String),

    #[error("执行超时: {0}ms")]
    TimeoutExceeded(u64),

    #[error("触发被限流: 规则 {0}")]
    RateLimited(Uuid),

    #[error("触发被防抖合并: 规则 {0}")]
    Debounced(Uuid),

    #[error("节点执行失败: {0}")]
    NodeExecutionError(String),

    #[error("脚本执行失败: {0}")]
    ScriptError(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(Uuid),

    #[error("规则仓库错误: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuleError {
    pub fn collaborator(node: &str, source: anyhow::Error) -> Self {
        RuleError::Collaborator {
            node: node.to_string(),
            source,
        }
    }

    /// 只有动作节点的外部调用失败会让整次执行失败
    pub fn is_execution_fatal(&self) -> bool {
        matches!(self, RuleError::Collaborator { .. })
    }

    /// 触发准入结果,不计为执行失败
    pub fn is_throttle(&self) -> bool {
        matches!(self, RuleError::RateLimited(_) | RuleError::Debounced(_))
    }
}
