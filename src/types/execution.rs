use crate::types::TriggerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 单次执行的状态机: PENDING -> RUNNING -> {COMPLETED, FAILED, TIMED_OUT}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }
}

/// 每个被准入的触发对应一条执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExecution {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub tenant_id: String,
    pub asset_id: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    pub success: bool,
    pub error: Option<String>,
}

impl RuleExecution {
    pub fn pending(
        rule_id: Uuid,
        tenant_id: &str,
        asset_id: Option<String>,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            tenant_id: tenant_id.to_string(),
            asset_id,
            trigger_type,
            trigger_data,
            started_at: Utc::now(),
            duration_ms: 0,
            status: ExecutionStatus::Pending,
            success: false,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus, error: Option<String>, duration_ms: u64) {
        self.status = status;
        self.success = status == ExecutionStatus::Completed;
        self.error = error;
        self.duration_ms = duration_ms;
    }
}

/// 执行历史查询条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionFilter {
    pub asset_id: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &RuleExecution) -> bool {
        self.asset_id
            .as_ref()
            .map_or(true, |id| execution.asset_id.as_ref() == Some(id))
            && self.success.map_or(true, |s| execution.success == s)
            && self.since.map_or(true, |since| execution.started_at >= since)
    }
}

/// 规则执行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub throttled: u64,
    pub debounced: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl ExecutionStats {
    /// 从执行记录计算统计
    pub fn from_executions<'a, I>(executions: I) -> Self
    where
        I: IntoIterator<Item = &'a RuleExecution>,
    {
        let mut stats = ExecutionStats::default();
        let mut total_duration = 0u64;

        for execution in executions {
            stats.total_executions += 1;
            total_duration += execution.duration_ms;
            match execution.status {
                ExecutionStatus::Completed => stats.successful += 1,
                ExecutionStatus::TimedOut => stats.timed_out += 1,
                _ => stats.failed += 1,
            }
            if stats
                .last_execution_at
                .map_or(true, |last| execution.started_at > last)
            {
                stats.last_execution_at = Some(execution.started_at);
            }
        }

        if stats.total_executions > 0 {
            stats.success_rate = stats.successful as f64 / stats.total_executions as f64;
            stats.average_duration_ms = total_duration as f64 / stats.total_executions as f64;
        }
        stats
    }

    /// 错误数: 失败 + 超时
    pub fn error_count(&self) -> u64 {
        self.failed + self.timed_out
    }
}
