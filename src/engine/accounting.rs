use crate::collaborators::RuleRepository;
use crate::types::{ExecutionStats, RuleError, RuleExecution};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
struct AdmissionCounters {
    throttled: u64,
    debounced: u64,
}

/// 执行记账
///
/// 执行记录写入规则仓库;被防抖合并或限流的触发不产生执行记录,
/// 只在本地计数,查询统计时合并。
pub struct ExecutionAccounting {
    repository: Arc<dyn RuleRepository>,
    admissions: DashMap<Uuid, AdmissionCounters>,
    #[cfg(feature = "metrics")]
    metrics: Option<metrics::ExecutionMetrics>,
}

impl ExecutionAccounting {
    pub fn new(repository: Arc<dyn RuleRepository>) -> Self {
        Self {
            repository,
            admissions: DashMap::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// 同时把计数导出到 prometheus registry
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, registry: &prometheus::Registry) -> Result<Self, RuleError> {
        self.metrics = Some(metrics::ExecutionMetrics::register(registry)?);
        Ok(self)
    }

    /// 持久化一条终态执行记录,仓库失败只记日志
    pub async fn record(&self, execution: &RuleExecution) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe(execution);
        }

        if let Err(e) = self.repository.save_execution(execution).await {
            error!(
                execution_id = %execution.id,
                rule_id = %execution.rule_id,
                "Failed to save execution record: {:#}", e
            );
        } else {
            debug!(
                execution_id = %execution.id,
                status = execution.status.as_str(),
                duration_ms = execution.duration_ms,
                "Execution recorded"
            );
        }
    }

    pub fn record_throttled(&self, rule_id: Uuid) {
        self.admissions.entry(rule_id).or_default().throttled += 1;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.admission(rule_id, "throttled");
        }
    }

    pub fn record_debounced(&self, rule_id: Uuid) {
        self.admissions.entry(rule_id).or_default().debounced += 1;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.admission(rule_id, "debounced");
        }
    }

    /// 仓库统计 + 本地准入计数
    pub async fn stats(&self, tenant_id: &str, rule_id: Uuid) -> Result<ExecutionStats, RuleError> {
        let mut stats = self
            .repository
            .get_execution_stats(tenant_id, rule_id)
            .await
            .map_err(RuleError::Repository)?;
        if let Some(counters) = self.admissions.get(&rule_id) {
            stats.throttled = counters.throttled;
            stats.debounced = counters.debounced;
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for ExecutionAccounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionAccounting")
            .field("rules", &self.admissions.len())
            .finish()
    }
}

#[cfg(feature = "metrics")]
mod metrics {
    use crate::types::{RuleError, RuleExecution};
    use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
    use uuid::Uuid;

    pub(super) struct ExecutionMetrics {
        executions: IntCounterVec,
        admissions: IntCounterVec,
        duration: HistogramVec,
    }

    fn metrics_error(e: prometheus::Error) -> RuleError {
        RuleError::ConfigError(format!("metrics: {}", e))
    }

    impl ExecutionMetrics {
        pub(super) fn register(registry: &Registry) -> Result<Self, RuleError> {
            let executions = IntCounterVec::new(
                Opts::new("rule_executions_total", "Rule executions by terminal status"),
                &["rule_id", "status"],
            )
            .map_err(metrics_error)?;
            let admissions = IntCounterVec::new(
                Opts::new("rule_triggers_rejected_total", "Triggers not admitted"),
                &["rule_id", "reason"],
            )
            .map_err(metrics_error)?;
            let duration = HistogramVec::new(
                HistogramOpts::new("rule_execution_duration_ms", "Rule execution wall time"),
                &["rule_id"],
            )
            .map_err(metrics_error)?;

            registry
                .register(Box::new(executions.clone()))
                .map_err(metrics_error)?;
            registry
                .register(Box::new(admissions.clone()))
                .map_err(metrics_error)?;
            registry
                .register(Box::new(duration.clone()))
                .map_err(metrics_error)?;

            Ok(Self {
                executions,
                admissions,
                duration,
            })
        }

        pub(super) fn observe(&self, execution: &RuleExecution) {
            let rule_id = execution.rule_id.to_string();
            self.executions
                .with_label_values(&[rule_id.as_str(), execution.status.as_str()])
                .inc();
            self.duration
                .with_label_values(&[rule_id.as_str()])
                .observe(execution.duration_ms as f64);
        }

        pub(super) fn admission(&self, rule_id: Uuid, reason: &str) {
            self.admissions
                .with_label_values(&[rule_id.to_string().as_str(), reason])
                .inc();
        }
    }
}
