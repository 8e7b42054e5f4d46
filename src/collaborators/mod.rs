//! 外部协作者
//!
//! 规则引擎只通过这些 trait 访问外部系统: 规则仓库、数字孪生存储、
//! 资产目录、告警存储、消息总线与时序存储。

pub mod memory;
mod redis_bus;

pub use redis_bus::{RedisEventStream, RedisMessageBus};

use crate::types::{ExecutionFilter, ExecutionStats, Rule, RuleExecution, RuleStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// 规则持久化
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create(&self, rule: Rule) -> anyhow::Result<Rule>;
    async fn find_by_id(&self, tenant_id: &str, rule_id: Uuid) -> anyhow::Result<Option<Rule>>;
    async fn find_all(&self, tenant_id: &str) -> anyhow::Result<Vec<Rule>>;
    /// 跨租户加载所有 ACTIVE 规则
    async fn find_active(&self) -> anyhow::Result<Vec<Rule>>;
    async fn update(&self, rule: Rule) -> anyhow::Result<Rule>;
    async fn delete(&self, tenant_id: &str, rule_id: Uuid) -> anyhow::Result<bool>;
    async fn set_status(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        status: RuleStatus,
    ) -> anyhow::Result<()>;

    async fn activate(&self, tenant_id: &str, rule_id: Uuid) -> anyhow::Result<()> {
        self.set_status(tenant_id, rule_id, RuleStatus::Active).await
    }

    async fn deactivate(&self, tenant_id: &str, rule_id: Uuid) -> anyhow::Result<()> {
        self.set_status(tenant_id, rule_id, RuleStatus::Inactive).await
    }

    async fn save_execution(&self, execution: &RuleExecution) -> anyhow::Result<()>;
    async fn get_executions(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        filter: &ExecutionFilter,
    ) -> anyhow::Result<Vec<RuleExecution>>;
    async fn get_execution_stats(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> anyhow::Result<ExecutionStats>;
}

/// 数字孪生 / 属性存储,按 thing id 寻址
#[async_trait]
pub trait TwinStore: Send + Sync {
    async fn get_attributes(
        &self,
        thing_id: &str,
        keys: Option<&[String]>,
    ) -> anyhow::Result<Map<String, Value>>;
    async fn get_latest_telemetry(
        &self,
        thing_id: &str,
        keys: Option<&[String]>,
    ) -> anyhow::Result<Map<String, Value>>;
    async fn update_feature_property(
        &self,
        thing_id: &str,
        feature: &str,
        property: &str,
        value: Value,
    ) -> anyhow::Result<()>;
    async fn delete_attributes(&self, thing_id: &str, keys: &[String]) -> anyhow::Result<()>;
}

/// 资产 / 租户目录
#[async_trait]
pub trait AssetDirectory: Send + Sync {
    async fn related_assets(&self, asset_id: &str, relation_type: &str)
        -> anyhow::Result<Vec<String>>;
    async fn tenant_attributes(
        &self,
        tenant_id: &str,
        keys: Option<&[String]>,
    ) -> anyhow::Result<Map<String, Value>>;
    async fn set_status(&self, asset_id: &str, status: &str) -> anyhow::Result<()>;
    async fn assign_customer(&self, asset_id: &str, customer_id: &str) -> anyhow::Result<()>;
    async fn unassign_customer(&self, asset_id: &str) -> anyhow::Result<()>;
    async fn create_relation(&self, from: &str, to: &str, relation_type: &str)
        -> anyhow::Result<()>;
    async fn delete_relation(&self, from: &str, to: &str, relation_type: &str)
        -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub asset_id: String,
    pub alarm_type: String,
    pub severity: String,
    pub details: Value,
}

/// 告警存储
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// 返回告警 id
    async fn create_alarm(&self, alarm: Alarm) -> anyhow::Result<String>;
    /// 返回是否存在被清除的告警
    async fn clear_alarm(&self, asset_id: &str, alarm_type: &str) -> anyhow::Result<bool>;
}

/// 消息总线发布
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Value) -> anyhow::Result<()>;
}

/// 时序存储
#[async_trait]
pub trait TimeseriesStore: Send + Sync {
    async fn save(
        &self,
        asset_id: &str,
        timestamp: i64,
        values: Map<String, Value>,
    ) -> anyhow::Result<()>;
}

/// 节点可用的全部外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub twin: Arc<dyn TwinStore>,
    pub directory: Arc<dyn AssetDirectory>,
    pub alarms: Arc<dyn AlarmStore>,
    pub bus: Arc<dyn MessageBus>,
    pub timeseries: Arc<dyn TimeseriesStore>,
}

impl Collaborators {
    /// 全部使用内存实现
    pub fn in_memory() -> (Self, memory::MemoryBackends) {
        let backends = memory::MemoryBackends::default();
        (backends.collaborators(), backends)
    }
}
