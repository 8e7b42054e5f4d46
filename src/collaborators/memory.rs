//! 外部协作者的内存实现
//!
//! 用于测试与演示: 记录所有副作用,并可切换为失败模式。

use super::{
    Alarm, AlarmStore, AssetDirectory, Collaborators, MessageBus, RuleRepository, TimeseriesStore,
    TwinStore,
};
use crate::types::{ExecutionFilter, ExecutionStats, Rule, RuleExecution, RuleStatus};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 失败开关
#[derive(Debug, Default)]
pub struct FailSwitch(AtomicBool);

impl FailSwitch {
    pub fn set_failing(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> anyhow::Result<()> {
        if self.0.load(Ordering::SeqCst) {
            bail!("simulated failure: {}", operation);
        }
        Ok(())
    }
}

fn select_keys(map: &Map<String, Value>, keys: Option<&[String]>) -> Map<String, Value> {
    match keys {
        Some(keys) => keys
            .iter()
            .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
            .collect(),
        None => map.clone(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Thing {
    pub attributes: Map<String, Value>,
    pub telemetry: Map<String, Value>,
    /// feature -> property -> value
    pub features: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct InMemoryTwinStore {
    things: RwLock<HashMap<String, Thing>>,
    pub fail: FailSwitch,
}

impl InMemoryTwinStore {
    pub async fn set_attributes(&self, thing_id: &str, attributes: Map<String, Value>) {
        let mut things = self.things.write().await;
        things
            .entry(thing_id.to_string())
            .or_default()
            .attributes
            .extend(attributes);
    }

    pub async fn set_telemetry(&self, thing_id: &str, telemetry: Map<String, Value>) {
        let mut things = self.things.write().await;
        things
            .entry(thing_id.to_string())
            .or_default()
            .telemetry
            .extend(telemetry);
    }

    pub async fn thing(&self, thing_id: &str) -> Option<Thing> {
        self.things.read().await.get(thing_id).cloned()
    }

    pub async fn feature_property(&self, thing_id: &str, feature: &str, property: &str) -> Option<Value> {
        let things = self.things.read().await;
        things
            .get(thing_id)?
            .features
            .get(feature)?
            .get(property)
            .cloned()
    }
}

#[async_trait]
impl TwinStore for InMemoryTwinStore {
    async fn get_attributes(
        &self,
        thing_id: &str,
        keys: Option<&[String]>,
    ) -> anyhow::Result<Map<String, Value>> {
        self.fail.check("get_attributes")?;
        let things = self.things.read().await;
        let thing = things
            .get(thing_id)
            .ok_or_else(|| anyhow!("thing not found: {}", thing_id))?;
        Ok(select_keys(&thing.attributes, keys))
    }

    async fn get_latest_telemetry(
        &self,
        thing_id: &str,
        keys: Option<&[String]>,
    ) -> anyhow::Result<Map<String, Value>> {
        self.fail.check("get_latest_telemetry")?;
        let things = self.things.read().await;
        let thing = things
            .get(thing_id)
            .ok_or_else(|| anyhow!("thing not found: {}", thing_id))?;
        Ok(select_keys(&thing.telemetry, keys))
    }

    async fn update_feature_property(
        &self,
        thing_id: &str,
        feature: &str,
        property: &str,
        value: Value,
    ) -> anyhow::Result<()> {
        self.fail.check("update_feature_property")?;
        let mut things = self.things.write().await;
        let thing = things.entry(thing_id.to_string()).or_default();
        let entry = thing
            .features
            .entry(feature.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(props) = entry {
            props.insert(property.to_string(), value);
        }
        Ok(())
    }

    async fn delete_attributes(&self, thing_id: &str, keys: &[String]) -> anyhow::Result<()> {
        self.fail.check("delete_attributes")?;
        let mut things = self.things.write().await;
        if let Some(thing) = things.get_mut(thing_id) {
            for key in keys {
                thing.attributes.remove(key);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub relation_type: String,
}

#[derive(Debug, Default)]
pub struct InMemoryAssetDirectory {
    relations: RwLock<Vec<Relation>>,
    tenant_attributes: RwLock<HashMap<String, Map<String, Value>>>,
    statuses: RwLock<HashMap<String, String>>,
    customers: RwLock<HashMap<String, String>>,
    pub fail: FailSwitch,
}

impl InMemoryAssetDirectory {
    pub async fn set_tenant_attributes(&self, tenant_id: &str, attributes: Map<String, Value>) {
        self.tenant_attributes
            .write()
            .await
            .insert(tenant_id.to_string(), attributes);
    }

    pub async fn relations(&self) -> Vec<Relation> {
        self.relations.read().await.clone()
    }

    pub async fn status(&self, asset_id: &str) -> Option<String> {
        self.statuses.read().await.get(asset_id).cloned()
    }

    pub async fn customer(&self, asset_id: &str) -> Option<String> {
        self.customers.read().await.get(asset_id).cloned()
    }
}

#[async_trait]
impl AssetDirectory for InMemoryAssetDirectory {
    async fn related_assets(
        &self,
        asset_id: &str,
        relation_type: &str,
    ) -> anyhow::Result<Vec<String>> {
        self.fail.check("related_assets")?;
        Ok(self
            .relations
            .read()
            .await
            .iter()
            .filter(|r| r.from == asset_id && r.relation_type == relation_type)
            .map(|r| r.to.clone())
            .collect())
    }

    async fn tenant_attributes(
        &self,
        tenant_id: &str,
        keys: Option<&[String]>,
    ) -> anyhow::Result<Map<String, Value>> {
        self.fail.check("tenant_attributes")?;
        let attributes = self.tenant_attributes.read().await;
        Ok(attributes
            .get(tenant_id)
            .map(|attrs| select_keys(attrs, keys))
            .unwrap_or_default())
    }

    async fn set_status(&self, asset_id: &str, status: &str) -> anyhow::Result<()> {
        self.fail.check("set_status")?;
        self.statuses
            .write()
            .await
            .insert(asset_id.to_string(), status.to_string());
        Ok(())
    }

    async fn assign_customer(&self, asset_id: &str, customer_id: &str) -> anyhow::Result<()> {
        self.fail.check("assign_customer")?;
        self.customers
            .write()
            .await
            .insert(asset_id.to_string(), customer_id.to_string());
        Ok(())
    }

    async fn unassign_customer(&self, asset_id: &str) -> anyhow::Result<()> {
        self.fail.check("unassign_customer")?;
        self.customers.write().await.remove(asset_id);
        Ok(())
    }

    async fn create_relation(
        &self,
        from: &str,
        to: &str,
        relation_type: &str,
    ) -> anyhow::Result<()> {
        self.fail.check("create_relation")?;
        let relation = Relation {
            from: from.to_string(),
            to: to.to_string(),
            relation_type: relation_type.to_string(),
        };
        let mut relations = self.relations.write().await;
        if !relations.contains(&relation) {
            relations.push(relation);
        }
        Ok(())
    }

    async fn delete_relation(
        &self,
        from: &str,
        to: &str,
        relation_type: &str,
    ) -> anyhow::Result<()> {
        self.fail.check("delete_relation")?;
        self.relations
            .write()
            .await
            .retain(|r| !(r.from == from && r.to == to && r.relation_type == relation_type));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredAlarm {
    pub id: String,
    pub alarm: Alarm,
    pub cleared: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryAlarmStore {
    alarms: RwLock<Vec<StoredAlarm>>,
    pub fail: FailSwitch,
}

impl InMemoryAlarmStore {
    pub async fn alarms(&self) -> Vec<StoredAlarm> {
        self.alarms.read().await.clone()
    }
}

#[async_trait]
impl AlarmStore for InMemoryAlarmStore {
    async fn create_alarm(&self, alarm: Alarm) -> anyhow::Result<String> {
        self.fail.check("create_alarm")?;
        let id = Uuid::new_v4().to_string();
        self.alarms.write().await.push(StoredAlarm {
            id: id.clone(),
            alarm,
            cleared: false,
        });
        Ok(id)
    }

    async fn clear_alarm(&self, asset_id: &str, alarm_type: &str) -> anyhow::Result<bool> {
        self.fail.check("clear_alarm")?;
        let mut cleared = false;
        for stored in self.alarms.write().await.iter_mut() {
            if !stored.cleared
                && stored.alarm.asset_id == asset_id
                && stored.alarm.alarm_type == alarm_type
            {
                stored.cleared = true;
                cleared = true;
            }
        }
        Ok(cleared)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    published: RwLock<Vec<Published>>,
    pub fail: FailSwitch,
}

impl InMemoryMessageBus {
    pub async fn published(&self) -> Vec<Published> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Value) -> anyhow::Result<()> {
        self.fail.check("publish")?;
        self.published.write().await.push(Published {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub asset_id: String,
    pub timestamp: i64,
    pub values: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct InMemoryTimeseriesStore {
    points: RwLock<Vec<Point>>,
    pub fail: FailSwitch,
}

impl InMemoryTimeseriesStore {
    pub async fn points(&self) -> Vec<Point> {
        self.points.read().await.clone()
    }
}

#[async_trait]
impl TimeseriesStore for InMemoryTimeseriesStore {
    async fn save(
        &self,
        asset_id: &str,
        timestamp: i64,
        values: Map<String, Value>,
    ) -> anyhow::Result<()> {
        self.fail.check("save_timeseries")?;
        self.points.write().await.push(Point {
            asset_id: asset_id.to_string(),
            timestamp,
            values,
        });
        Ok(())
    }
}

/// 一组内存协作者,保留具体类型以便断言
#[derive(Clone, Default)]
pub struct MemoryBackends {
    pub twin: Arc<InMemoryTwinStore>,
    pub directory: Arc<InMemoryAssetDirectory>,
    pub alarms: Arc<InMemoryAlarmStore>,
    pub bus: Arc<InMemoryMessageBus>,
    pub timeseries: Arc<InMemoryTimeseriesStore>,
}

impl MemoryBackends {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            twin: self.twin.clone(),
            directory: self.directory.clone(),
            alarms: self.alarms.clone(),
            bus: self.bus.clone(),
            timeseries: self.timeseries.clone(),
        }
    }
}

/// 内存规则仓库
#[derive(Debug, Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<Uuid, Rule>>,
    executions: RwLock<Vec<RuleExecution>>,
    pub fail: FailSwitch,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn executions(&self) -> Vec<RuleExecution> {
        self.executions.read().await.clone()
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn create(&self, rule: Rule) -> anyhow::Result<Rule> {
        self.fail.check("create")?;
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id) {
            bail!("rule already exists: {}", rule.id);
        }
        rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn find_by_id(&self, tenant_id: &str, rule_id: Uuid) -> anyhow::Result<Option<Rule>> {
        self.fail.check("find_by_id")?;
        Ok(self
            .rules
            .read()
            .await
            .get(&rule_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_all(&self, tenant_id: &str) -> anyhow::Result<Vec<Rule>> {
        self.fail.check("find_all")?;
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_active(&self) -> anyhow::Result<Vec<Rule>> {
        self.fail.check("find_active")?;
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.status == RuleStatus::Active)
            .cloned()
            .collect())
    }

    async fn update(&self, rule: Rule) -> anyhow::Result<Rule> {
        self.fail.check("update")?;
        let mut rules = self.rules.write().await;
        match rules.get_mut(&rule.id) {
            Some(existing) if existing.tenant_id == rule.tenant_id => {
                *existing = rule.clone();
                Ok(rule)
            }
            _ => bail!("rule not found: {}", rule.id),
        }
    }

    async fn delete(&self, tenant_id: &str, rule_id: Uuid) -> anyhow::Result<bool> {
        self.fail.check("delete")?;
        let mut rules = self.rules.write().await;
        if rules.get(&rule_id).is_some_and(|r| r.tenant_id == tenant_id) {
            rules.remove(&rule_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        status: RuleStatus,
    ) -> anyhow::Result<()> {
        self.fail.check("set_status")?;
        let mut rules = self.rules.write().await;
        match rules.get_mut(&rule_id) {
            Some(rule) if rule.tenant_id == tenant_id => {
                rule.status = status;
                Ok(())
            }
            _ => bail!("rule not found: {}", rule_id),
        }
    }

    async fn save_execution(&self, execution: &RuleExecution) -> anyhow::Result<()> {
        self.fail.check("save_execution")?;
        self.executions.write().await.push(execution.clone());
        Ok(())
    }

    async fn get_executions(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        filter: &ExecutionFilter,
    ) -> anyhow::Result<Vec<RuleExecution>> {
        self.fail.check("get_executions")?;
        let executions = self.executions.read().await;
        let mut matched: Vec<RuleExecution> = executions
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id && e.rule_id == rule_id && filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn get_execution_stats(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> anyhow::Result<ExecutionStats> {
        self.fail.check("get_execution_stats")?;
        let executions = self.executions.read().await;
        Ok(ExecutionStats::from_executions(
            executions
                .iter()
                .filter(|e| e.tenant_id == tenant_id && e.rule_id == rule_id),
        ))
    }
}
