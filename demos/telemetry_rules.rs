use rule_engine::collaborators::memory::InMemoryRuleRepository;
use rule_engine::collaborators::{Collaborators, RuleRepository};
use rule_engine::utils::init_tracing;
use rule_engine::{builtin_registry, EngineConfig, InboundEvent, Rule, RuleEngine, TriggerConsumer};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const RULE: &str = r#"{
    "id": "3f2504e0-4f89-11d3-9a0c-0305e82c3301",
    "tenantId": "demo",
    "name": "高温告警",
    "appliesToAssetTypes": ["Pump"],
    "status": "ACTIVE",
    "priority": 10,
    "config": { "maxExecutionsPerMinute": 100, "timeoutMs": 5000 },
    "nodes": [
        { "id": "hot", "type": "threshold-filter",
          "config": { "field": "temperature", "operator": ">", "threshold": 75 } },
        { "id": "severity", "type": "switch",
          "config": {
              "cases": [ { "name": "critical", "condition": "msg.temperature > 90" } ],
              "defaultRoute": "major"
          } },
        { "id": "alarm-critical", "type": "create-alarm",
          "config": { "alarmType": "HighTemperature", "severity": "CRITICAL" } },
        { "id": "alarm-major", "type": "create-alarm",
          "config": { "alarmType": "HighTemperature", "severity": "MAJOR" } },
        { "id": "notify", "type": "publish",
          "config": { "topic": "alerts/${assetId}", "keyField": "assetId" } },
        { "id": "log", "type": "log",
          "config": { "template": "告警已发布: ${data.assetId} ${data.temperature}°C" } }
    ],
    "connections": [
        { "fromNode": "hot", "toNode": "severity" },
        { "fromNode": "severity", "fromPort": "critical", "toNode": "alarm-critical" },
        { "fromNode": "severity", "fromPort": "major", "toNode": "alarm-major" },
        { "fromNode": "alarm-critical", "toNode": "notify" },
        { "fromNode": "alarm-major", "toNode": "notify" },
        { "fromNode": "notify", "toNode": "log" }
    ]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::load()?;
    init_tracing(&config.log_filter);

    let (collaborators, backends) = Collaborators::in_memory();
    let repository = Arc::new(InMemoryRuleRepository::new());
    let rule = Rule::from_json(RULE)?;
    let rule_id = rule.id;
    repository.create(rule).await?;

    let engine = Arc::new(RuleEngine::new(
        config,
        builtin_registry(),
        collaborators,
        repository.clone(),
    )?);
    engine.start().await?;
    info!("已加载 {} 条活动规则", engine.catalog().len().await);

    let events = [
        ("pump-1", 60),
        ("pump-2", 82),
        ("pump-3", 97),
    ]
    .into_iter()
    .map(|(asset, temperature)| {
        let data = json!({ "temperature": temperature });
        InboundEvent::new(asset, Some("Pump"), data.as_object().cloned().unwrap_or_default())
    });

    let consumer = TriggerConsumer::new(engine.clone());
    let processed = consumer.run(futures::stream::iter(events)).await;
    info!("处理事件 {} 条", processed);

    for stored in backends.alarms.alarms().await {
        info!(
            "告警 {} {} {}",
            stored.alarm.asset_id, stored.alarm.alarm_type, stored.alarm.severity
        );
    }
    for published in backends.bus.published().await {
        info!("发布 {} -> {}", published.topic, published.payload);
    }

    let stats = engine.execution_stats("demo", rule_id).await?;
    info!(
        "执行 {} 次, 成功率 {:.0}%, 平均耗时 {:.1}ms",
        stats.total_executions,
        stats.success_rate * 100.0,
        stats.average_duration_ms
    );

    Ok(())
}
