#![allow(dead_code)]

use rule_engine::collaborators::memory::{InMemoryRuleRepository, MemoryBackends};
use rule_engine::collaborators::RuleRepository;
use rule_engine::{builtin_registry, EngineConfig, Message, Rule, RuleEngine};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const TENANT: &str = "t1";

pub struct TestEngine {
    pub engine: Arc<RuleEngine>,
    pub backends: MemoryBackends,
    pub repository: Arc<InMemoryRuleRepository>,
}

impl TestEngine {
    pub async fn new(rules: Vec<Rule>) -> Self {
        Self::with_config(EngineConfig::default(), rules).await
    }

    /// 写入规则并加载活动规则
    pub async fn with_config(config: EngineConfig, rules: Vec<Rule>) -> Self {
        let backends = MemoryBackends::default();
        let repository = Arc::new(InMemoryRuleRepository::new());
        for rule in rules {
            repository.create(rule).await.unwrap();
        }
        let engine = RuleEngine::new(
            config,
            builtin_registry(),
            backends.collaborators(),
            repository.clone(),
        )
        .unwrap();
        engine.catalog().reload().await.unwrap();

        Self {
            engine: Arc::new(engine),
            backends,
            repository,
        }
    }
}

/// 构造 ACTIVE 规则,连接写作 `[from, port, to]`
pub fn rule(id: Uuid, nodes: Value, connections: &[(&str, &str, &str)], config: Value) -> Rule {
    let connections: Vec<Value> = connections
        .iter()
        .map(|(from, port, to)| json!({"fromNode": from, "fromPort": port, "toNode": to}))
        .collect();

    serde_json::from_value(json!({
        "id": id,
        "tenantId": TENANT,
        "name": format!("rule-{}", id),
        "status": "ACTIVE",
        "nodes": nodes,
        "connections": connections,
        "config": config
    }))
    .unwrap()
}

pub fn telemetry(data: Value) -> Message {
    Message::from_value("telemetry", data)
}
