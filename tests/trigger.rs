mod common;

use common::{rule, TestEngine, TENANT};
use rule_engine::{InboundEvent, Rule, TriggerConsumer, TriggerOutcome};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use uuid::Uuid;

fn pump_rule(id: Uuid, config: Value) -> Rule {
    let mut rule = rule(
        id,
        json!([{"id": "save", "type": "save-timeseries"}]),
        &[],
        config,
    );
    rule.applies_to_asset_types = vec!["Pump".to_string()];
    rule
}

fn pump_event(asset: &str, temperature: i64) -> InboundEvent {
    let data = json!({"temperature": temperature});
    InboundEvent::new(asset, Some("Pump"), data.as_object().cloned().unwrap())
}

async fn join_all(handles: Vec<JoinHandle<TriggerOutcome>>) -> Vec<TriggerOutcome> {
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(assert_ok!(handle.await));
    }
    outcomes
}

#[tokio::test(start_paused = true)]
async fn test_debounce_admits_only_latest_trigger() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({"debounceMs": 1000}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let mut handles = consumer.dispatch(pump_event("pump-1", 70)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handles.extend(consumer.dispatch(pump_event("pump-1", 71)).await);

    let outcomes = join_all(handles).await;
    let reports: Vec<_> = outcomes.iter().filter_map(TriggerOutcome::report).collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].execution.trigger_data["temperature"], json!(71));

    let points = env.backends.timeseries.points().await;
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].values["temperature"], json!(71));

    let stats = env.engine.execution_stats(TENANT, id).await.unwrap();
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.debounced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_runs_once_per_window_under_continuous_input() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({"debounceMs": 1000}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    // 10 Hz 持续 5 秒
    let mut handles = Vec::new();
    for tick in 0..50 {
        handles.extend(consumer.dispatch(pump_event("pump-1", 60 + tick)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let during = env.repository.executions().await.len();
    assert!((4..=5).contains(&during), "executions while streaming: {}", during);

    join_all(handles).await;
    let points = env.backends.timeseries.points().await;
    assert_eq!(points.len(), 5);
    assert_eq!(points.last().unwrap().values["temperature"], json!(109));

    let stats = env.engine.execution_stats(TENANT, id).await.unwrap();
    assert_eq!(stats.total_executions, 5);
    assert_eq!(stats.debounced, 45);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_does_not_coalesce_different_assets() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({"debounceMs": 1000}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let mut handles = consumer.dispatch(pump_event("pump-1", 70)).await;
    handles.extend(consumer.dispatch(pump_event("pump-2", 70)).await);

    let outcomes = join_all(handles).await;
    assert!(outcomes.iter().all(|o| o.report().is_some()));
}

#[tokio::test]
async fn test_rate_limit_throttles_beyond_cap() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({"maxExecutionsPerMinute": 2}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let mut outcomes = Vec::new();
    for temperature in [60, 61, 62] {
        let handles = consumer.dispatch(pump_event("pump-1", temperature)).await;
        outcomes.extend(join_all(handles).await);
    }

    let executed = outcomes.iter().filter(|o| o.report().is_some()).count();
    let throttled = outcomes
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::Throttled))
        .count();
    assert_eq!((executed, throttled), (2, 1));

    let stats = env.engine.execution_stats(TENANT, id).await.unwrap();
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.throttled, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_only_matching_active_rules_are_triggered() {
    let pumps = Uuid::new_v4();
    let valves = Uuid::new_v4();
    let mut valve_rule = pump_rule(valves, json!({}));
    valve_rule.applies_to_asset_types = vec!["Valve".to_string()];

    let env = TestEngine::new(vec![pump_rule(pumps, json!({})), valve_rule]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let outcomes = join_all(consumer.dispatch(pump_event("pump-1", 50)).await).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].report().unwrap().execution.rule_id, pumps);

    let unknown = InboundEvent::new("x-1", Some("Compressor"), Default::default());
    assert!(consumer.dispatch(unknown).await.is_empty());
}

#[tokio::test]
async fn test_run_consumes_stream_until_end() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let events = vec![
        pump_event("pump-1", 40),
        pump_event("pump-2", 41),
        InboundEvent::new("valve-1", Some("Valve"), Default::default()),
    ];
    let processed = consumer.run(futures::stream::iter(events)).await;

    assert_eq!(processed, 3);
    assert_eq!(env.repository.executions().await.len(), 2);
    assert_eq!(env.backends.timeseries.points().await.len(), 2);
}

#[tokio::test]
async fn test_shutdown_stops_idle_consumer() {
    let env = TestEngine::new(Vec::new()).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let runner = tokio::spawn({
        let consumer = consumer.clone();
        async move {
            consumer
                .run(futures::stream::pending::<InboundEvent>())
                .await
        }
    });
    consumer.shutdown();

    let processed = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("consumer did not stop");
    assert_eq!(assert_ok!(processed), 0);
}

#[tokio::test]
async fn test_decoded_event_drives_execution() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let event = InboundEvent::from_json(
        r#"{"thingId": "pump-9", "entityType": "Pump", "gatewayId": "gw-1", "rpm": 1450}"#,
    )
    .unwrap();
    let outcomes = join_all(consumer.dispatch(event).await).await;

    let report = outcomes[0].report().unwrap();
    assert_eq!(report.execution.asset_id.as_deref(), Some("pump-9"));
    let points = env.backends.timeseries.points().await;
    assert_eq!(points[0].asset_id, "pump-9");
    assert_eq!(points[0].values["rpm"], json!(1450));
    assert!(!points[0].values.contains_key("entityType"));
    assert_eq!(report.outputs[0].data["entityType"], json!("Pump"));
}

#[tokio::test]
async fn test_event_channel_feeds_consumer() {
    let id = Uuid::new_v4();
    let env = TestEngine::new(vec![pump_rule(id, json!({}))]).await;
    let consumer = TriggerConsumer::new(env.engine.clone());

    let (tx, events) = consumer.event_channel();
    let runner = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(events).await }
    });

    assert_ok!(tx.send(pump_event("pump-1", 55)).await);
    assert_ok!(tx.send(pump_event("pump-2", 56)).await);
    drop(tx);

    assert_eq!(assert_ok!(runner.await), 2);
    assert_eq!(env.repository.executions().await.len(), 2);
}
