//! 触发层
//!
//! 消费入站事件流,为每个匹配的活动规则派生独立的执行任务。
//! 防抖、限流和并发许可都在任务内部完成,消费循环本身从不等待执行。

mod admission;
mod event;

pub use admission::{Debouncer, RateLimiter};
pub use event::InboundEvent;

use crate::engine::{ExecutionReport, RuleEngine, RuleGraph};
use crate::types::{Message, TriggerType};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// 单个触发的处理结果
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Executed(ExecutionReport),
    /// 并入同一 (规则, 资产) 已开启的防抖窗口
    Debounced,
    /// 超过每分钟执行上限
    Throttled,
}

impl TriggerOutcome {
    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            TriggerOutcome::Executed(report) => Some(report),
            _ => None,
        }
    }
}

/// 防抖窗口内等待执行的触发
struct PendingTrigger {
    graph: Arc<RuleGraph>,
    trigger: Message,
    trigger_type: TriggerType,
}

/// 入站事件消费者
#[derive(Clone)]
pub struct TriggerConsumer {
    engine: Arc<RuleEngine>,
    debouncer: Arc<Debouncer<PendingTrigger>>,
    limiter: Arc<RateLimiter>,
    permits: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TriggerConsumer {
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        let config = engine.config();
        let limiter = RateLimiter::new(Duration::from_millis(config.rate_limit_window_ms));
        let permits = Semaphore::new(config.max_concurrent_executions);
        let (shutdown, _) = watch::channel(false);

        Self {
            engine,
            debouncer: Arc::new(Debouncer::new()),
            limiter: Arc::new(limiter),
            permits: Arc::new(permits),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    /// 为事件匹配的每条活动规则派生一个执行任务
    pub async fn dispatch(&self, event: InboundEvent) -> Vec<JoinHandle<TriggerOutcome>> {
        let trigger_type = event.trigger_type();
        let candidates = self
            .engine
            .catalog()
            .candidates(
                event.entity_type.as_deref(),
                event.asset_id.as_deref(),
                &trigger_type,
            )
            .await;

        if candidates.is_empty() {
            debug!(
                "No active rule for asset {:?} ({:?})",
                event.asset_id, event.entity_type
            );
            return Vec::new();
        }

        let trigger = event.to_message();
        let asset_key = event.asset_id.unwrap_or_default();
        candidates
            .into_iter()
            .map(|graph| self.spawn_trigger(graph, trigger.clone(), asset_key.clone(), trigger_type.clone()))
            .collect()
    }

    fn spawn_trigger(
        &self,
        graph: Arc<RuleGraph>,
        trigger: Message,
        asset_key: String,
        trigger_type: TriggerType,
    ) -> JoinHandle<TriggerOutcome> {
        let consumer = self.clone();
        let rule = graph.rule();
        let (rule_id, window) = (rule.id, Duration::from_millis(rule.config.debounce_ms));
        let span = tracing::debug_span!("trigger", rule_id = %rule_id, asset = %asset_key);
        let pending = PendingTrigger {
            graph,
            trigger,
            trigger_type,
        };

        tokio::spawn(
            async move {
                let accounting = consumer.engine.accounting();

                // 并入窗口的触发由开启窗口的任务执行
                let Some(PendingTrigger {
                    graph,
                    trigger,
                    trigger_type,
                }) = consumer
                    .debouncer
                    .admit(rule_id, &asset_key, window, pending)
                    .await
                else {
                    debug!("Trigger coalesced into the open debounce window");
                    accounting.record_debounced(rule_id);
                    return TriggerOutcome::Debounced;
                };

                let rule = graph.rule();
                if !consumer
                    .limiter
                    .try_acquire(rule.id, rule.config.max_executions_per_minute)
                {
                    info!(
                        "Rule {} throttled at {} executions per window",
                        rule.id, rule.config.max_executions_per_minute
                    );
                    accounting.record_throttled(rule.id);
                    return TriggerOutcome::Throttled;
                }

                // 许可在任务内获取,不阻塞消费循环;信号量不会被关闭
                let _permit = consumer.permits.acquire().await.ok();
                let report = consumer.engine.execute(&graph, trigger, trigger_type).await;
                TriggerOutcome::Executed(report)
            }
            .instrument(span),
        )
    }

    /// 容量为 `event_buffer` 的有界事件通道,发送端满时由生产者等待
    pub fn event_channel(&self) -> (mpsc::Sender<InboundEvent>, impl Stream<Item = InboundEvent>) {
        let (tx, rx) = mpsc::channel(self.engine.config().event_buffer.max(1));
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        (tx, stream)
    }

    /// 持续消费事件流,直到流结束或调用 [`shutdown`](Self::shutdown)
    ///
    /// 返回前等待已派生的执行任务结束,返回处理的事件数。
    pub async fn run<S>(&self, events: S) -> usize
    where
        S: Stream<Item = InboundEvent> + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut events = std::pin::pin!(events);
        let mut in_flight: Vec<JoinHandle<TriggerOutcome>> = Vec::new();
        let mut processed = 0;

        info!("Trigger consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Trigger consumer shutting down");
                        break;
                    }
                }
                event = events.next() => {
                    let Some(event) = event else {
                        info!("Event stream ended");
                        break;
                    };
                    processed += 1;
                    in_flight.retain(|handle| !handle.is_finished());
                    in_flight.extend(self.dispatch(event).await);
                }
            }
        }

        for handle in in_flight {
            if let Err(e) = handle.await {
                warn!("Execution task aborted: {}", e);
            }
        }
        processed
    }

    /// 通知 [`run`](Self::run) 停止消费
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for TriggerConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerConsumer")
            .field("available_permits", &self.permits.available_permits())
            .field("pending_debounce", &self.debouncer.pending())
            .finish()
    }
}
