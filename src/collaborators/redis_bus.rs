use super::MessageBus;
use crate::trigger::InboundEvent;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// 基于 Redis PUBLISH 的消息总线
///
/// Redis 频道没有分区键,带 key 的消息以 `{key, payload}` 信封发布。
#[derive(Clone)]
pub struct RedisMessageBus {
    conn: ConnectionManager,
}

impl RedisMessageBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn envelope(key: Option<&str>, payload: Value) -> Value {
    match key {
        Some(key) => json!({ "key": key, "payload": payload }),
        None => payload,
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Value) -> anyhow::Result<()> {
        let body = envelope(key, payload);
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(topic, body.to_string()).await?;
        debug!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }
}

/// Redis pub/sub 入站事件流
pub struct RedisEventStream {
    client: Client,
}

impl RedisEventStream {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::open(url)?,
        })
    }

    /// 订阅频道,无法解码的消息记录告警后跳过
    pub async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, InboundEvent>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to read payload from {}: {}", msg.get_channel_name(), e);
                        return None;
                    }
                };
                match InboundEvent::from_json(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!("Dropping undecodable event: {}", e);
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_payload_is_wrapped() {
        let payload = json!({"alarm": "HighTemperature"});
        assert_eq!(
            envelope(Some("pump-1"), payload.clone()),
            json!({"key": "pump-1", "payload": {"alarm": "HighTemperature"}})
        );
        assert_eq!(envelope(None, payload.clone()), payload);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisEventStream::new("not-a-redis-url").is_err());
    }
}
