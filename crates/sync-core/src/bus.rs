use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 2048;

/// The in-process pub/sub backbone (§6): named channels such as
/// `tasks:updates`, `bus:planner:webhook`, `bus:chat:webhook`. Channels
/// are created lazily on first publish or subscribe.
#[derive(Clone)]
pub struct Bus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns `false` when the send found no subscribers (§4.6 step 4:
    /// a publish failure here is logged by the caller and re-queued to
    /// `sync:pending` rather than dropped).
    pub async fn publish(&self, channel: &str, payload: Value) -> bool {
        let sender = self.sender_for(channel).await;
        sender.send(payload).is_ok()
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.sender_for(channel).await.subscribe()
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<Value> {
        if let Some(sender) = self.channels.read().await.get(channel) {
            return sender.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

pub mod channels {
    pub const TASKS_UPDATES: &str = "tasks:updates";
    pub const PLANNER_WEBHOOK: &str = "bus:planner:webhook";
    pub const CHAT_WEBHOOK: &str = "bus:chat:webhook";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(channels::TASKS_UPDATES).await;
        bus.publish(channels::TASKS_UPDATES, json!({"local_id": "T1"}))
            .await;
        let received = rx.recv().await.expect("payload");
        assert_eq!(received["local_id"], "T1");
    }

    #[tokio::test]
    async fn publish_reports_whether_anyone_received_it() {
        let bus = Bus::new();
        assert!(!bus.publish(channels::TASKS_UPDATES, json!({})).await);
        let _rx = bus.subscribe(channels::TASKS_UPDATES).await;
        assert!(bus.publish(channels::TASKS_UPDATES, json!({})).await);
    }

    #[tokio::test]
    async fn distinct_channels_do_not_cross_talk() {
        let bus = Bus::new();
        let mut planner_rx = bus.subscribe(channels::PLANNER_WEBHOOK).await;
        bus.publish(channels::CHAT_WEBHOOK, json!({"hello": "chat"}))
            .await;
        assert!(planner_rx.try_recv().is_err());
    }
}
