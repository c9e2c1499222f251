use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Thin typed wrapper over an in-memory key/value map mirrored to a JSON
/// file, the only thing other components are allowed to touch (§2). Keys
/// follow the flat, colon-namespaced patterns in §3.3; lists and sets are
/// both represented as plain `Value` entries (`Array`) so one map covers
/// every shape the contract needs.
pub struct StoreGateway {
    path: PathBuf,
    entries: RwLock<HashMap<String, Entry>>,
    /// Notified on every `push`, so `pop_front_blocking` can wake without
    /// polling (grounds the pending-op worker's 5s blocking pop, §4.7.5).
    push_notify: Arc<Notify>,
}

impl StoreGateway {
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path).await?;
            serde_json::from_str::<HashMap<String, Entry>>(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            push_notify: Arc::new(Notify::new()),
        })
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<StdDuration>) -> anyhow::Result<()> {
        let expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        self.flush().await
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.write().await.remove(key);
        self.flush().await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Appends `value` to the JSON array at `key` (creating it if absent)
    /// and wakes any blocked `pop_front_blocking` caller.
    pub async fn push(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Array(Vec::new()),
            expires_at: None,
        });
        let array = entry.value.as_array_mut().context("key does not hold a list")?;
        array.push(value);
        drop(entries);
        self.push_notify.notify_waiters();
        self.flush().await
    }

    pub async fn list_len(&self, key: &str) -> usize {
        self.get(key)
            .await
            .and_then(|v| v.as_array().map(|a| a.len()))
            .unwrap_or(0)
    }

    fn pop_front_now(&self, entries: &mut HashMap<String, Entry>, key: &str) -> Option<Value> {
        let entry = entries.get_mut(key)?;
        let array = entry.value.as_array_mut()?;
        if array.is_empty() {
            None
        } else {
            Some(array.remove(0))
        }
    }

    /// Blocking pop with a timeout (§4.7.5): returns `None` if nothing
    /// arrived before the deadline, `Some(item)` otherwise.
    pub async fn pop_front_blocking(&self, key: &str, timeout: StdDuration) -> Option<Value> {
        {
            let mut entries = self.entries.write().await;
            if let Some(item) = self.pop_front_now(&mut entries, key) {
                drop(entries);
                let _ = self.flush().await;
                return Some(item);
            }
        }
        let notified = self.push_notify.notified();
        tokio::select! {
            _ = notified => {
                let mut entries = self.entries.write().await;
                let item = self.pop_front_now(&mut entries, key);
                drop(entries);
                if item.is_some() {
                    let _ = self.flush().await;
                }
                item
            }
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    /// Adds `member` to the string-set stored at `key` (dedup on insert).
    pub async fn set_add(&self, key: &str, member: &str, ttl: Option<StdDuration>) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let expires_at =
            ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Array(Vec::new()),
            expires_at,
        });
        entry.expires_at = expires_at;
        let array = entry.value.as_array_mut().context("key does not hold a set")?;
        if !array.iter().any(|v| v.as_str() == Some(member)) {
            array.push(Value::String(member.to_string()));
        }
        drop(entries);
        self.flush().await
    }

    pub async fn set_contains(&self, key: &str, member: &str) -> bool {
        self.get(key)
            .await
            .and_then(|v| v.as_array().map(|a| a.iter().any(|m| m.as_str() == Some(member))))
            .unwrap_or(false)
    }

    /// Trims the bounded FIFO list at `key` to at most `max_len` entries,
    /// dropping the oldest first (§8 invariant 4, `sync:failed`).
    pub async fn trim_list_front(&self, key: &str, max_len: usize) -> anyhow::Result<usize> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(0);
        };
        let Some(array) = entry.value.as_array_mut() else {
            return Ok(0);
        };
        let overflow = array.len().saturating_sub(max_len);
        if overflow > 0 {
            array.drain(0..overflow);
        }
        drop(entries);
        if overflow > 0 {
            self.flush().await?;
        }
        Ok(overflow)
    }

    /// Removes every expired entry; returns how many keys were dropped.
    pub async fn sweep_expired(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.entries.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.path, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    async fn temp_store() -> StoreGateway {
        let path = std::env::temp_dir().join(format!("sync-core-store-{}.json", Uuid::new_v4()));
        StoreGateway::new(path).await.expect("store")
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = temp_store().await;
        store.set("sync:etag:E1", json!("W/\"abc\""), None).await.unwrap();
        assert_eq!(store.get("sync:etag:E1").await, Some(json!("W/\"abc\"")));
    }

    #[tokio::test]
    async fn ttl_expiry_hides_the_value() {
        let store = temp_store().await;
        store
            .set("sync:health", json!({"status": "starting"}), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("sync:health").await, None);
    }

    #[tokio::test]
    async fn push_and_blocking_pop_round_trip() {
        let store = temp_store().await;
        store.push("sync:pending", json!({"op_id": "op-1"})).await.unwrap();
        let popped = store
            .pop_front_blocking("sync:pending", Duration::from_secs(1))
            .await;
        assert_eq!(popped, Some(json!({"op_id": "op-1"})));
    }

    #[tokio::test]
    async fn blocking_pop_times_out_on_empty_queue() {
        let store = temp_store().await;
        let popped = store
            .pop_front_blocking("sync:pending", Duration::from_millis(20))
            .await;
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn failed_list_trims_to_bound() {
        let store = temp_store().await;
        for i in 0..5 {
            store.push("sync:failed", json!({"op_id": format!("op-{i}")})).await.unwrap();
        }
        let trimmed = store.trim_list_front("sync:failed", 3).await.unwrap();
        assert_eq!(trimmed, 2);
        assert_eq!(store.list_len("sync:failed").await, 3);
    }

    #[tokio::test]
    async fn set_add_is_idempotent() {
        let store = temp_store().await;
        store.set_add("planner:inaccessible_plans", "plan-1", None).await.unwrap();
        store.set_add("planner:inaccessible_plans", "plan-1", None).await.unwrap();
        assert_eq!(store.list_len("planner:inaccessible_plans").await, 1);
        assert!(store.set_contains("planner:inaccessible_plans", "plan-1").await);
    }
}
