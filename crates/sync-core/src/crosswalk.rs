use std::sync::Arc;

use serde_json::{json, Value};

use crate::store::StoreGateway;

fn local_key(local_id: &str) -> String {
    format!("sync:id_map:local:{local_id}")
}

fn ext_key(external_id: &str) -> String {
    format!("sync:id_map:ext:{external_id}")
}

fn etag_key(external_id: &str) -> String {
    format!("sync:etag:{external_id}")
}

/// Reads a crosswalk value tolerating legacy serializations: a plain
/// string, or a single-element JSON array wrapping one (an older write
/// path apparently round-tripped through a list type). New writes always
/// go out as a plain string.
fn read_legacy_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(mut items) if items.len() == 1 => match items.pop() {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

/// Persistent bijection between a local task id and a planner task id,
/// plus the ETag for that planner task (§3.3, §4.3). Every write that
/// must move more than one key together goes through one method here so
/// invariant 1 (`local:{L} = E` iff `ext:{E} = L`) never observes a torn
/// write from outside this module.
pub struct Crosswalk {
    store: Arc<StoreGateway>,
}

impl Crosswalk {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self { store }
    }

    pub async fn local_to_external(&self, local_id: &str) -> Option<String> {
        let value = self.store.get(&local_key(local_id)).await?;
        read_legacy_string(value)
    }

    pub async fn external_to_local(&self, external_id: &str) -> Option<String> {
        let value = self.store.get(&ext_key(external_id)).await?;
        read_legacy_string(value)
    }

    pub async fn etag(&self, external_id: &str) -> Option<String> {
        let value = self.store.get(&etag_key(external_id)).await?;
        read_legacy_string(value)
    }

    /// Writes both directions and the initial ETag in one multi-write
    /// (§4.3: "on first successful create ... in a single multi-write").
    pub async fn link(
        &self,
        local_id: &str,
        external_id: &str,
        etag: &str,
    ) -> anyhow::Result<()> {
        self.store
            .set(&local_key(local_id), json!(external_id), None)
            .await?;
        self.store
            .set(&ext_key(external_id), json!(local_id), None)
            .await?;
        self.store.set(&etag_key(external_id), json!(etag), None).await?;
        Ok(())
    }

    pub async fn set_etag(&self, external_id: &str, etag: &str) -> anyhow::Result<()> {
        self.store.set(&etag_key(external_id), json!(etag), None).await
    }

    /// Removes both directions and the ETag (§4.3 delete path).
    pub async fn unlink(&self, local_id: &str, external_id: &str) -> anyhow::Result<()> {
        self.store.delete(&local_key(local_id)).await?;
        self.store.delete(&ext_key(external_id)).await?;
        self.store.delete(&etag_key(external_id)).await?;
        Ok(())
    }

    /// Forward-only garbage collection: drops `local:{L} -> E` (and E's
    /// ETag) when the remote side is confirmed gone, without a matching
    /// reverse entry to clean up (§4.3: "if the remote is gone, the
    /// forward entry is garbage-collected by housekeeping").
    pub async fn gc_forward_entry(&self, local_id: &str, external_id: &str) -> anyhow::Result<()> {
        self.store.delete(&local_key(local_id)).await?;
        self.store.delete(&etag_key(external_id)).await?;
        Ok(())
    }

    /// Normalizes every `sync:id_map:*` key that's still in the legacy
    /// single-element-array shape to a plain string (§4.3, housekeeping
    /// §4.7.6). Returns how many keys were rewritten.
    pub async fn normalize_legacy_serializations(&self) -> anyhow::Result<usize> {
        let mut rewritten = 0;
        for prefix in ["sync:id_map:local:", "sync:id_map:ext:"] {
            for key in self.store.keys_with_prefix(prefix).await {
                if let Some(raw) = self.store.get(&key).await {
                    if matches!(raw, Value::Array(_)) {
                        if let Some(plain) = read_legacy_string(raw) {
                            self.store.set(&key, json!(plain), None).await?;
                            rewritten += 1;
                        }
                    }
                }
            }
        }
        Ok(rewritten)
    }

    /// Invariant 1 check: both directions exist and agree (§8).
    pub async fn is_consistent(&self, local_id: &str, external_id: &str) -> bool {
        self.local_to_external(local_id).await.as_deref() == Some(external_id)
            && self.external_to_local(external_id).await.as_deref() == Some(local_id)
    }

    /// Sweeps every `local:{L} -> E` entry whose reverse `ext:{E} -> L`
    /// has gone missing or now points elsewhere — the mapping is orphaned,
    /// so its ETag can never be read back through `external_to_local` again
    /// (§4.7.6: "delete ETags whose keys have no surviving crosswalk
    /// entry"). Returns how many forward entries were collected.
    pub async fn gc_orphaned_forward_entries(&self) -> anyhow::Result<usize> {
        let mut collected = 0;
        for key in self.store.keys_with_prefix("sync:id_map:local:").await {
            let Some(local_id) = key.strip_prefix("sync:id_map:local:") else {
                continue;
            };
            let Some(external_id) = self.local_to_external(local_id).await else {
                continue;
            };
            if self.external_to_local(&external_id).await.as_deref() != Some(local_id) {
                self.gc_forward_entry(local_id, &external_id).await?;
                collected += 1;
            }
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn temp_store() -> Arc<StoreGateway> {
        let path = std::env::temp_dir().join(format!("sync-core-crosswalk-{}.json", Uuid::new_v4()));
        Arc::new(StoreGateway::new(path).await.expect("store"))
    }

    #[tokio::test]
    async fn link_writes_both_directions_and_etag() {
        let crosswalk = Crosswalk::new(temp_store().await);
        crosswalk.link("L1", "E1", "W/\"v1\"").await.unwrap();
        assert_eq!(crosswalk.local_to_external("L1").await.as_deref(), Some("E1"));
        assert_eq!(crosswalk.external_to_local("E1").await.as_deref(), Some("L1"));
        assert_eq!(crosswalk.etag("E1").await.as_deref(), Some("W/\"v1\""));
        assert!(crosswalk.is_consistent("L1", "E1").await);
    }

    #[tokio::test]
    async fn unlink_removes_every_key() {
        let crosswalk = Crosswalk::new(temp_store().await);
        crosswalk.link("L1", "E1", "W/\"v1\"").await.unwrap();
        crosswalk.unlink("L1", "E1").await.unwrap();
        assert_eq!(crosswalk.local_to_external("L1").await, None);
        assert_eq!(crosswalk.external_to_local("E1").await, None);
        assert_eq!(crosswalk.etag("E1").await, None);
    }

    #[tokio::test]
    async fn legacy_array_serialization_is_tolerated_on_read() {
        let store = temp_store().await;
        store
            .set("sync:id_map:local:L2", json!(["E2"]), None)
            .await
            .unwrap();
        let crosswalk = Crosswalk::new(store);
        assert_eq!(crosswalk.local_to_external("L2").await.as_deref(), Some("E2"));
    }

    #[tokio::test]
    async fn normalize_rewrites_legacy_arrays_to_plain_strings() {
        let store = temp_store().await;
        store
            .set("sync:id_map:local:L3", json!(["E3"]), None)
            .await
            .unwrap();
        let crosswalk = Crosswalk::new(store.clone());
        let rewritten = crosswalk.normalize_legacy_serializations().await.unwrap();
        assert_eq!(rewritten, 1);
        assert_eq!(store.get("sync:id_map:local:L3").await, Some(json!("E3")));
    }

    #[tokio::test]
    async fn gc_collects_forward_entries_whose_reverse_mapping_is_gone() {
        let store = temp_store().await;
        let crosswalk = Crosswalk::new(store.clone());
        crosswalk.link("L1", "E1", "W/\"v1\"").await.unwrap();
        // Simulate the reverse half vanishing (e.g. E1 reassigned elsewhere)
        // without going through `unlink`, leaving the forward side orphaned.
        store.delete(&ext_key("E1")).await.unwrap();

        let collected = crosswalk.gc_orphaned_forward_entries().await.unwrap();
        assert_eq!(collected, 1);
        assert_eq!(crosswalk.local_to_external("L1").await, None);
        assert_eq!(crosswalk.etag("E1").await, None);
    }

    #[tokio::test]
    async fn gc_leaves_consistent_entries_untouched() {
        let store = temp_store().await;
        let crosswalk = Crosswalk::new(store);
        crosswalk.link("L1", "E1", "W/\"v1\"").await.unwrap();

        let collected = crosswalk.gc_orphaned_forward_entries().await.unwrap();
        assert_eq!(collected, 0);
        assert!(crosswalk.is_consistent("L1", "E1").await);
    }
}
