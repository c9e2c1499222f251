use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;

const CAPACITY: usize = 4096;

/// Bounded LRU-by-insertion set over `(resource, changeType, id, etag)`
/// notification keys (§4.6). A duplicate notification within the window
/// is dropped before it ever reaches the bus.
pub struct DedupWindow {
    inner: Mutex<Window>,
}

struct Window {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Window {
                order: VecDeque::with_capacity(CAPACITY),
                seen: HashSet::with_capacity(CAPACITY),
            }),
        }
    }

    /// Returns `true` the first time a key is seen, `false` on repeats.
    pub async fn admit(&self, key: &str) -> bool {
        let mut window = self.inner.lock().await;
        if window.seen.contains(key) {
            return false;
        }
        if window.order.len() >= CAPACITY {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        window.order.push_back(key.to_string());
        window.seen.insert(key.to_string());
        true
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}
