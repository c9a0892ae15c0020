use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A shared string map whose readers can wait for a key to show up.
#[derive(Debug, Default)]
pub(super) struct KvStore {
    map: Mutex<HashMap<String, String>>,
    published: Notify,
}

impl KvStore {
    pub fn set(&self, key: String, value: String) {
        self.map.lock().insert(key, value);
        self.published.notify_waiters();
    }

    /// Returns the value under `key`, waiting until some writer sets it.
    pub async fn get(&self, key: &str) -> String {
        loop {
            // Registered before the lookup so a set in between still wakes us.
            let published = self.published.notified();

            let value = self.map.lock().get(key).cloned();
            if let Some(value) = value {
                return value;
            }

            published.await;
        }
    }
}
