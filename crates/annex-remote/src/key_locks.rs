//! Per-key exclusive locks.
//!
//! A mutex-guarded set plus a notifier: acquiring loops until the key is
//! absent, inserts it, and the guard removes it and wakes every waiter on
//! drop. Operations on distinct keys proceed in parallel; operations on
//! the same key form a total order.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<String>>,
    notify: Notify,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it for the guard's lifetime.
    pub async fn acquire(&self, key: &str) -> KeyGuard<'_> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a release between the check and
            // the await cannot be missed
            notified.as_mut().enable();
            if self.held.lock().unwrap().insert(key.to_string()) {
                return KeyGuard {
                    locks: self,
                    key: key.to_string(),
                };
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let removed = self.locks.held.lock().unwrap().remove(&self.key);
        debug_assert!(removed, "released a key that was not held");
        self.locks.notify.notify_waiters();
    }
}
