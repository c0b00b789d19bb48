//! The background listing refresher.
//!
//! One worker at a time refreshes the cached bucket listing. `kick` is
//! fire-and-forget; `wait` blocks until some refresh that was in flight
//! at (or started after) the call completes. Completion is published as a
//! generation counter over a watch channel.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
pub struct Syncher {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    running: Mutex<bool>,
    generation: watch::Sender<u64>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            running: Mutex::new(false),
            generation: watch::Sender::new(0),
        }
    }
}

impl Syncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `work` in the background unless a refresh is already running.
    pub fn kick<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut running = self.inner.running.lock().unwrap();
            if *running {
                return;
            }
            *running = true;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            work.await;
            *inner.running.lock().unwrap() = false;
            inner.generation.send_modify(|g| *g += 1);
        });
    }

    /// Block until a refresh completes; the in-flight one counts, and one
    /// is started if nothing is running.
    pub async fn wait<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.inner.generation.subscribe();
        let start = *rx.borrow_and_update();
        self.kick(work);
        while *rx.borrow_and_update() <= start {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
