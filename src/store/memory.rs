//! In-process store, used when no database is configured and in tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use super::{RoomStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    states: DashMap<String, String>,
    logic: DashMap<String, String>,
    saves: AtomicUsize,
    failing_saves: AtomicUsize,
    save_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful state saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make the next `n` state saves fail
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Hold the next state save for `delay` before it is written
    pub fn delay_next_save(&self, delay: Duration) {
        *self.save_delay.lock() = Some(delay);
    }

    pub fn state(&self, room_id: &str) -> Option<String> {
        self.states.get(room_id).map(|blob| blob.clone())
    }
}

impl RoomStore for MemoryStore {
    fn load<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        async move { Ok(self.state(room_id)) }.boxed()
    }

    fn save<'a>(&'a self, room_id: &'a str, blob: String) -> BoxFuture<'a, Result<(), StoreError>> {
        let delay = self.save_delay.lock().take();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failing = self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("injected save failure".into()));
            }
            self.states.insert(room_id.to_string(), blob);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn load_logic<'a>(
        &'a self,
        room_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        async move { Ok(self.logic.get(room_id).map(|source| source.clone())) }.boxed()
    }

    fn save_logic<'a>(
        &'a self,
        room_id: &'a str,
        source: String,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.logic.insert(room_id.to_string(), source);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_are_counted_and_failures_injected() {
        let store = MemoryStore::new();
        assert!(store.load("lobby").await.unwrap().is_none());

        store.fail_next_saves(1);
        assert!(store.save("lobby", "{}".into()).await.is_err());
        assert_eq!(store.save_count(), 0);

        store.save("lobby", "{\"tick\":1}".into()).await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load("lobby").await.unwrap().as_deref(), Some("{\"tick\":1}"));
    }

    #[tokio::test]
    async fn logic_is_stored_separately() {
        let store = MemoryStore::new();
        store.save_logic("lobby", "fn init(room) {}".into()).await.unwrap();
        assert!(store.load("lobby").await.unwrap().is_none());
        assert!(store.load_logic("lobby").await.unwrap().is_some());
    }
}
