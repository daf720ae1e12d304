//! Shared key/value store for nodes of one tree (or one forest, for the
//! shared variant).
//!
//! Reads and writes are atomic behind an async `RwLock`. Change
//! notifications go through the event bus rather than being invoked inline,
//! so watchers never run while the write lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::event::{EventBus, Subscription};
use crate::{value_map, Value};

/// Topic carrying `{key, old, new}` payloads after each successful write.
pub const CHANGED: &str = "blackboard.changed";

#[derive(Clone, Default)]
pub struct Blackboard {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    map: RwLock<HashMap<String, Value>>,
    events: std::sync::Mutex<Option<EventBus>>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A blackboard that reports writes on `events`.
    pub fn with_events(events: EventBus) -> Self {
        let board = Self::default();
        *board.shared.events.lock().unwrap() = Some(events);
        board
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.shared.map.read().await.get(key).cloned()
    }

    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).await.unwrap_or(default)
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let old = {
            let mut map = self.shared.map.write().await;
            map.insert(key.to_owned(), value.clone())
        };
        self.notify(key, old, value);
    }

    pub async fn has(&self, key: &str) -> bool {
        self.shared.map.read().await.contains_key(key)
    }

    /// Remove a key, reporting the change with a nil new value.
    pub async fn remove(&self, key: &str) -> Option<Value> {
        let old = self.shared.map.write().await.remove(key);
        if old.is_some() {
            self.notify(key, old.clone(), Value::Nil);
        }
        old
    }

    pub async fn keys(&self) -> Vec<String> {
        self.shared.map.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.map.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.shared.map.write().await.clear();
    }

    /// Invoke `handler` after every successful write to `key`. Dispatch runs
    /// on the event bus; the handler receives `(old, new)`, with nil standing
    /// in for an absent or removed value.
    pub fn on_change<F, Fut>(&self, key: &str, handler: F) -> Option<Subscription>
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let events = self.shared.events.lock().unwrap().clone()?;
        let key = key.to_owned();
        Some(events.on(CHANGED, move |event| {
            let matches = event.payload.get("key").and_then(Value::as_str) == Some(key.as_str());
            let old = event.payload.get("old").cloned().unwrap_or_default();
            let new = event.payload.get("new").cloned().unwrap_or_default();
            let fut = matches.then(|| handler(old, new));
            async move {
                match fut {
                    Some(fut) => fut.await,
                    None => Ok(()),
                }
            }
        }))
    }

    pub fn events(&self) -> Option<EventBus> {
        self.shared.events.lock().unwrap().clone()
    }

    /// Route change events of an already-built board onto `events`. The
    /// forest uses this to wire shared boards to its bus at start time.
    pub(crate) fn bind_events(&self, events: EventBus) {
        *self.shared.events.lock().unwrap() = Some(events);
    }

    fn notify(&self, key: &str, old: Option<Value>, new: Value) {
        if let Some(events) = self.shared.events.lock().unwrap().as_ref() {
            events.emit(
                CHANGED,
                value_map! {
                    "key" => key,
                    "old" => old.unwrap_or_default(),
                    "new" => new,
                },
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn last_writer_wins() {
        let board = Blackboard::new();
        board.set("door_open", true).await;
        board.set("door_open", false).await;
        assert_eq!(board.get("door_open").await, Some(Value::Bool(false)));
    }

    #[tokio::test]
    async fn remove_reports_nil() {
        let events = EventBus::new();
        let board = Blackboard::with_events(events.clone());
        let last = Arc::new(std::sync::Mutex::new(None));
        {
            let last = last.clone();
            events.on(CHANGED, move |event| {
                let last = last.clone();
                async move {
                    *last.lock().unwrap() = event.payload.get("new").cloned();
                    Ok(())
                }
            });
        }
        board.set("battery", 80).await;
        board.remove("battery").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!board.has("battery").await);
        assert_eq!(events.stats().get(CHANGED), Some(&2));
        // The removal event carries the nil sentinel.
        assert_eq!(*last.lock().unwrap(), Some(Value::Nil));
    }

    #[tokio::test]
    async fn on_change_sees_old_and_new() {
        let events = EventBus::new();
        let board = Blackboard::with_events(events.clone());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            board
                .on_change("pose", move |old, new| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push((old, new));
                        Ok(())
                    }
                })
                .unwrap();
        }
        board.set("pose", 1).await;
        board.set("other", 9).await;
        board.set("pose", 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Value::Nil, Value::Int(1)),
                (Value::Int(1), Value::Int(2)),
            ]
        );
    }
}
