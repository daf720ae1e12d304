//! Asynchronous publish/subscribe bus.
//!
//! Every subscribed topic gets a dispatch task fed by an unbounded queue, so
//! `emit` never blocks the caller on handler work, deliveries on one topic
//! stay in publish order, and handlers for one emission run in subscription
//! order.
//! A failing handler is isolated: its error is reported as a
//! [`HANDLER_ERROR`] meta-event and dispatch continues with the next
//! handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{value_map, Value};

/// Topic of the meta-event emitted when a subscriber returns an error.
pub const HANDLER_ERROR: &str = "handler_error";

/// A single emission delivered to subscribers.
#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle returned by [`EventBus::on`], consumed by [`EventBus::off`].
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    topics: Mutex<HashMap<String, Topic>>,
    counts: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct Topic {
    tx: mpsc::UnboundedSender<Event>,
    subs: Arc<Mutex<Vec<(u64, EventHandler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic`. Handlers registered on the same topic
    /// are invoked in subscription order.
    pub fn on<F, Fut>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_handler(topic, Arc::new(move |event| Box::pin(handler(event))))
    }

    pub fn on_handler(&self, topic: &str, handler: EventHandler) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = self.topic(topic);
        entry.subs.lock().unwrap().push((id, handler));
        Subscription {
            topic: topic.to_owned(),
            id,
        }
    }

    /// Remove a subscription. Unknown handles are ignored.
    pub fn off(&self, subscription: Subscription) {
        let topics = self.shared.topics.lock().unwrap();
        if let Some(entry) = topics.get(&subscription.topic) {
            entry
                .subs
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Queue an event for delivery. Returns immediately; handlers run on the
    /// topic's dispatch task. Emissions on a topic nobody has subscribed to
    /// yet are counted and dropped.
    pub fn emit(&self, topic: &str, payload: Value) {
        *self
            .shared
            .counts
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_insert(0) += 1;
        let entry = self.shared.topics.lock().unwrap().get(topic).cloned();
        if let Some(entry) = entry {
            let _ = entry.tx.send(Event {
                name: topic.to_owned(),
                payload,
            });
        }
    }

    /// Await the next emission on `topic`, up to an optional timeout.
    pub async fn wait_for(&self, topic: &str, timeout: Option<Duration>) -> Option<Event> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let sub = self.on(topic, move |event| {
            let slot = slot.clone();
            async move {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(event);
                }
                Ok(())
            }
        });
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok().and_then(Result::ok),
            None => rx.await.ok(),
        };
        self.off(sub);
        received
    }

    /// Number of emissions seen per topic since the bus was created.
    pub fn stats(&self) -> HashMap<String, u64> {
        self.shared.counts.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared.topics.lock().unwrap().keys().cloned().collect()
    }

    fn topic(&self, name: &str) -> Topic {
        let mut topics = self.shared.topics.lock().unwrap();
        if let Some(entry) = topics.get(name) {
            return entry.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Topic {
            tx,
            subs: Arc::new(Mutex::new(Vec::new())),
        };
        topics.insert(name.to_owned(), entry.clone());
        spawn_dispatcher(
            Arc::downgrade(&self.shared),
            name.to_owned(),
            rx,
            entry.subs.clone(),
        );
        entry
    }
}

/// Per-topic dispatch loop. Holds only a weak reference to the bus so the
/// loop winds down once every bus handle is dropped.
fn spawn_dispatcher(
    shared: Weak<Shared>,
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Event>,
    subs: Arc<Mutex<Vec<(u64, EventHandler)>>>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let handlers: Vec<EventHandler> =
                subs.lock().unwrap().iter().map(|(_, h)| h.clone()).collect();
            for handler in handlers {
                if let Err(err) = handler(event.clone()).await {
                    if topic == HANDLER_ERROR {
                        // Do not feed the meta-topic with its own failures.
                        tracing::warn!(error = %err, "handler_error subscriber failed");
                    } else if let Some(shared) = shared.upgrade() {
                        EventBus { shared }.emit(
                            HANDLER_ERROR,
                            value_map! {
                                "topic" => topic.clone(),
                                "error" => err.to_string(),
                            },
                        );
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.on("ping", move |_| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(tag);
                    Ok(())
                }
            });
        }
        bus.emit("ping", Value::Nil);
        bus.wait_for("ping", Some(Duration::from_secs(1))).await;
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn failing_handler_is_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));
        bus.on("job", |_| async { anyhow::bail!("boom") });
        {
            let reached = reached.clone();
            bus.on("job", move |_| {
                let reached = reached.clone();
                async move {
                    *reached.lock().unwrap() = true;
                    Ok(())
                }
            });
        }
        bus.emit("job", Value::Nil);
        let meta = bus
            .wait_for(HANDLER_ERROR, Some(Duration::from_secs(1)))
            .await
            .expect("meta-event");
        assert_eq!(meta.payload.get("topic"), Some(&Value::Str("job".into())));
        assert!(*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn unsubscribe_restores_the_bus() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let sub = {
            let hits = hits.clone();
            bus.on("tick", move |_| {
                let hits = hits.clone();
                async move {
                    *hits.lock().unwrap() += 1;
                    Ok(())
                }
            })
        };
        bus.off(sub);
        bus.emit("tick", Value::Nil);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*hits.lock().unwrap(), 0);
    }
}
