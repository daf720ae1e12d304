//! Typed inter-tree communication channels.
//!
//! Each variant is a cheaply clonable handle around shared state; the forest
//! holds them in a registry keyed by name and drives the common lifecycle
//! (`start`, `stop`, `before_tick`, `after_tick`). Trees grab a handle by
//! name and expected variant at wiring time, so a variant mismatch fails
//! before anything is ticked.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::blackboard;
use crate::error::ChannelError;
use crate::event::{EventBus, Subscription};
use crate::tree::BehaviorTree;
use crate::{Blackboard, Status, Value};

pub const TASK_CLAIMED: &str = "task.claimed";
pub const TASK_EXPIRED: &str = "task.expired";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";

/// Default bound on nested behavior-call chains.
pub const DEFAULT_CALL_DEPTH: usize = 8;

/// Forest-side wiring a channel receives when the forest starts.
#[derive(Clone)]
pub(crate) struct ChannelEnv {
    pub events: EventBus,
    pub cancel: CancellationToken,
}

type EnvSlot = StdMutex<Option<ChannelEnv>>;

fn env_events(slot: &EnvSlot) -> Option<EventBus> {
    slot.lock().unwrap().as_ref().map(|env| env.events.clone())
}

fn env_cancel(slot: &EnvSlot) -> Option<CancellationToken> {
    slot.lock().unwrap().as_ref().map(|env| env.cancel.clone())
}

// ---- Pub/Sub ----------------------------------------------------------

/// Topic fan-out. Delivery is asynchronous and per-topic FIFO: a
/// subscriber sees messages in publish order.
#[derive(Clone, Default)]
pub struct PubSub {
    bus: EventBus,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(crate::Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus.on(topic, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.bus.off(subscription);
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        self.bus.emit(topic, payload);
    }

    /// Await the next message on `topic`.
    pub async fn recv(&self, topic: &str, timeout: Option<Duration>) -> Option<crate::Event> {
        self.bus.wait_for(topic, timeout).await
    }
}

// ---- Req/Resp ---------------------------------------------------------

type ServiceHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Single-handler service calls with optional per-call timeouts.
#[derive(Clone, Default)]
pub struct ReqResp {
    inner: Arc<ReqRespInner>,
}

#[derive(Default)]
struct ReqRespInner {
    services: StdMutex<HashMap<String, ServiceHandler>>,
    env: EnvSlot,
}

impl ReqResp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for `service`. Re-registration replaces.
    pub fn register<F, Fut>(&self, service: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: ServiceHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.inner
            .services
            .lock()
            .unwrap()
            .insert(service.to_owned(), handler);
    }

    pub fn unregister(&self, service: &str) -> bool {
        self.inner.services.lock().unwrap().remove(service).is_some()
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.services.lock().unwrap().keys().cloned().collect()
    }

    pub async fn call(&self, service: &str, request: Value) -> Result<Value, ChannelError> {
        self.call_with_timeout(service, request, None).await
    }

    /// Await the handler. Fails with `NoService` when nothing is registered,
    /// `ServiceError` when the handler errors, `Timeout` past the limit and
    /// `Cancelled` when the forest stops mid-call.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ChannelError> {
        let handler = self
            .inner
            .services
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .ok_or_else(|| ChannelError::NoService(service.to_owned()))?;
        let cancel = env_cancel(&self.inner.env);
        let work = async {
            let invocation = handler(request);
            match &cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => Err(ChannelError::Cancelled(service.to_owned())),
                    outcome = invocation => outcome.map_err(|source| ChannelError::ServiceError {
                        service: service.to_owned(),
                        source,
                    }),
                },
                None => invocation.await.map_err(|source| ChannelError::ServiceError {
                    service: service.to_owned(),
                    source,
                }),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or_else(|_| Err(ChannelError::Timeout(service.to_owned()))),
            None => work.await,
        }
    }
}

// ---- Shared blackboard ------------------------------------------------

/// A second blackboard visible to every tree in the forest. The single
/// write lock is the serialization point that totally orders writes.
#[derive(Clone, Default)]
pub struct SharedBlackboard {
    board: Blackboard,
}

impl SharedBlackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn board(&self) -> &Blackboard {
        &self.board
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.board.get(key).await
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) {
        self.board.set(key, value).await;
    }

    pub async fn has(&self, key: &str) -> bool {
        self.board.has(key).await
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.board.remove(key).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.board.keys().await
    }
}

// ---- State watch ------------------------------------------------------

/// Change notification delivered to a watcher. `value` is `None` when the
/// key was removed before dispatch.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub tree: String,
    pub key: String,
    pub value: Option<Value>,
}

type WatchHandler = Arc<dyn Fn(StateChange) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug)]
pub struct WatchHandle {
    tree: String,
    key: String,
    id: u64,
}

/// Cross-tree observation of per-tree blackboard keys.
#[derive(Clone, Default)]
pub struct StateWatch {
    inner: Arc<StateWatchInner>,
}

#[derive(Default)]
struct StateWatchInner {
    watchers: StdMutex<HashMap<(String, String), Vec<(u64, WatchHandler)>>>,
    next_id: AtomicU64,
}

impl StateWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch<F, Fut>(&self, tree: &str, key: &str, handler: F) -> WatchHandle
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: WatchHandler = Arc::new(move |change| Box::pin(handler(change)));
        self.inner
            .watchers
            .lock()
            .unwrap()
            .entry((tree.to_owned(), key.to_owned()))
            .or_default()
            .push((id, handler));
        WatchHandle {
            tree: tree.to_owned(),
            key: key.to_owned(),
            id,
        }
    }

    pub fn unwatch(&self, handle: WatchHandle) -> bool {
        let mut watchers = self.inner.watchers.lock().unwrap();
        if let Some(entries) = watchers.get_mut(&(handle.tree, handle.key)) {
            let before = entries.len();
            entries.retain(|(id, _)| *id != handle.id);
            return entries.len() != before;
        }
        false
    }

    /// Report a change of `(tree, key)` to its watchers, in watch order.
    pub async fn publish(&self, tree: &str, key: &str, value: Option<Value>) {
        let handlers: Vec<WatchHandler> = {
            let watchers = self.inner.watchers.lock().unwrap();
            match watchers.get(&(tree.to_owned(), key.to_owned())) {
                Some(entries) => entries.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        let change = StateChange {
            tree: tree.to_owned(),
            key: key.to_owned(),
            value,
        };
        for handler in handlers {
            if let Err(err) = handler(change.clone()).await {
                tracing::warn!(error = %err, tree, key, "state watcher failed");
            }
        }
    }

    /// Bridge a tree's blackboard onto this channel: every write the tree
    /// makes is forwarded to whoever watches that `(tree, key)`.
    pub fn attach(&self, tree: &str, events: &EventBus) -> Subscription {
        let watch = self.clone();
        let tree = tree.to_owned();
        events.on(blackboard::CHANGED, move |event| {
            let watch = watch.clone();
            let tree = tree.clone();
            async move {
                let Some(key) = event.payload.get("key").and_then(Value::as_str) else {
                    return Ok(());
                };
                let new = event.payload.get("new").cloned().unwrap_or_default();
                let value = (!new.is_nil()).then_some(new);
                watch.publish(&tree, key, value).await;
                Ok(())
            }
        })
    }
}

// ---- Task board -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "task-{}", self.0)
    }
}

#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub payload: Value,
    pub required: HashSet<String>,
    pub claimed_by: Option<String>,
    submitted_at: Instant,
    ttl: Option<Duration>,
}

impl Task {
    fn expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(self.submitted_at) >= ttl)
    }
}

type Acceptor = Arc<dyn Fn(Task) -> BoxFuture<'static, bool> + Send + Sync>;

struct BoardWorker {
    name: String,
    capabilities: HashSet<String>,
    acceptor: Acceptor,
}

/// FIFO of pending tasks offered each tick to capable forest nodes. The
/// first worker whose capability set covers the requirements and whose
/// acceptor says yes claims the task.
#[derive(Clone, Default)]
pub struct TaskBoard {
    inner: Arc<TaskBoardInner>,
}

#[derive(Default)]
struct TaskBoardInner {
    state: Mutex<BoardState>,
    workers: StdMutex<Vec<BoardWorker>>,
    next_id: AtomicU64,
    env: EnvSlot,
}

#[derive(Default)]
struct BoardState {
    pending: VecDeque<Task>,
    claimed: HashMap<TaskId, Task>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(
        &self,
        title: &str,
        payload: Value,
        required: HashSet<String>,
    ) -> TaskId {
        self.push(title, payload, required, None).await
    }

    /// Submit with a time-to-live; unclaimed tasks past it are dropped with
    /// a `task.expired` event.
    pub async fn submit_with_ttl(
        &self,
        title: &str,
        payload: Value,
        required: HashSet<String>,
        ttl: Duration,
    ) -> TaskId {
        self.push(title, payload, required, Some(ttl)).await
    }

    async fn push(
        &self,
        title: &str,
        payload: Value,
        required: HashSet<String>,
        ttl: Option<Duration>,
    ) -> TaskId {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Task {
            id,
            title: title.to_owned(),
            payload,
            required,
            claimed_by: None,
            submitted_at: Instant::now(),
            ttl,
        };
        self.inner.state.lock().await.pending.push_back(task);
        id
    }

    /// Register a forest node as a potential claimant. The acceptor is
    /// asked, in registration order, about each offered task.
    pub fn register_worker<F, Fut>(&self, name: &str, capabilities: HashSet<String>, acceptor: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.inner.workers.lock().unwrap().push(BoardWorker {
            name: name.to_owned(),
            capabilities,
            acceptor: Arc::new(move |task| Box::pin(acceptor(task))),
        });
    }

    pub async fn pending(&self) -> Vec<Task> {
        self.inner.state.lock().await.pending.iter().cloned().collect()
    }

    /// Pending tasks a node with `capabilities` could claim.
    pub async fn tasks_for(&self, capabilities: &HashSet<String>) -> Vec<Task> {
        self.inner
            .state
            .lock()
            .await
            .pending
            .iter()
            .filter(|task| task.required.is_subset(capabilities))
            .cloned()
            .collect()
    }

    pub async fn claimed_by(&self, name: &str) -> Vec<Task> {
        self.inner
            .state
            .lock()
            .await
            .claimed
            .values()
            .filter(|task| task.claimed_by.as_deref() == Some(name))
            .cloned()
            .collect()
    }

    pub async fn complete(&self, id: TaskId) -> bool {
        let removed = self.inner.state.lock().await.claimed.remove(&id);
        if removed.is_some() {
            self.emit(TASK_COMPLETED, id, None);
        }
        removed.is_some()
    }

    pub async fn fail(&self, id: TaskId) -> bool {
        let removed = self.inner.state.lock().await.claimed.remove(&id);
        if removed.is_some() {
            self.emit(TASK_FAILED, id, None);
        }
        removed.is_some()
    }

    /// One offer round: drop expired tasks, then walk the FIFO offering
    /// each task to capable workers. Unclaimed tasks stay for next tick.
    pub(crate) async fn offer_round(&self) {
        let now = Instant::now();
        let workers: Vec<(String, HashSet<String>, Acceptor)> = self
            .inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| (w.name.clone(), w.capabilities.clone(), w.acceptor.clone()))
            .collect();

        let mut state = self.inner.state.lock().await;
        let tasks: Vec<Task> = state.pending.drain(..).collect();
        for mut task in tasks {
            if task.expired(now) {
                self.emit(TASK_EXPIRED, task.id, None);
                continue;
            }
            let mut claimant = None;
            for (name, capabilities, acceptor) in &workers {
                if !task.required.is_subset(capabilities) {
                    continue;
                }
                if acceptor(task.clone()).await {
                    claimant = Some(name.clone());
                    break;
                }
            }
            match claimant {
                Some(name) => {
                    task.claimed_by = Some(name.clone());
                    self.emit(TASK_CLAIMED, task.id, Some(&name));
                    state.claimed.insert(task.id, task);
                }
                None => state.pending.push_back(task),
            }
        }
    }

    fn emit(&self, topic: &str, id: TaskId, tree: Option<&str>) {
        if let Some(events) = env_events(&self.inner.env) {
            let mut payload = BTreeMap::new();
            payload.insert("task_id".to_owned(), Value::Str(id.to_string()));
            if let Some(tree) = tree {
                payload.insert("tree".to_owned(), Value::Str(tree.to_owned()));
            }
            events.emit(topic, Value::Map(payload));
        }
    }
}

// ---- Behavior call ----------------------------------------------------

tokio::task_local! {
    static CALL_DEPTH: usize;
}

type BehaviorFactory = Arc<dyn Fn() -> BehaviorTree + Send + Sync>;

#[derive(Clone)]
struct BehaviorEntry {
    factory: BehaviorFactory,
    /// The instance sequential calls reuse, so RUNNING state carries over
    /// from one call to the next. Taken out for the duration of a tick.
    resident: Arc<StdMutex<Option<BehaviorTree>>>,
}

/// Directly tick a named sub-tree on another forest node, with a blackboard
/// overlay that is popped after the call returns.
///
/// Registration supplies a prototype constructor. A call checks the
/// resident instance out while ticking it, so a nested call back into the
/// same behavior (a cycle) runs a fresh instance from the prototype instead
/// of blocking; the chain as a whole is bounded by the depth limit.
#[derive(Clone)]
pub struct BehaviorCall {
    inner: Arc<BehaviorCallInner>,
}

struct BehaviorCallInner {
    behaviors: StdMutex<HashMap<(String, String), BehaviorEntry>>,
    max_depth: usize,
    env: EnvSlot,
}

impl Default for BehaviorCall {
    fn default() -> Self {
        Self::with_depth_limit(DEFAULT_CALL_DEPTH)
    }
}

impl BehaviorCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth_limit(max_depth: usize) -> Self {
        Self {
            inner: Arc::new(BehaviorCallInner {
                behaviors: StdMutex::new(HashMap::new()),
                max_depth,
                env: EnvSlot::default(),
            }),
        }
    }

    /// Make `behavior` on `tree` invocable. `factory` builds the sub-tree;
    /// it runs once up front for the resident instance and again for every
    /// overlapping call.
    pub fn register<F>(&self, tree: &str, behavior: &str, factory: F)
    where
        F: Fn() -> BehaviorTree + Send + Sync + 'static,
    {
        let factory: BehaviorFactory = Arc::new(factory);
        let resident = Arc::new(StdMutex::new(Some(factory())));
        self.inner.behaviors.lock().unwrap().insert(
            (tree.to_owned(), behavior.to_owned()),
            BehaviorEntry { factory, resident },
        );
    }

    pub fn unregister(&self, tree: &str, behavior: &str) -> bool {
        self.inner
            .behaviors
            .lock()
            .unwrap()
            .remove(&(tree.to_owned(), behavior.to_owned()))
            .is_some()
    }

    /// Tick `behavior` on `tree` with `args` overlaid on its blackboard;
    /// the overlay is popped after the call returns. Cycles are permitted —
    /// each nested level ticks its own instance — and fail with
    /// `CallDepthExceeded` once the chain reaches the depth limit.
    pub async fn call(
        &self,
        tree: &str,
        behavior: &str,
        args: BTreeMap<String, Value>,
    ) -> Result<Status, ChannelError> {
        let depth = CALL_DEPTH.try_with(|depth| *depth).unwrap_or(0);
        if depth >= self.inner.max_depth {
            return Err(ChannelError::CallDepthExceeded(self.inner.max_depth));
        }
        let entry = self
            .inner
            .behaviors
            .lock()
            .unwrap()
            .get(&(tree.to_owned(), behavior.to_owned()))
            .cloned()
            .ok_or_else(|| ChannelError::NoService(format!("{tree}/{behavior}")))?;

        let checked_out = entry.resident.lock().unwrap().take();
        let mut subtree = checked_out.unwrap_or_else(|| (entry.factory)());
        let board = subtree.blackboard().clone();
        let mut saved = Vec::with_capacity(args.len());
        for (name, value) in &args {
            saved.push((name.clone(), board.get(name).await));
            board.set(name, value.clone()).await;
        }

        let cancel = env_cancel(&self.inner.env).unwrap_or_default();
        let outcome = CALL_DEPTH
            .scope(depth + 1, subtree.tick_with_cancel(&cancel))
            .await;

        for (name, old) in saved {
            match old {
                Some(value) => board.set(&name, value).await,
                None => {
                    board.remove(&name).await;
                }
            }
        }
        *entry.resident.lock().unwrap() = Some(subtree);

        outcome.map_err(|source| ChannelError::ServiceError {
            service: format!("{tree}/{behavior}"),
            source: source.into(),
        })
    }
}

// ---- Channel registry -------------------------------------------------

/// The closed set of middleware variants a forest can carry.
#[derive(Clone)]
pub enum Channel {
    PubSub(PubSub),
    ReqResp(ReqResp),
    SharedBlackboard(SharedBlackboard),
    StateWatch(StateWatch),
    TaskBoard(TaskBoard),
    BehaviorCall(BehaviorCall),
}

impl Channel {
    /// Construct a default channel from its XML `kind` attribute.
    pub fn from_kind(kind: &str) -> Option<Channel> {
        Some(match kind {
            "PubSub" => Channel::PubSub(PubSub::new()),
            "ReqResp" => Channel::ReqResp(ReqResp::new()),
            "SharedBlackboard" => Channel::SharedBlackboard(SharedBlackboard::new()),
            "StateWatch" => Channel::StateWatch(StateWatch::new()),
            "TaskBoard" => Channel::TaskBoard(TaskBoard::new()),
            "BehaviorCall" => Channel::BehaviorCall(BehaviorCall::new()),
            _ => return None,
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Channel::PubSub(_) => "PubSub",
            Channel::ReqResp(_) => "ReqResp",
            Channel::SharedBlackboard(_) => "SharedBlackboard",
            Channel::StateWatch(_) => "StateWatch",
            Channel::TaskBoard(_) => "TaskBoard",
            Channel::BehaviorCall(_) => "BehaviorCall",
        }
    }

    pub(crate) async fn start(&self, env: &ChannelEnv) -> Result<(), ChannelError> {
        match self {
            Channel::ReqResp(ch) => *ch.inner.env.lock().unwrap() = Some(env.clone()),
            Channel::TaskBoard(ch) => *ch.inner.env.lock().unwrap() = Some(env.clone()),
            Channel::BehaviorCall(ch) => *ch.inner.env.lock().unwrap() = Some(env.clone()),
            Channel::SharedBlackboard(ch) => ch.board.bind_events(env.events.clone()),
            Channel::PubSub(_) | Channel::StateWatch(_) => {}
        }
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        match self {
            Channel::ReqResp(ch) => *ch.inner.env.lock().unwrap() = None,
            Channel::TaskBoard(ch) => *ch.inner.env.lock().unwrap() = None,
            Channel::BehaviorCall(ch) => *ch.inner.env.lock().unwrap() = None,
            _ => {}
        }
    }

    pub(crate) async fn before_tick(&self, _round: u64) {
        if let Channel::TaskBoard(board) = self {
            board.offer_round().await;
        }
    }

    pub(crate) async fn after_tick(&self, _round: u64, _results: &HashMap<String, Status>) {}
}
