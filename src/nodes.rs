//! The node graph: a [`Node`] carries identity, last status and children,
//! while the tagged [`NodeKind`] holds each variant's control-flow state
//! (`running_child`, repeat counter, wait deadline) so `reset` is a plain
//! field wipe and RUNNING state survives between ticks without keeping any
//! suspended future alive.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tokio::time::Instant;

use crate::error::TreeError;
use crate::registry::NodeConfig;
use crate::{value_map, Action, Behavior, Blackboard, Condition, Policy, Status, TickContext, Value};

/// Topic carrying `{path, old, new}` payloads when a node's status flips.
pub const STATUS_CHANGED: &str = "node.status.changed";
/// Topic carrying `{source, kind, detail}` payloads for tick-time failures.
pub const ERROR: &str = "error";
/// Topic carrying `{message, level}` payloads emitted by the `Log` leaf.
pub const LOG: &str = "log";

/// Comparison operator of the `Compare` leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn parse(text: &str) -> Option<CompareOp> {
        Some(match text {
            "==" | "eq" => CompareOp::Eq,
            "!=" | "ne" => CompareOp::Ne,
            "<" | "lt" => CompareOp::Lt,
            "<=" | "le" => CompareOp::Le,
            ">" | "gt" => CompareOp::Gt,
            ">=" | "ge" => CompareOp::Ge,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn evaluate(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering;
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left.compare(right) == Some(Ordering::Less),
            CompareOp::Le => matches!(
                left.compare(right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::Gt => left.compare(right) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(
                left.compare(right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// One side of a `Compare` leaf.
#[derive(Debug, Clone)]
pub enum Operand {
    /// Always read from the blackboard.
    Key(String),
    /// Always this value.
    Literal(Value),
    /// Blackboard key if present, literal coercion of the text otherwise.
    /// This is what the XML loader produces, where the two are not
    /// syntactically distinguishable.
    Auto(String),
}

impl Operand {
    async fn resolve(&self, blackboard: &Blackboard) -> Option<Value> {
        match self {
            Operand::Key(key) => blackboard.get(key).await,
            Operand::Literal(value) => Some(value.clone()),
            Operand::Auto(text) => Some(
                blackboard
                    .get(text)
                    .await
                    .unwrap_or_else(|| Value::parse(text)),
            ),
        }
    }
}

/// Kind discriminator plus per-kind tick state.
pub enum NodeKind {
    Action(Box<dyn Action>),
    Condition(Box<dyn Condition>),
    Sequence {
        running_child: usize,
    },
    Selector {
        running_child: usize,
    },
    Parallel {
        policy: Policy,
    },
    Inverter,
    Repeater {
        /// `None` repeats forever.
        count: Option<u64>,
        completed: u64,
    },
    UntilSuccess {
        max_attempts: Option<u32>,
        attempts: u32,
    },
    UntilFailure {
        max_attempts: Option<u32>,
        attempts: u32,
    },
    Log {
        message: String,
        level: tracing::Level,
    },
    Wait {
        duration: Duration,
        deadline: Option<Instant>,
    },
    SetBlackboard {
        key: String,
        value: Value,
    },
    CheckBlackboard {
        key: String,
        expected: Value,
    },
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Custom {
        type_name: String,
        behavior: Box<dyn Behavior>,
    },
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(self.kind_name()).finish()
    }
}

impl NodeKind {
    pub fn kind_name(&self) -> &str {
        match self {
            NodeKind::Action(_) => "Action",
            NodeKind::Condition(_) => "Condition",
            NodeKind::Sequence { .. } => "Sequence",
            NodeKind::Selector { .. } => "Selector",
            NodeKind::Parallel { .. } => "Parallel",
            NodeKind::Inverter => "Inverter",
            NodeKind::Repeater { .. } => "Repeater",
            NodeKind::UntilSuccess { .. } => "UntilSuccess",
            NodeKind::UntilFailure { .. } => "UntilFailure",
            NodeKind::Log { .. } => "Log",
            NodeKind::Wait { .. } => "Wait",
            NodeKind::SetBlackboard { .. } => "SetBlackboard",
            NodeKind::CheckBlackboard { .. } => "CheckBlackboard",
            NodeKind::Compare { .. } => "Compare",
            NodeKind::Custom { type_name, .. } => type_name,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            NodeKind::Sequence { .. } | NodeKind::Selector { .. } | NodeKind::Parallel { .. }
        )
    }

    pub fn is_decorator(&self) -> bool {
        matches!(
            self,
            NodeKind::Inverter
                | NodeKind::Repeater { .. }
                | NodeKind::UntilSuccess { .. }
                | NodeKind::UntilFailure { .. }
        )
    }

    fn max_children(&self) -> usize {
        if self.is_decorator() {
            1
        } else if self.is_composite() || matches!(self, NodeKind::Custom { .. }) {
            usize::MAX
        } else {
            0
        }
    }

    fn reset(&mut self) {
        match self {
            NodeKind::Action(action) => action.reset(),
            NodeKind::Sequence { running_child } | NodeKind::Selector { running_child } => {
                *running_child = 0;
            }
            NodeKind::Repeater { completed, .. } => *completed = 0,
            NodeKind::UntilSuccess { attempts, .. } | NodeKind::UntilFailure { attempts, .. } => {
                *attempts = 0;
            }
            NodeKind::Wait { deadline, .. } => *deadline = None,
            NodeKind::Custom { behavior, .. } => behavior.reset(),
            _ => {}
        }
    }
}

/// A node of the tree. Children are owned, so a node belongs to exactly one
/// tree and the graph cannot form cycles.
#[derive(Debug)]
pub struct Node {
    name: String,
    config: NodeConfig,
    kind: NodeKind,
    children: Vec<Node>,
    status: Status,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Node {
        Node {
            name: name.into(),
            config: NodeConfig::new(),
            kind,
            children: Vec::new(),
            status: Status::Failure,
        }
    }

    pub fn sequence(name: impl Into<String>) -> Node {
        Node::new(name, NodeKind::Sequence { running_child: 0 })
    }

    pub fn selector(name: impl Into<String>) -> Node {
        Node::new(name, NodeKind::Selector { running_child: 0 })
    }

    pub fn parallel(name: impl Into<String>, policy: Policy) -> Node {
        Node::new(name, NodeKind::Parallel { policy })
    }

    pub fn inverter(name: impl Into<String>) -> Node {
        Node::new(name, NodeKind::Inverter)
    }

    pub fn repeater(name: impl Into<String>, count: Option<u64>) -> Node {
        Node::new(name, NodeKind::Repeater { count, completed: 0 })
    }

    pub fn until_success(name: impl Into<String>, max_attempts: Option<u32>) -> Node {
        Node::new(
            name,
            NodeKind::UntilSuccess {
                max_attempts,
                attempts: 0,
            },
        )
    }

    pub fn until_failure(name: impl Into<String>, max_attempts: Option<u32>) -> Node {
        Node::new(
            name,
            NodeKind::UntilFailure {
                max_attempts,
                attempts: 0,
            },
        )
    }

    pub fn log(name: impl Into<String>, message: impl Into<String>) -> Node {
        Node::new(
            name,
            NodeKind::Log {
                message: message.into(),
                level: tracing::Level::INFO,
            },
        )
    }

    pub fn wait(name: impl Into<String>, duration: Duration) -> Node {
        Node::new(
            name,
            NodeKind::Wait {
                duration,
                deadline: None,
            },
        )
    }

    pub fn set_blackboard(
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Node {
        Node::new(
            name,
            NodeKind::SetBlackboard {
                key: key.into(),
                value: value.into(),
            },
        )
    }

    pub fn check_blackboard(
        name: impl Into<String>,
        key: impl Into<String>,
        expected: impl Into<Value>,
    ) -> Node {
        Node::new(
            name,
            NodeKind::CheckBlackboard {
                key: key.into(),
                expected: expected.into(),
            },
        )
    }

    pub fn compare(name: impl Into<String>, left: Operand, op: CompareOp, right: Operand) -> Node {
        Node::new(name, NodeKind::Compare { left, op, right })
    }

    pub fn action(name: impl Into<String>, action: impl Action + 'static) -> Node {
        Node::new(name, NodeKind::Action(Box::new(action)))
    }

    /// A leaf action from an async closure over a blackboard handle.
    pub fn action_fn<F, Fut>(name: impl Into<String>, f: F) -> Node
    where
        F: FnMut(Blackboard) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Status>> + Send + 'static,
    {
        Node::action(name, FnAction(f))
    }

    pub fn condition(name: impl Into<String>, condition: impl Condition + 'static) -> Node {
        Node::new(name, NodeKind::Condition(Box::new(condition)))
    }

    pub fn condition_fn<F, Fut>(name: impl Into<String>, f: F) -> Node
    where
        F: Fn(Blackboard) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Node::condition(name, FnCondition(f))
    }

    pub fn custom(
        name: impl Into<String>,
        type_name: impl Into<String>,
        behavior: impl Behavior + 'static,
    ) -> Node {
        Node::new(
            name,
            NodeKind::Custom {
                type_name: type_name.into(),
                behavior: Box::new(behavior),
            },
        )
    }

    pub fn add_child(&mut self, child: Node) -> Result<(), TreeError> {
        if self.children.len() >= self.kind.max_children() {
            return Err(TreeError::TooManyChildren {
                name: self.name.clone(),
            });
        }
        self.children.push(child);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Status observed on the last tick; `Failure` before the first one.
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: NodeConfig) {
        self.config = config;
    }

    /// Which child a RUNNING sequence or selector will resume on.
    pub fn running_child_index(&self) -> Option<usize> {
        match &self.kind {
            NodeKind::Sequence { running_child } | NodeKind::Selector { running_child } => {
                Some(*running_child)
            }
            _ => None,
        }
    }

    /// Depth-first search by node name.
    pub fn find(&self, name: &str) -> Option<&Node> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// Depth-first visit of this node and every descendant.
    pub fn visit(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    /// Wipe running state on this node and every descendant: status back to
    /// `Failure`, resume indices to 0, counters and deadlines cleared.
    pub fn reset(&mut self) {
        self.status = Status::Failure;
        self.kind.reset();
        for child in &mut self.children {
            child.reset();
        }
    }

    /// Tick this node. Boxed so composites can recurse through `dyn`-free
    /// async code.
    pub fn tick<'a>(&'a mut self, ctx: &'a TickContext) -> BoxFuture<'a, Status> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                return Status::Running;
            }
            let ctx = ctx.enter(&self.name);
            let old = self.status;
            let status = tick_kind(&mut self.kind, &mut self.children, &ctx).await;
            self.status = status;
            if status != old {
                ctx.events().emit(
                    STATUS_CHANGED,
                    value_map! {
                        "path" => ctx.path(),
                        "old" => old.as_str(),
                        "new" => status.as_str(),
                    },
                );
            }
            status
        })
    }
}

async fn tick_kind(kind: &mut NodeKind, children: &mut [Node], ctx: &TickContext) -> Status {
    match kind {
        NodeKind::Action(action) => match action.execute(ctx.blackboard()).await {
            Ok(status) => status,
            Err(err) => {
                report_error(ctx, "action", &err.to_string());
                Status::Failure
            }
        },
        NodeKind::Condition(condition) => match condition.evaluate(ctx.blackboard()).await {
            Ok(true) => Status::Success,
            Ok(false) => Status::Failure,
            Err(err) => {
                report_error(ctx, "condition", &err.to_string());
                Status::Failure
            }
        },
        NodeKind::Sequence { running_child } => {
            let mut index = *running_child;
            loop {
                if index >= children.len() {
                    *running_child = 0;
                    break Status::Success;
                }
                if ctx.is_cancelled() {
                    *running_child = index;
                    break Status::Running;
                }
                match children[index].tick(ctx).await {
                    Status::Success => {
                        index += 1;
                        tokio::task::yield_now().await;
                    }
                    Status::Failure => {
                        *running_child = 0;
                        break Status::Failure;
                    }
                    Status::Running => {
                        *running_child = index;
                        break Status::Running;
                    }
                }
            }
        }
        NodeKind::Selector { running_child } => {
            let mut index = *running_child;
            loop {
                if index >= children.len() {
                    *running_child = 0;
                    break Status::Failure;
                }
                if ctx.is_cancelled() {
                    *running_child = index;
                    break Status::Running;
                }
                match children[index].tick(ctx).await {
                    Status::Success => {
                        *running_child = 0;
                        break Status::Success;
                    }
                    Status::Failure => {
                        index += 1;
                        tokio::task::yield_now().await;
                    }
                    Status::Running => {
                        *running_child = index;
                        break Status::Running;
                    }
                }
            }
        }
        NodeKind::Parallel { policy } => {
            if children.is_empty() {
                return match policy {
                    Policy::RequireAll => Status::Success,
                    Policy::RequireOne => Status::Failure,
                };
            }
            // Every child is ticked every round; RUNNING children carry
            // their own resume state.
            let ticks = children.iter_mut().map(|child| {
                let child_ctx = ctx.clone();
                async move { child.tick(&child_ctx).await }
            });
            let outcomes: Vec<Status> = join_all(ticks).await;
            let succeeded = outcomes.iter().filter(|s| **s == Status::Success).count();
            let failed = outcomes.iter().filter(|s| **s == Status::Failure).count();
            let still_running = outcomes.len() - succeeded - failed;
            match policy {
                Policy::RequireAll => {
                    if failed > 0 {
                        Status::Failure
                    } else if still_running > 0 {
                        Status::Running
                    } else {
                        Status::Success
                    }
                }
                Policy::RequireOne => {
                    if succeeded > 0 {
                        Status::Success
                    } else if still_running > 0 {
                        Status::Running
                    } else {
                        Status::Failure
                    }
                }
            }
        }
        NodeKind::Inverter => match first_child(children) {
            None => Status::Failure,
            Some(child) => match child.tick(ctx).await {
                Status::Success => Status::Failure,
                Status::Failure => Status::Success,
                Status::Running => Status::Running,
            },
        },
        NodeKind::Repeater { count, completed } => {
            if children.is_empty() {
                return Status::Failure;
            }
            loop {
                if let Some(limit) = count {
                    if *completed >= *limit {
                        *completed = 0;
                        break Status::Success;
                    }
                }
                if ctx.is_cancelled() {
                    break Status::Running;
                }
                match children[0].tick(ctx).await {
                    Status::Success => {
                        *completed += 1;
                        children[0].reset();
                        tokio::task::yield_now().await;
                    }
                    Status::Failure => {
                        *completed = 0;
                        break Status::Failure;
                    }
                    Status::Running => break Status::Running,
                }
            }
        }
        NodeKind::UntilSuccess {
            max_attempts,
            attempts,
        } => match first_child(children) {
            None => Status::Failure,
            Some(child) => match child.tick(ctx).await {
                Status::Success => {
                    *attempts = 0;
                    Status::Success
                }
                Status::Running => Status::Running,
                Status::Failure => {
                    *attempts += 1;
                    if max_attempts.is_some_and(|max| *attempts >= max) {
                        *attempts = 0;
                        Status::Failure
                    } else {
                        child.reset();
                        Status::Running
                    }
                }
            },
        },
        NodeKind::UntilFailure {
            max_attempts,
            attempts,
        } => match first_child(children) {
            None => Status::Failure,
            Some(child) => match child.tick(ctx).await {
                Status::Failure => {
                    *attempts = 0;
                    Status::Success
                }
                Status::Running => Status::Running,
                Status::Success => {
                    *attempts += 1;
                    if max_attempts.is_some_and(|max| *attempts >= max) {
                        *attempts = 0;
                        Status::Success
                    } else {
                        child.reset();
                        Status::Running
                    }
                }
            },
        },
        NodeKind::Log { message, level } => {
            match *level {
                tracing::Level::ERROR => tracing::error!(target: "canopy::log", "{message}"),
                tracing::Level::WARN => tracing::warn!(target: "canopy::log", "{message}"),
                tracing::Level::DEBUG => tracing::debug!(target: "canopy::log", "{message}"),
                tracing::Level::TRACE => tracing::trace!(target: "canopy::log", "{message}"),
                _ => tracing::info!(target: "canopy::log", "{message}"),
            }
            ctx.events().emit(
                LOG,
                value_map! {
                    "message" => message.clone(),
                    "level" => level.as_str().to_ascii_lowercase(),
                },
            );
            Status::Success
        }
        NodeKind::Wait { duration, deadline } => match deadline {
            None => {
                if duration.is_zero() {
                    return Status::Success;
                }
                *deadline = Some(Instant::now() + *duration);
                Status::Running
            }
            Some(at) => {
                if Instant::now() >= *at {
                    *deadline = None;
                    Status::Success
                } else {
                    Status::Running
                }
            }
        },
        NodeKind::SetBlackboard { key, value } => {
            ctx.blackboard().set(key, value.clone()).await;
            Status::Success
        }
        NodeKind::CheckBlackboard { key, expected } => {
            match ctx.blackboard().get(key).await {
                Some(actual) if actual == *expected => Status::Success,
                _ => Status::Failure,
            }
        }
        NodeKind::Compare { left, op, right } => {
            let (Some(lhs), Some(rhs)) = (
                left.resolve(ctx.blackboard()).await,
                right.resolve(ctx.blackboard()).await,
            ) else {
                return Status::Failure;
            };
            if op.evaluate(&lhs, &rhs) {
                Status::Success
            } else {
                Status::Failure
            }
        }
        NodeKind::Custom { behavior, .. } => behavior.tick(children, ctx).await,
    }
}

fn first_child(children: &mut [Node]) -> Option<&mut Node> {
    children.first_mut()
}

fn report_error(ctx: &TickContext, kind: &str, detail: &str) {
    tracing::debug!(source = ctx.path(), kind, detail, "leaf reported an error");
    ctx.events().emit(
        ERROR,
        value_map! {
            "source" => ctx.path(),
            "kind" => kind,
            "detail" => detail,
        },
    );
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: FnMut(Blackboard) -> Fut + Send,
    Fut: std::future::Future<Output = anyhow::Result<Status>> + Send + 'static,
{
    async fn execute(&mut self, blackboard: &Blackboard) -> anyhow::Result<Status> {
        (self.0)(blackboard.clone()).await
    }
}

struct FnCondition<F>(F);

#[async_trait]
impl<F, Fut> Condition for FnCondition<F>
where
    F: Fn(Blackboard) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn evaluate(&self, blackboard: &Blackboard) -> anyhow::Result<bool> {
        (self.0)(blackboard.clone()).await
    }
}

#[cfg(test)]
mod test;
