//! An asynchronous behavior tree engine with multi-tree forest coordination.
//!
//! A [`BehaviorTree`] owns a graph of [`Node`]s, a shared [`Blackboard`] and
//! an [`EventBus`]. Ticking the tree propagates down the node graph according
//! to each node's control-flow policy and aggregates the three-valued
//! [`Status`] back up, preserving RUNNING state between ticks so composites
//! resume where they blocked.
//!
//! A [`Forest`] ticks a set of trees concurrently, layered by their declared
//! dependencies, and wires them together through typed middleware
//! [`Channel`]s (pub/sub, request/response, shared blackboard, state watch,
//! task board, behavior call).

mod blackboard;
pub mod error;
mod event;
mod forest;
mod manager;
mod middleware;
mod nodes;
mod parser;
mod registry;
mod tree;
mod value;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use crate::blackboard::Blackboard;
pub use crate::event::{Event, EventBus, Subscription};
pub use crate::forest::{Forest, ForestNode, ForestNodeType, RunState};
pub use crate::manager::ForestManager;
pub use crate::middleware::{
    BehaviorCall, Channel, PubSub, ReqResp, SharedBlackboard, StateChange, StateWatch, Task,
    TaskBoard, TaskId, WatchHandle,
};
pub use crate::nodes::{CompareOp, Node, NodeKind, Operand};
pub use crate::parser::{
    parse_document, to_xml, DocumentDef, ElementDef, ForestDef, MiddlewareDef, TreeDef,
};
pub use crate::registry::{boxify, NodeConfig, NodeFactory, NodeMetadata, Registry};
pub use crate::tree::{BehaviorTree, TreeStats};
pub use crate::value::Value;

/// Topics the engine emits on tree and forest buses.
pub mod topics {
    pub use crate::blackboard::CHANGED as BLACKBOARD_CHANGED;
    pub use crate::event::HANDLER_ERROR;
    pub use crate::forest::{FOREST_STARTED, FOREST_STOPPED, NODE_ADDED, NODE_REMOVED};
    pub use crate::middleware::{TASK_CLAIMED, TASK_COMPLETED, TASK_EXPIRED, TASK_FAILED};
    pub use crate::nodes::{ERROR, LOG, STATUS_CHANGED};
    pub use crate::tree::{TICK_END, TICK_START};
}

/// Outcome of ticking a node.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Status {
    Success,
    Failure,
    /// The node has not decided yet and must be ticked again.
    Running,
}

impl Status {
    pub fn is_running(self) -> bool {
        self == Status::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Running => "running",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// Aggregation policy for the `Parallel` composite.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Policy {
    /// Success as soon as any child succeeds; failure once all have failed.
    RequireOne,
    /// Success once all children succeed; failure as soon as any fails.
    RequireAll,
}

/// Ambient context handed to every node tick.
///
/// Cheap to clone; the `Parallel` composite clones it per child so sibling
/// ticks can interleave at suspension points.
#[derive(Clone)]
pub struct TickContext {
    blackboard: Blackboard,
    events: EventBus,
    cancel: CancellationToken,
    tree: String,
    path: String,
}

impl TickContext {
    pub fn new(blackboard: Blackboard, events: EventBus) -> Self {
        Self {
            blackboard,
            events,
            cancel: CancellationToken::new(),
            tree: String::new(),
            path: String::new(),
        }
    }

    pub(crate) fn for_tree(
        blackboard: Blackboard,
        events: EventBus,
        cancel: CancellationToken,
        tree: impl Into<String>,
    ) -> Self {
        Self {
            blackboard,
            events,
            cancel,
            tree: tree.into(),
            path: String::new(),
        }
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Name of the tree being ticked, empty outside a tree.
    pub fn tree(&self) -> &str {
        &self.tree
    }

    /// Slash-separated path from the root to the node being ticked.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True once the surrounding run has been cancelled. Nodes observing
    /// this at a suspension point return [`Status::Running`] so the tree can
    /// resume once the cancellation is over.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn enter(&self, name: &str) -> TickContext {
        let mut child = self.clone();
        child.path.push('/');
        child.path.push_str(name);
        child
    }
}

/// A user-defined node behavior, the extension seam of the engine.
///
/// Implementations receive their node's children and may tick them, which
/// makes custom composites and decorators possible as well as plain leaves.
/// Per-tick state lives on the implementation and is wiped by `reset`.
#[async_trait]
pub trait Behavior: Send {
    async fn tick(&mut self, children: &mut [Node], ctx: &TickContext) -> Status;

    fn reset(&mut self) {}
}

/// A leaf that performs work against the blackboard.
///
/// An `Err` is converted to [`Status::Failure`] and reported as an `error`
/// event; the engine never aborts a tick over a leaf failure.
#[async_trait]
pub trait Action: Send {
    async fn execute(&mut self, blackboard: &Blackboard) -> anyhow::Result<Status>;

    fn reset(&mut self) {}
}

/// A leaf predicate. Never reports RUNNING.
#[async_trait]
pub trait Condition: Send + Sync {
    async fn evaluate(&self, blackboard: &Blackboard) -> anyhow::Result<bool>;
}
