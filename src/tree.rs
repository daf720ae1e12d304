//! The tree facade: owns the root node, the blackboard and the event bus,
//! and drives ticks. At most one tick can be in progress because ticking
//! takes `&mut self`; callers that share a tree serialize through their own
//! handle.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{LoadError, TreeError};
use crate::parser::{build_tree, parse_document, DocumentDef};
use crate::registry::Registry;
use crate::{value_map, Blackboard, EventBus, Node, Status, TickContext};

/// Topic carrying `{tree, round}` at the start of every tick.
pub const TICK_START: &str = "tree.tick.start";
/// Topic carrying `{tree, round, status}` after every tick.
pub const TICK_END: &str = "tree.tick.end";

pub struct BehaviorTree {
    name: String,
    root: Option<Node>,
    blackboard: Blackboard,
    events: EventBus,
    ticks: u64,
    last_status: Option<Status>,
}

/// Snapshot of the tree's shape and the statuses left by the last tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub nodes: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub running: usize,
    pub ticks: u64,
}

impl BehaviorTree {
    /// An empty tree; attach a root with [`load_from_node`] or
    /// [`load_from_xml`].
    ///
    /// [`load_from_node`]: BehaviorTree::load_from_node
    /// [`load_from_xml`]: BehaviorTree::load_from_xml
    pub fn new(name: impl Into<String>) -> Self {
        let events = EventBus::new();
        Self {
            name: name.into(),
            root: None,
            blackboard: Blackboard::with_events(events.clone()),
            events,
            ticks: 0,
            last_status: None,
        }
    }

    /// Construction sugar for `new` + `load_from_node`.
    pub fn with_root(name: impl Into<String>, root: Node) -> Result<Self, TreeError> {
        let mut tree = Self::new(name);
        tree.load_from_node(root)?;
        Ok(tree)
    }

    /// Take ownership of a built subtree after validating it: non-empty node
    /// names, decorators with exactly one child. Cycles cannot occur since
    /// children are owned by value.
    pub fn load_from_node(&mut self, root: Node) -> Result<(), TreeError> {
        validate(&root)?;
        self.root = Some(root);
        Ok(())
    }

    /// Build the tree from an XML document whose root element is
    /// `BehaviorTree`. The document's name attribute replaces the tree name.
    pub fn load_from_xml(&mut self, source: &str, registry: &Registry) -> Result<(), LoadError> {
        match parse_document(source)? {
            DocumentDef::Tree(def) => {
                let root = build_tree(&def, registry)?;
                self.name = def.name;
                self.load_from_node(root)?;
                Ok(())
            }
            DocumentDef::Forest(_) => Err(LoadError::UnexpectedRoot("BehaviorForest".to_owned())),
        }
    }

    pub fn from_xml(source: &str, registry: &Registry) -> Result<Self, LoadError> {
        let mut tree = Self::new("BehaviorTree");
        tree.load_from_xml(source, registry)?;
        Ok(tree)
    }

    /// Advance the root by one tick and report its status.
    pub async fn tick(&mut self) -> Result<Status, TreeError> {
        self.tick_with_cancel(&CancellationToken::new()).await
    }

    /// One tick under an external cancellation token; the forest scheduler
    /// ticks trees through this.
    pub async fn tick_with_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Status, TreeError> {
        let root = self.root.as_mut().ok_or(TreeError::MissingRoot)?;
        self.ticks += 1;
        let round = self.ticks;
        self.events.emit(
            TICK_START,
            value_map! {
                "tree" => self.name.clone(),
                "round" => round as i64,
            },
        );
        let ctx = TickContext::for_tree(
            self.blackboard.clone(),
            self.events.clone(),
            cancel.clone(),
            self.name.clone(),
        );
        let status = root.tick(&ctx).await;
        self.last_status = Some(status);
        self.events.emit(
            TICK_END,
            value_map! {
                "tree" => self.name.clone(),
                "round" => round as i64,
                "status" => status.as_str(),
            },
        );
        Ok(status)
    }

    /// Tick repeatedly at `period` until `cancel` fires. Scheduling is
    /// drift-compensated: each tick targets the previous target plus the
    /// period, not the previous completion.
    pub async fn run(
        &mut self,
        period: Duration,
        cancel: CancellationToken,
    ) -> Result<(), TreeError> {
        if self.root.is_none() {
            return Err(TreeError::MissingRoot);
        }
        let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.tick_with_cancel(&cancel).await?;
                }
            }
        }
        Ok(())
    }

    /// Wipe every node's running state. The blackboard is preserved; clear
    /// it explicitly through [`Self::blackboard`] when a cold start is
    /// wanted.
    pub fn reset(&mut self) {
        if let Some(root) = &mut self.root {
            root.reset();
        }
        self.last_status = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn last_status(&self) -> Option<Status> {
        self.last_status
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.root.as_ref().and_then(|root| root.find(name))
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            ticks: self.ticks,
            ..TreeStats::default()
        };
        if let Some(root) = &self.root {
            root.visit(&mut |node| {
                stats.nodes += 1;
                match node.status() {
                    Status::Success => stats.succeeded += 1,
                    Status::Failure => stats.failed += 1,
                    Status::Running => stats.running += 1,
                }
            });
        }
        stats
    }
}

fn validate(root: &Node) -> Result<(), TreeError> {
    fn walk(node: &Node, path: &str) -> Result<(), TreeError> {
        if node.name().is_empty() {
            return Err(TreeError::EmptyName {
                path: path.to_owned(),
            });
        }
        if node.kind().is_decorator() && node.children().len() != 1 {
            return Err(TreeError::DecoratorArity {
                name: node.name().to_owned(),
                found: node.children().len(),
            });
        }
        let path = format!("{path}/{}", node.name());
        for child in node.children() {
            walk(child, &path)?;
        }
        Ok(())
    }
    walk(root, "")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Policy;

    #[tokio::test]
    async fn tick_counts_rounds_and_reports_status() {
        let mut tree =
            BehaviorTree::with_root("t", Node::sequence("root")).unwrap();
        assert_eq!(tree.tick().await.unwrap(), Status::Success);
        assert_eq!(tree.tick().await.unwrap(), Status::Success);
        assert_eq!(tree.ticks(), 2);
        assert_eq!(tree.last_status(), Some(Status::Success));
    }

    #[tokio::test]
    async fn tick_without_a_root_fails() {
        let mut tree = BehaviorTree::new("empty");
        assert!(matches!(tree.tick().await, Err(TreeError::MissingRoot)));
    }

    #[test]
    fn validation_rejects_bad_arity_and_names() {
        let mut inv = Node::inverter("lonely");
        assert!(matches!(
            BehaviorTree::with_root("t", inv),
            Err(TreeError::DecoratorArity { .. })
        ));

        inv = Node::inverter("");
        inv.add_child(Node::sequence("s")).unwrap();
        assert!(matches!(
            BehaviorTree::with_root("t", inv),
            Err(TreeError::EmptyName { .. })
        ));
    }

    #[tokio::test]
    async fn tick_events_bracket_the_round() {
        let mut tree =
            BehaviorTree::with_root("t", Node::parallel("p", Policy::RequireAll)).unwrap();
        let events = tree.events().clone();
        let started = events.wait_for(TICK_START, None);
        let (started, ticked) = tokio::join!(started, async {
            tree.tick().await.unwrap()
        });
        let started = started.expect("tick start event");
        assert_eq!(started.payload.get("round"), Some(&crate::Value::Int(1)));
        assert_eq!(ticked, Status::Success);
    }

    #[tokio::test]
    async fn reset_preserves_the_blackboard() {
        let mut tree = BehaviorTree::with_root(
            "t",
            Node::set_blackboard("set", "seen", true),
        )
        .unwrap();
        tree.tick().await.unwrap();
        tree.reset();
        assert_eq!(
            tree.blackboard().get("seen").await,
            Some(crate::Value::Bool(true))
        );
        assert_eq!(tree.last_status(), None);
    }
}
