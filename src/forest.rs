//! Forest runtime: a named set of behavior trees ticked together.
//!
//! One forest tick partitions the trees into dependency layers and ticks
//! each layer concurrently, so a tree runs strictly after everything it
//! depends on. Middlewares get lifecycle callbacks around every round.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, ForestError, LoadError};
use crate::middleware::{
    BehaviorCall, Channel, ChannelEnv, PubSub, ReqResp, SharedBlackboard, StateWatch, TaskBoard,
};
use crate::parser::{build_tree, parse_document, DocumentDef};
use crate::registry::Registry;
use crate::tree::BehaviorTree;
use crate::{value_map, EventBus, Status};

pub const FOREST_STARTED: &str = "forest.started";
pub const FOREST_STOPPED: &str = "forest.stopped";
pub const NODE_ADDED: &str = "forest.node.added";
pub const NODE_REMOVED: &str = "forest.node.removed";

/// Advisory role of a tree within its forest; feeds default capabilities
/// and lets applications query nodes by role.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ForestNodeType {
    Master,
    #[default]
    Worker,
    Monitor,
    Coordinator,
}

impl ForestNodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ForestNodeType::Master => "master",
            ForestNodeType::Worker => "worker",
            ForestNodeType::Monitor => "monitor",
            ForestNodeType::Coordinator => "coordinator",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

/// A behavior tree registered in a forest, with the metadata the forest
/// scheduler and the middlewares route on.
pub struct ForestNode {
    name: String,
    tree: BehaviorTree,
    node_type: ForestNodeType,
    capabilities: HashSet<String>,
    dependencies: HashSet<String>,
    status: Status,
}

impl ForestNode {
    pub fn new(name: impl Into<String>, tree: BehaviorTree) -> Self {
        Self {
            name: name.into(),
            tree,
            node_type: ForestNodeType::default(),
            capabilities: HashSet::new(),
            dependencies: HashSet::new(),
            status: Status::Failure,
        }
    }

    pub fn with_type(mut self, node_type: ForestNodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Declare that this node must be ticked after `dependency` within each
    /// forest round.
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &BehaviorTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BehaviorTree {
        &mut self.tree
    }

    pub fn node_type(&self) -> ForestNodeType {
        self.node_type
    }

    pub fn capabilities(&self) -> &HashSet<String> {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn add_capability(&mut self, capability: impl Into<String>) {
        self.capabilities.insert(capability.into());
    }

    pub fn remove_capability(&mut self, capability: &str) -> bool {
        self.capabilities.remove(capability)
    }

    pub fn dependencies(&self) -> &HashSet<String> {
        &self.dependencies
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn reset(&mut self) {
        self.tree.reset();
        self.status = Status::Failure;
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Status {
        self.status = match self.tree.tick_with_cancel(cancel).await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(node = %self.name, error = %err, "forest node failed to tick");
                Status::Failure
            }
        };
        self.status
    }
}

pub struct Forest {
    name: String,
    nodes: Vec<ForestNode>,
    channels: Vec<(String, Channel)>,
    events: EventBus,
    state: RunState,
    cancel: CancellationToken,
    round: u64,
}

impl Forest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            channels: Vec::new(),
            events: EventBus::new(),
            state: RunState::Idle,
            cancel: CancellationToken::new(),
            round: 0,
        }
    }

    /// Build a forest from a `BehaviorForest` document: one node per
    /// `BehaviorTree` child, one channel per `Middleware` child. The node
    /// role is inferred from the tree name.
    pub fn load_from_xml(source: &str, registry: &Registry) -> Result<Forest, LoadError> {
        let def = match parse_document(source)? {
            DocumentDef::Forest(def) => def,
            DocumentDef::Tree(_) => return Err(LoadError::UnexpectedRoot("BehaviorTree".to_owned())),
        };
        let mut forest = Forest::new(def.name.clone());
        for tree_def in &def.trees {
            let root = build_tree(tree_def, registry)?;
            let mut tree = BehaviorTree::new(tree_def.name.clone());
            tree.load_from_node(root)?;
            let node = ForestNode::new(tree_def.name.clone(), tree)
                .with_type(node_type_from_name(&tree_def.name));
            forest.add_node(node).map_err(|_| LoadError::DuplicateName {
                kind: "tree",
                name: tree_def.name.clone(),
            })?;
        }
        for middleware in &def.middlewares {
            let channel = Channel::from_kind(&middleware.kind)
                .ok_or_else(|| LoadError::UnknownMiddleware(middleware.kind.clone()))?;
            forest
                .add_middleware(&middleware.name, channel)
                .map_err(|_| LoadError::DuplicateName {
                    kind: "middleware",
                    name: middleware.name.clone(),
                })?;
        }
        Ok(forest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Token cancelled by [`Self::stop`]; clone it to end a [`Self::run`]
    /// loop from another task.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a tree. Names are unique; registration is rejected while
    /// the forest runs. Nodes without explicit capabilities get their role
    /// name as the default capability.
    pub fn add_node(&mut self, mut node: ForestNode) -> Result<(), ForestError> {
        self.ensure_mutable()?;
        if self.nodes.iter().any(|n| n.name == node.name) {
            return Err(ForestError::DuplicateNode(node.name));
        }
        if node.capabilities.is_empty() {
            node.capabilities.insert(node.node_type.as_str().to_owned());
        }
        self.events
            .emit(NODE_ADDED, value_map! { "node" => node.name.clone() });
        self.nodes.push(node);
        Ok(())
    }

    pub fn remove_node(&mut self, name: &str) -> Result<ForestNode, ForestError> {
        self.ensure_mutable()?;
        let index = self
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| ForestError::UnknownNode(name.to_owned()))?;
        self.events
            .emit(NODE_REMOVED, value_map! { "node" => name });
        Ok(self.nodes.remove(index))
    }

    pub fn node(&self, name: &str) -> Option<&ForestNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut ForestNode> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[ForestNode] {
        &self.nodes
    }

    pub fn nodes_by_type(&self, node_type: ForestNodeType) -> Vec<&ForestNode> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == node_type)
            .collect()
    }

    pub fn nodes_by_capability(&self, capability: &str) -> Vec<&ForestNode> {
        self.nodes
            .iter()
            .filter(|n| n.has_capability(capability))
            .collect()
    }

    /// Attach a middleware channel under a unique name. Channels start in
    /// registration order and stop in reverse.
    pub fn add_middleware(&mut self, name: &str, channel: Channel) -> Result<(), ForestError> {
        self.ensure_mutable()?;
        if self.channels.iter().any(|(n, _)| n == name) {
            return Err(ForestError::DuplicateMiddleware(name.to_owned()));
        }
        self.channels.push((name.to_owned(), channel));
        Ok(())
    }

    pub fn remove_middleware(&mut self, name: &str) -> Result<Channel, ForestError> {
        self.ensure_mutable()?;
        let index = self
            .channels
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| ForestError::UnknownMiddleware(name.to_owned()))?;
        Ok(self.channels.remove(index).1)
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, channel)| channel)
    }

    pub fn pub_sub(&self, name: &str) -> Result<PubSub, ChannelError> {
        match self.lookup(name)? {
            Channel::PubSub(channel) => Ok(channel.clone()),
            other => Err(mismatch(name, "PubSub", other)),
        }
    }

    pub fn req_resp(&self, name: &str) -> Result<ReqResp, ChannelError> {
        match self.lookup(name)? {
            Channel::ReqResp(channel) => Ok(channel.clone()),
            other => Err(mismatch(name, "ReqResp", other)),
        }
    }

    pub fn shared_blackboard(&self, name: &str) -> Result<SharedBlackboard, ChannelError> {
        match self.lookup(name)? {
            Channel::SharedBlackboard(channel) => Ok(channel.clone()),
            other => Err(mismatch(name, "SharedBlackboard", other)),
        }
    }

    pub fn state_watch(&self, name: &str) -> Result<StateWatch, ChannelError> {
        match self.lookup(name)? {
            Channel::StateWatch(channel) => Ok(channel.clone()),
            other => Err(mismatch(name, "StateWatch", other)),
        }
    }

    pub fn task_board(&self, name: &str) -> Result<TaskBoard, ChannelError> {
        match self.lookup(name)? {
            Channel::TaskBoard(channel) => Ok(channel.clone()),
            other => Err(mismatch(name, "TaskBoard", other)),
        }
    }

    pub fn behavior_call(&self, name: &str) -> Result<BehaviorCall, ChannelError> {
        match self.lookup(name)? {
            Channel::BehaviorCall(channel) => Ok(channel.clone()),
            other => Err(mismatch(name, "BehaviorCall", other)),
        }
    }

    /// Transition IDLE → RUNNING and start middlewares in registration
    /// order. A failing start rolls the already-started ones back, in
    /// reverse, and the forest returns to IDLE.
    pub async fn start(&mut self) -> Result<(), ForestError> {
        if self.state != RunState::Idle {
            return Err(ForestError::InvalidState { state: self.state });
        }
        self.cancel = CancellationToken::new();
        let env = ChannelEnv {
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        };
        for started in 0..self.channels.len() {
            if let Err(err) = self.channels[started].1.start(&env).await {
                for (_, channel) in self.channels[..started].iter().rev() {
                    channel.stop().await;
                }
                return Err(err.into());
            }
        }
        self.state = RunState::Running;
        self.events
            .emit(FOREST_STARTED, value_map! { "forest" => self.name.clone() });
        Ok(())
    }

    /// Transition RUNNING → STOPPED: cancel in-flight ticks cooperatively
    /// and stop middlewares in reverse order. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.state != RunState::Running {
            return;
        }
        self.cancel.cancel();
        for (_, channel) in self.channels.iter().rev() {
            channel.stop().await;
        }
        self.state = RunState::Stopped;
        self.events
            .emit(FOREST_STOPPED, value_map! { "forest" => self.name.clone() });
    }

    /// One round over every tree: dependency layers in topological order,
    /// trees inside a layer concurrently. Returns each tree's status.
    pub async fn tick(&mut self) -> Result<HashMap<String, Status>, ForestError> {
        if self.state == RunState::Stopped {
            return Err(ForestError::InvalidState { state: self.state });
        }
        let layers = self.layers()?;
        self.round += 1;
        let round = self.round;

        for (_, channel) in &self.channels {
            channel.before_tick(round).await;
        }

        let mut results = HashMap::new();
        for layer in &layers {
            let cancel = self.cancel.clone();
            let ticks = self
                .nodes
                .iter_mut()
                .filter(|node| layer.iter().any(|name| name == &node.name))
                .map(|node| {
                    let cancel = cancel.clone();
                    async move {
                        let status = node.tick(&cancel).await;
                        (node.name.clone(), status)
                    }
                });
            for (name, status) in join_all(ticks).await {
                results.insert(name, status);
            }
        }

        for (_, channel) in &self.channels {
            channel.after_tick(round, &results).await;
        }
        Ok(results)
    }

    /// Tick repeatedly at `period` until the cancellation token fires
    /// (see [`Self::cancellation`]). Scheduling targets fixed points in
    /// time, so one slow round does not shift the following ones.
    pub async fn run(&mut self, period: Duration) -> Result<(), ForestError> {
        if self.state != RunState::Running {
            return Err(ForestError::InvalidState { state: self.state });
        }
        let cancel = self.cancel.clone();
        let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.tick().await?;
                }
            }
        }
        Ok(())
    }

    fn layers(&self) -> Result<Vec<Vec<String>>, ForestError> {
        let nodes: Vec<(String, HashSet<String>)> = self
            .nodes
            .iter()
            .map(|node| (node.name.clone(), node.dependencies.clone()))
            .collect();
        topological_layers(&nodes)
    }

    fn lookup(&self, name: &str) -> Result<&Channel, ChannelError> {
        self.channel(name)
            .ok_or_else(|| ChannelError::UnknownChannel(name.to_owned()))
    }

    fn ensure_mutable(&self) -> Result<(), ForestError> {
        if self.state == RunState::Running {
            return Err(ForestError::InvalidState { state: self.state });
        }
        Ok(())
    }
}

fn mismatch(name: &str, expected: &'static str, actual: &Channel) -> ChannelError {
    ChannelError::VariantMismatch {
        name: name.to_owned(),
        expected,
        actual: actual.kind_name(),
    }
}

fn node_type_from_name(name: &str) -> ForestNodeType {
    let lower = name.to_ascii_lowercase();
    if lower.contains("master") || lower.contains("trigger") || lower.contains("coordinator") {
        ForestNodeType::Master
    } else if lower.contains("monitor") || lower.contains("watch") {
        ForestNodeType::Monitor
    } else {
        ForestNodeType::Worker
    }
}

/// Partition `(name, dependencies)` pairs into layers where every node's
/// dependencies live in strictly earlier layers.
pub(crate) fn topological_layers(
    nodes: &[(String, HashSet<String>)],
) -> Result<Vec<Vec<String>>, ForestError> {
    let known: HashSet<&str> = nodes.iter().map(|(name, _)| name.as_str()).collect();
    for (name, dependencies) in nodes {
        for dependency in dependencies {
            if !known.contains(dependency.as_str()) {
                return Err(ForestError::UnknownDependency {
                    node: name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut unmet: HashMap<&str, HashSet<&str>> = nodes
        .iter()
        .map(|(name, deps)| {
            (
                name.as_str(),
                deps.iter().map(String::as_str).collect::<HashSet<&str>>(),
            )
        })
        .collect();
    let mut layers = Vec::new();
    while !unmet.is_empty() {
        let ready: Vec<String> = nodes
            .iter()
            .filter(|(name, _)| unmet.get(name.as_str()).is_some_and(HashSet::is_empty))
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            let mut stuck: Vec<String> = unmet.keys().map(|name| (*name).to_owned()).collect();
            stuck.sort_unstable();
            return Err(ForestError::CyclicDependency(stuck));
        }
        for name in &ready {
            unmet.remove(name.as_str());
        }
        for deps in unmet.values_mut() {
            for name in &ready {
                deps.remove(name.as_str());
            }
        }
        layers.push(ready);
    }
    Ok(layers)
}

#[cfg(test)]
mod test {
    use super::*;

    fn deps(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn layers_respect_dependencies() {
        let nodes = vec![
            ("a".to_owned(), deps(&[])),
            ("b".to_owned(), deps(&["a"])),
            ("c".to_owned(), deps(&["a"])),
            ("d".to_owned(), deps(&["b", "c"])),
        ];
        let layers = topological_layers(&nodes).unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["a".to_owned()],
                vec!["b".to_owned(), "c".to_owned()],
                vec!["d".to_owned()],
            ]
        );
    }

    #[test]
    fn unknown_and_cyclic_dependencies_are_rejected() {
        let nodes = vec![("a".to_owned(), deps(&["ghost"]))];
        assert!(matches!(
            topological_layers(&nodes),
            Err(ForestError::UnknownDependency { .. })
        ));

        let nodes = vec![
            ("a".to_owned(), deps(&["b"])),
            ("b".to_owned(), deps(&["a"])),
        ];
        assert!(matches!(
            topological_layers(&nodes),
            Err(ForestError::CyclicDependency(names)) if names == vec!["a", "b"]
        ));
    }

    #[test]
    fn node_roles_follow_naming() {
        assert_eq!(node_type_from_name("FireMaster"), ForestNodeType::Master);
        assert_eq!(node_type_from_name("hall_monitor"), ForestNodeType::Monitor);
        assert_eq!(node_type_from_name("mover"), ForestNodeType::Worker);
    }
}
