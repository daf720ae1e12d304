//! Named node-type factories, the extension mechanism behind the XML
//! loader. Factories receive the node name and the element's attribute map
//! and are responsible for coercing attribute text into typed parameters.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::LoadError;
use crate::nodes::{CompareOp, Node, Operand};
use crate::{Policy, Value};

/// Attribute map of one XML element, minus the reserved `name` attribute.
pub type NodeConfig = BTreeMap<String, String>;

pub type NodeFactory = Box<dyn Fn(&str, &NodeConfig) -> Result<Node, LoadError> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
}

impl NodeMetadata {
    fn builtin(description: &str, category: &str) -> Self {
        Self {
            description: description.to_owned(),
            category: category.to_owned(),
        }
    }
}

pub fn boxify<F>(f: F) -> NodeFactory
where
    F: Fn(&str, &NodeConfig) -> Result<Node, LoadError> + Send + Sync + 'static,
{
    Box::new(f)
}

pub struct Registry {
    entries: HashMap<String, Entry>,
}

struct Entry {
    factory: NodeFactory,
    metadata: NodeMetadata,
}

impl Default for Registry {
    fn default() -> Self {
        let mut ret = Self {
            entries: HashMap::new(),
        };
        ret.register(
            "Sequence",
            boxify(|name, _| Ok(Node::sequence(name))),
            NodeMetadata::builtin("all children must succeed, in order", "composite"),
        );
        ret.register(
            "Selector",
            boxify(|name, _| Ok(Node::selector(name))),
            NodeMetadata::builtin("first succeeding child wins", "composite"),
        );
        ret.register(
            "Parallel",
            boxify(|name, config| {
                let policy = match attr(config, "policy") {
                    None => Policy::RequireAll,
                    Some(text) => match text {
                        "require_all" => Policy::RequireAll,
                        "require_one" => Policy::RequireOne,
                        other => {
                            return Err(bad_attr(name, "policy", format!("unknown policy {other:?}")))
                        }
                    },
                };
                Ok(Node::parallel(name, policy))
            }),
            NodeMetadata::builtin("ticks all children concurrently", "composite"),
        );
        ret.register(
            "Inverter",
            boxify(|name, _| Ok(Node::inverter(name))),
            NodeMetadata::builtin("swaps success and failure", "decorator"),
        );
        ret.register(
            "Repeater",
            boxify(|name, config| {
                let count = match attr(config, "count") {
                    None | Some("infinite") => None,
                    Some(text) => Some(parse(name, "count", text)?),
                };
                Ok(Node::repeater(name, count))
            }),
            NodeMetadata::builtin("re-ticks its child a number of times", "decorator"),
        );
        ret.register(
            "UntilSuccess",
            boxify(|name, config| {
                Ok(Node::until_success(name, optional(name, config, "max_attempts")?))
            }),
            NodeMetadata::builtin("retries its child until it succeeds", "decorator"),
        );
        ret.register(
            "UntilFailure",
            boxify(|name, config| {
                Ok(Node::until_failure(name, optional(name, config, "max_attempts")?))
            }),
            NodeMetadata::builtin("retries its child until it fails", "decorator"),
        );
        ret.register(
            "Log",
            boxify(|name, config| {
                let level = match attr(config, "level") {
                    None => tracing::Level::INFO,
                    Some(text) => text
                        .parse()
                        .map_err(|_| bad_attr(name, "level", format!("unknown level {text:?}")))?,
                };
                Ok(Node::new(
                    name,
                    crate::NodeKind::Log {
                        message: attr(config, "message").unwrap_or("").to_owned(),
                        level,
                    },
                ))
            }),
            NodeMetadata::builtin("logs a message and succeeds", "leaf"),
        );
        ret.register(
            "Wait",
            boxify(|name, config| {
                let seconds: f64 = parse(name, "duration", require(name, config, "duration")?)?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(bad_attr(name, "duration", "must be a non-negative number".into()));
                }
                Ok(Node::wait(name, Duration::from_secs_f64(seconds)))
            }),
            NodeMetadata::builtin("succeeds after a delay, RUNNING meanwhile", "leaf"),
        );
        ret.register(
            "SetBlackboard",
            boxify(|name, config| {
                Ok(Node::set_blackboard(
                    name,
                    require(name, config, "key")?,
                    Value::parse(require(name, config, "value")?),
                ))
            }),
            NodeMetadata::builtin("writes a blackboard key", "leaf"),
        );
        ret.register(
            "CheckBlackboard",
            boxify(|name, config| {
                Ok(Node::check_blackboard(
                    name,
                    require(name, config, "key")?,
                    Value::parse(require(name, config, "expected_value")?),
                ))
            }),
            NodeMetadata::builtin("compares a blackboard key by value equality", "leaf"),
        );
        ret.register(
            "Compare",
            boxify(|name, config| {
                let op_text = require(name, config, "op")?;
                let op = CompareOp::parse(op_text)
                    .ok_or_else(|| bad_attr(name, "op", format!("unknown operator {op_text:?}")))?;
                Ok(Node::compare(
                    name,
                    Operand::Auto(require(name, config, "left")?.to_owned()),
                    op,
                    Operand::Auto(require(name, config, "right")?.to_owned()),
                ))
            }),
            NodeMetadata::builtin("compares blackboard keys or literals", "leaf"),
        );
        ret
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type. Re-registering a name replaces the previous
    /// factory and logs a warning.
    pub fn register(
        &mut self,
        type_name: impl ToString,
        factory: NodeFactory,
        metadata: NodeMetadata,
    ) {
        let name = type_name.to_string();
        if self
            .entries
            .insert(name.clone(), Entry { factory, metadata })
            .is_some()
        {
            tracing::warn!(node_type = %name, "node type re-registered, previous factory replaced");
        }
    }

    pub fn unregister(&mut self, type_name: &str) -> bool {
        self.entries.remove(type_name).is_some()
    }

    /// Build a fresh node of the named type. The config is retained on the
    /// node for introspection and re-serialization.
    pub fn create(
        &self,
        type_name: &str,
        node_name: &str,
        config: &NodeConfig,
    ) -> Result<Node, LoadError> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| LoadError::UnknownNodeType(type_name.to_owned()))?;
        let mut node = (entry.factory)(node_name, config)?;
        node.set_config(config.clone());
        Ok(node)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn registered(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn metadata(&self, type_name: &str) -> Option<&NodeMetadata> {
        self.entries.get(type_name).map(|entry| &entry.metadata)
    }
}

fn attr<'a>(config: &'a NodeConfig, key: &str) -> Option<&'a str> {
    config.get(key).map(String::as_str)
}

fn require<'a>(node: &str, config: &'a NodeConfig, key: &str) -> Result<&'a str, LoadError> {
    attr(config, key).ok_or_else(|| bad_attr(node, key, "missing".into()))
}

fn optional<T: std::str::FromStr>(
    node: &str,
    config: &NodeConfig,
    key: &str,
) -> Result<Option<T>, LoadError> {
    attr(config, key).map(|text| parse(node, key, text)).transpose()
}

fn parse<T: std::str::FromStr>(node: &str, key: &str, text: &str) -> Result<T, LoadError> {
    text.parse()
        .map_err(|_| bad_attr(node, key, format!("cannot parse {text:?}")))
}

fn bad_attr(node: &str, attribute: &str, message: String) -> LoadError {
    LoadError::Attribute {
        node: node.to_owned(),
        attribute: attribute.to_owned(),
        message,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_builds_registered_types() {
        let registry = Registry::default();
        let mut config = NodeConfig::new();
        config.insert("duration".into(), "1.5".into());
        let node = registry.create("Wait", "w", &config).unwrap();
        assert_eq!(node.kind().kind_name(), "Wait");
        assert_eq!(node.config().get("duration").unwrap(), "1.5");
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = Registry::default();
        let err = registry
            .create("Teleport", "t", &NodeConfig::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::UnknownNodeType(name) if name == "Teleport"));
    }

    #[test]
    fn bad_attributes_are_reported_with_the_node() {
        let registry = Registry::default();
        let mut config = NodeConfig::new();
        config.insert("duration".into(), "soon".into());
        let err = registry.create("Wait", "w", &config).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Attribute { node, attribute, .. } if node == "w" && attribute == "duration"
        ));
    }

    #[test]
    fn user_types_can_replace_builtins() {
        let mut registry = Registry::default();
        registry.register(
            "Sequence",
            boxify(|name, _| Ok(Node::selector(name))),
            NodeMetadata::default(),
        );
        let node = registry.create("Sequence", "s", &NodeConfig::new()).unwrap();
        assert_eq!(node.kind().kind_name(), "Selector");
    }
}
