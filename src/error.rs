//! Error types, one enum per concern.
//!
//! Construction-time errors ([`TreeError`], [`LoadError`], [`ForestError`])
//! are returned to the caller; tick-time leaf failures never surface here —
//! they become [`Status::Failure`](crate::Status::Failure) plus an `error`
//! event. Middleware call failures ([`ChannelError`]) propagate to the
//! calling site inside the calling tree.

use thiserror::Error;

use crate::forest::RunState;

/// Structural validation failures when loading a tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("behavior tree has no root node")]
    MissingRoot,
    #[error("node under {path:?} has an empty name")]
    EmptyName { path: String },
    #[error("decorator {name:?} must have exactly one child, found {found}")]
    DecoratorArity { name: String, found: usize },
    #[error("node {name:?} cannot take more children")]
    TooManyChildren { name: String },
}

/// Failures while parsing XML or instantiating nodes through the registry.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("XML parse error at line {line}, column {column}: {message}")]
    Parse {
        line: u32,
        column: u32,
        message: String,
    },
    #[error("unknown node type {0:?}")]
    UnknownNodeType(String),
    #[error("unknown middleware kind {0:?}")]
    UnknownMiddleware(String),
    #[error("invalid attribute {attribute:?} on {node:?}: {message}")]
    Attribute {
        node: String,
        attribute: String,
        message: String,
    },
    #[error("document root must be BehaviorTree or BehaviorForest, found {0:?}")]
    UnexpectedRoot(String),
    #[error("duplicate {kind} {name:?} in forest document")]
    DuplicateName { kind: &'static str, name: String },
    #[error("behavior tree {name:?} has no root element")]
    MissingRoot { name: String },
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl LoadError {
    pub(crate) fn from_xml(err: roxmltree::Error) -> Self {
        let pos = err.pos();
        LoadError::Parse {
            line: pos.row,
            column: pos.col,
            message: err.to_string(),
        }
    }
}

/// Forest lifecycle and topology failures.
#[derive(Debug, Error)]
pub enum ForestError {
    #[error("operation not allowed while the forest is {state:?}")]
    InvalidState { state: RunState },
    #[error("forest node {0:?} already exists")]
    DuplicateNode(String),
    #[error("forest node {0:?} does not exist")]
    UnknownNode(String),
    #[error("middleware {0:?} already exists")]
    DuplicateMiddleware(String),
    #[error("middleware {0:?} does not exist")]
    UnknownMiddleware(String),
    #[error("forest {0:?} already exists")]
    DuplicateForest(String),
    #[error("forest {0:?} does not exist")]
    UnknownForest(String),
    #[error("node {node:?} depends on unknown node {dependency:?}")]
    UnknownDependency { node: String, dependency: String },
    #[error("dependency cycle among {0:?}")]
    CyclicDependency(Vec<String>),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Middleware channel lookup and call failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no channel named {0:?}")]
    UnknownChannel(String),
    #[error("channel {name:?} is a {actual} channel, not {expected}")]
    VariantMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("no service registered as {0:?}")]
    NoService(String),
    #[error("service {service:?} failed: {source}")]
    ServiceError {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("call to {0:?} timed out")]
    Timeout(String),
    #[error("call to {0:?} was cancelled")]
    Cancelled(String),
    #[error("behavior call depth exceeded the limit of {0}")]
    CallDepthExceeded(usize),
}
