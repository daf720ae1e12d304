//! XML front-end: parses a document into definition values without touching
//! the registry, so syntax errors surface with positions before any node is
//! constructed.

use roxmltree::Document;

use crate::error::LoadError;
use crate::registry::NodeConfig;

/// One XML element destined to become a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDef {
    /// Element tag, resolved through the registry.
    pub ty: String,
    /// The `name` attribute, defaulting to the tag.
    pub name: String,
    pub config: NodeConfig,
    pub children: Vec<ElementDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDef {
    pub name: String,
    pub root: ElementDef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareDef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForestDef {
    pub name: String,
    pub trees: Vec<TreeDef>,
    pub middlewares: Vec<MiddlewareDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentDef {
    Tree(TreeDef),
    Forest(ForestDef),
}

/// Parse a document whose outermost element is `BehaviorTree` or
/// `BehaviorForest`.
pub fn parse_document(source: &str) -> Result<DocumentDef, LoadError> {
    let doc = Document::parse(source).map_err(LoadError::from_xml)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "BehaviorTree" => Ok(DocumentDef::Tree(parse_tree(&doc, root)?)),
        "BehaviorForest" => Ok(DocumentDef::Forest(parse_forest(&doc, root)?)),
        other => Err(LoadError::UnexpectedRoot(other.to_owned())),
    }
}

fn parse_tree(doc: &Document, element: roxmltree::Node) -> Result<TreeDef, LoadError> {
    let name = element
        .attribute("name")
        .unwrap_or("BehaviorTree")
        .to_owned();
    let mut root = None;
    for child in element.children().filter(roxmltree::Node::is_element) {
        if root.is_some() {
            return Err(position_error(
                doc,
                child,
                format!("tree {name:?} has more than one root element"),
            ));
        }
        root = Some(parse_element(doc, child)?);
    }
    match root {
        Some(root) => Ok(TreeDef { name, root }),
        None => Err(LoadError::MissingRoot { name }),
    }
}

fn parse_element(doc: &Document, element: roxmltree::Node) -> Result<ElementDef, LoadError> {
    let ty = element.tag_name().name().to_owned();
    let mut name = ty.clone();
    let mut config = NodeConfig::new();
    for attr in element.attributes() {
        if attr.name() == "name" {
            name = attr.value().to_owned();
        } else {
            config.insert(attr.name().to_owned(), attr.value().to_owned());
        }
    }
    let children = element
        .children()
        .filter(roxmltree::Node::is_element)
        .map(|child| parse_element(doc, child))
        .collect::<Result<_, _>>()?;
    Ok(ElementDef {
        ty,
        name,
        config,
        children,
    })
}

fn parse_forest(doc: &Document, element: roxmltree::Node) -> Result<ForestDef, LoadError> {
    let name = element
        .attribute("name")
        .unwrap_or("BehaviorForest")
        .to_owned();
    let mut trees = Vec::new();
    let mut middlewares = Vec::new();
    for child in element.children().filter(roxmltree::Node::is_element) {
        match child.tag_name().name() {
            "BehaviorTree" => trees.push(parse_tree(doc, child)?),
            "Middleware" => {
                let kind = child.attribute("kind").ok_or_else(|| {
                    position_error(doc, child, "Middleware element needs a kind".to_owned())
                })?;
                middlewares.push(MiddlewareDef {
                    kind: kind.to_owned(),
                    name: child.attribute("name").unwrap_or(kind).to_owned(),
                });
            }
            other => {
                return Err(position_error(
                    doc,
                    child,
                    format!("unexpected element {other:?} in a forest"),
                ))
            }
        }
    }
    Ok(ForestDef {
        name,
        trees,
        middlewares,
    })
}

fn position_error(doc: &Document, node: roxmltree::Node, message: String) -> LoadError {
    let pos = doc.text_pos_at(node.range().start);
    LoadError::Parse {
        line: pos.row,
        column: pos.col,
        message,
    }
}
