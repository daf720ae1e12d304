//! Back-end of the loader: instantiates parsed definitions through the
//! registry, and serializes live trees back to XML.

use crate::error::{LoadError, TreeError};
use crate::registry::Registry;
use crate::tree::BehaviorTree;
use crate::Node;

use super::xml::{ElementDef, TreeDef};

/// Instantiate a parsed tree. Every element type must resolve through the
/// registry; arity violations surface as [`TreeError`] values.
pub fn build_tree(def: &TreeDef, registry: &Registry) -> Result<Node, LoadError> {
    build_element(&def.root, registry)
}

fn build_element(def: &ElementDef, registry: &Registry) -> Result<Node, LoadError> {
    let mut node = registry.create(&def.ty, &def.name, &def.config)?;
    for child in &def.children {
        node.add_child(build_element(child, registry)?)?;
    }
    if node.kind().is_decorator() && node.children().len() != 1 {
        return Err(TreeError::DecoratorArity {
            name: def.name.clone(),
            found: node.children().len(),
        }
        .into());
    }
    Ok(node)
}

/// Serialize a tree back to the XML the loader accepts. A parsed document
/// survives the round trip with the same kinds, names, config and child
/// order.
pub fn to_xml(tree: &BehaviorTree) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "<BehaviorTree name=\"{}\">\n",
        escape(tree.name())
    ));
    if let Some(root) = tree.root() {
        write_node(&mut out, root, 1);
    }
    out.push_str("</BehaviorTree>\n");
    out
}

fn write_node(out: &mut String, node: &Node, depth: usize) {
    let indent = "  ".repeat(depth);
    out.push_str(&format!(
        "{indent}<{} name=\"{}\"",
        node.kind().kind_name(),
        escape(node.name())
    ));
    for (key, value) in node.config() {
        out.push_str(&format!(" {key}=\"{}\"", escape(value)));
    }
    if node.children().is_empty() {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");
    for child in node.children() {
        write_node(out, child, depth + 1);
    }
    out.push_str(&format!("{indent}</{}>\n", node.kind().kind_name()));
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod test {
    use super::super::xml::{parse_document, DocumentDef};
    use super::*;
    use crate::NodeKind;

    const DOOR: &str = r#"
<BehaviorTree name="door">
  <Selector name="root">
    <Sequence name="close">
      <CheckBlackboard name="open" key="door_open" expected_value="true"/>
      <Log name="announce" message="closing"/>
      <Wait name="settle" duration="0"/>
    </Sequence>
  </Selector>
</BehaviorTree>
"#;

    fn tree_def(source: &str) -> TreeDef {
        match parse_document(source).unwrap() {
            DocumentDef::Tree(def) => def,
            DocumentDef::Forest(_) => panic!("expected a tree"),
        }
    }

    #[test]
    fn builds_registered_elements() {
        let root = build_tree(&tree_def(DOOR), &Registry::default()).unwrap();
        assert!(matches!(root.kind(), NodeKind::Selector { .. }));
        let check = root.find("open").unwrap();
        assert_eq!(check.kind().kind_name(), "CheckBlackboard");
        assert_eq!(check.config().get("key").unwrap(), "door_open");
    }

    #[test]
    fn unknown_elements_fail() {
        let source = r#"<BehaviorTree name="t"><Teleport name="x"/></BehaviorTree>"#;
        let err = build_tree(&tree_def(source), &Registry::default()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownNodeType(ty) if ty == "Teleport"));
    }

    #[test]
    fn malformed_xml_reports_a_position() {
        let err = parse_document("<BehaviorTree name=\"t\">\n  <Sequence>").unwrap_err();
        match err {
            LoadError::Parse { line, .. } => assert!(line >= 1),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn childless_decorator_is_rejected() {
        let source = r#"<BehaviorTree name="t"><Inverter name="inv"/></BehaviorTree>"#;
        let err = build_tree(&tree_def(source), &Registry::default()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Tree(TreeError::DecoratorArity { .. })
        ));
    }

    #[test]
    fn serialization_round_trips() {
        let registry = Registry::default();
        let tree = BehaviorTree::from_xml(DOOR, &registry).unwrap();
        let first = to_xml(&tree);
        let reparsed = BehaviorTree::from_xml(&first, &registry).unwrap();
        assert_eq!(to_xml(&reparsed), first);
        assert_eq!(tree_def(DOOR), tree_def(&first));
    }

    #[tokio::test]
    async fn loading_is_pure() {
        let registry = Registry::default();
        let tree = BehaviorTree::from_xml(DOOR, &registry).unwrap();
        // Nothing has been ticked: every node still reports the initial
        // FAILURE convention and the blackboard is untouched.
        let stats = tree.stats();
        assert_eq!(stats.failed, stats.nodes);
        assert!(tree.blackboard().is_empty().await);
        assert_eq!(tree.last_status(), None);
    }
}
