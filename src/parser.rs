mod loader;
mod xml;

pub use loader::{build_tree, to_xml};
pub use xml::{parse_document, DocumentDef, ElementDef, ForestDef, MiddlewareDef, TreeDef};
