use graphql_parser::schema::{Definition, Field, TypeDefinition, TypeExtension};
use indexmap::IndexSet;
use tracing::debug;

use crate::{SubgraphDescriptor, composition::root_operation_types};

pub const NODE_INTERFACE: &str = "Node";
pub const NODE_FIELD: &str = "node";

/// Typenames implementing `Node`, in order of first appearance.
pub type NodeTypes = IndexSet<String>;

#[derive(Debug)]
pub struct ScanResult {
    pub subgraphs: Vec<SubgraphDescriptor>,
    pub node_types: NodeTypes,
}

/// Collects every `Node` implementor and strips the root `node` field from each
/// subgraph, so only the virtual subgraph ends up owning it.
pub fn scan(mut subgraphs: Vec<SubgraphDescriptor>) -> ScanResult {
    let mut node_types = NodeTypes::new();

    for subgraph in &mut subgraphs {
        let (query_type, _) = root_operation_types(&subgraph.type_defs);

        for definition in &mut subgraph.type_defs.definitions {
            match definition {
                Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                    if object.name == query_type {
                        strip_node_field(&mut object.fields, &subgraph.name);
                    } else if implements_node(&object.implements_interfaces)
                        && node_types.insert(object.name.clone())
                    {
                        debug!(
                            subgraph = %subgraph.name,
                            type_name = %object.name,
                            "found node type"
                        );
                    }
                }
                // Only the owner's definition counts; extensions point at a type
                // that lives elsewhere.
                Definition::TypeExtension(TypeExtension::Object(extension))
                    if extension.name == query_type =>
                {
                    strip_node_field(&mut extension.fields, &subgraph.name);
                }
                _ => {}
            }
        }
    }

    ScanResult {
        subgraphs,
        node_types,
    }
}

fn implements_node(interfaces: &[String]) -> bool {
    interfaces.iter().any(|name| name == NODE_INTERFACE)
}

fn strip_node_field(fields: &mut Vec<Field<'static, String>>, subgraph: &str) {
    let before = fields.len();
    fields.retain(|field| field.name != NODE_FIELD);
    if fields.len() != before {
        debug!(subgraph, "removed root node field");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subgraph(name: &str, sdl: &str) -> SubgraphDescriptor {
        SubgraphDescriptor::parse(name, sdl, Some(format!("http://{}/graphql", name))).unwrap()
    }

    fn query_fields(subgraph: &SubgraphDescriptor) -> Vec<String> {
        subgraph
            .type_defs
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::TypeDefinition(TypeDefinition::Object(object))
                    if object.name == "Query" =>
                {
                    Some(object.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn records_each_node_type_once() {
        let result = scan(vec![
            subgraph(
                "product",
                "type Product implements Node { id: ID! } interface Node { id: ID! }",
            ),
            subgraph(
                "review",
                "type Review implements Node { id: ID! } type Product implements Node { id: ID! }",
            ),
            subgraph("plain", "type Query { hello: String }"),
        ]);

        let types: Vec<_> = result.node_types.iter().cloned().collect();
        assert_eq!(types, vec!["Product".to_string(), "Review".to_string()]);
    }

    #[test]
    fn strips_only_the_root_node_field() {
        let result = scan(vec![subgraph(
            "product",
            r#"
            type Query {
              node(id: ID!): Node
              product(id: ID!): Product
            }
            type Product implements Node { id: ID! node: Node }
            "#,
        )]);

        assert_eq!(query_fields(&result.subgraphs[0]), vec!["product".to_string()]);
        // Non-root fields named `node` stay.
        let sdl = result.subgraphs[0].type_defs.to_string();
        assert!(sdl.contains("node: Node"));
    }

    #[test]
    fn honours_renamed_query_root() {
        let result = scan(vec![subgraph(
            "product",
            "schema { query: Root } type Root { node(id: ID!): Node other: Int }",
        )]);
        assert!(!result.subgraphs[0].type_defs.to_string().contains("node(id"));
    }

    #[test]
    fn strips_node_from_query_extensions() {
        let result = scan(vec![subgraph(
            "review",
            r#"
            type Query { review(id: ID!): Review }
            extend type Query {
              node(id: ID!): Node
              reviews: [Review]
            }
            type Review implements Node { id: ID! }
            "#,
        )]);

        let sdl = result.subgraphs[0].type_defs.to_string();
        assert!(!sdl.contains("node(id"));
        assert!(sdl.contains("extend type Query"));
        assert!(sdl.contains("reviews: [Review]"));
        assert_eq!(query_fields(&result.subgraphs[0]), vec!["review".to_string()]);
    }

    #[test]
    fn ignores_extensions_when_collecting() {
        let result = scan(vec![subgraph(
            "review",
            r#"extend type Product implements Node @key(fields: "id") { id: ID! @external }"#,
        )]);
        assert!(result.node_types.is_empty());
    }

    #[test]
    fn finds_nothing_without_node_types() {
        let input = vec![subgraph("plain", "type Query { hello: String }")];
        let result = scan(input.clone());
        assert!(result.node_types.is_empty());
        assert_eq!(result.subgraphs, input);
    }
}
