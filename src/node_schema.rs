//! The virtual `Node` subgraph.
//!
//! No real service owns `Query.node`, so one is synthesized per composition
//! pass: the `Node` interface, the root `node` field and a key-only stub for
//! every node type. The same module answers queries in process, including the
//! `_service { sdl }` self-description and `_entities` reference resolution
//! that every federated subgraph exposes.

use graphql_parser::{
    Pos,
    schema::{
        Definition, Directive, Field, InputValue, InterfaceType, ObjectType,
        ObjectTypeExtension, Type, TypeDefinition, TypeExtension, Value,
    },
};
use serde_json::{Map, Value as Json, json};
use std::{collections::HashMap, fmt::Display};
use thiserror::Error;
use tracing::debug;

use crate::{
    SchemaDocument,
    global_id::{self, MalformedIdError},
    node_scanner::{NODE_FIELD, NODE_INTERFACE, NodeTypes},
    selection::{FieldSelection, OperationKind, Selection, collect_fields, parse_operation},
    value::{to_json, variables_map},
};

pub const SERVICE_FIELD: &str = "_service";
pub const ENTITIES_FIELD: &str = "_entities";
pub const ID_FIELD: &str = "id";

const BAD_USER_INPUT: &str = "BAD_USER_INPUT";

#[derive(Debug, Error, PartialEq)]
#[error("Invalid node ID \"{id}\": unknown type \"{typename}\"")]
pub struct InvalidLookupIdError {
    pub id: String,
    pub typename: String,
}

/// Request-scoped lookup failures. All of them are the caller's fault.
#[derive(Debug, Error, PartialEq)]
pub enum NodeError {
    #[error("Invalid node ID \"{id}\": {source}")]
    Malformed {
        id: String,
        #[source]
        source: MalformedIdError,
    },
    #[error(transparent)]
    InvalidLookupId(#[from] InvalidLookupIdError),
    #[error("Field \"{field}\" argument \"{argument}\" is required")]
    MissingArgument {
        field: &'static str,
        argument: &'static str,
    },
}

impl NodeError {
    pub fn code(&self) -> &'static str {
        BAD_USER_INPUT
    }
}

/// A bare reference to an object owned by another subgraph.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeReference {
    pub typename: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeType {
    name: String,
}

impl NodeType {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn reference(&self, id: &str) -> NodeReference {
        NodeReference {
            typename: self.name.clone(),
            id: id.to_string(),
        }
    }
}

/// Typename to node type. Rebuilt from scratch on every composition pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeRegistry {
    types: HashMap<String, NodeType>,
}

impl NodeRegistry {
    pub fn from_types(node_types: &NodeTypes) -> Self {
        NodeRegistry {
            types: node_types
                .iter()
                .map(|name| (name.clone(), NodeType { name: name.clone() }))
                .collect(),
        }
    }

    pub fn get(&self, typename: &str) -> Option<&NodeType> {
        self.types.get(typename)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Debug)]
pub struct NodeSchema {
    type_defs: SchemaDocument,
    registry: NodeRegistry,
    sdl: String,
}

impl NodeSchema {
    /// Returns `None` when there is nothing to look up.
    pub fn synthesize(node_types: &NodeTypes) -> Option<Self> {
        if node_types.is_empty() {
            return None;
        }

        let mut definitions = vec![
            Definition::TypeDefinition(TypeDefinition::Interface(node_interface())),
            Definition::TypeDefinition(TypeDefinition::Object(query_type())),
        ];
        definitions.extend(
            node_types
                .iter()
                .map(|name| Definition::TypeExtension(TypeExtension::Object(stub_type(name)))),
        );

        let type_defs = SchemaDocument { definitions };
        let sdl = type_defs.to_string();
        debug!(types = node_types.len(), "synthesized node schema");

        Some(NodeSchema {
            type_defs,
            registry: NodeRegistry::from_types(node_types),
            sdl,
        })
    }

    pub fn type_defs(&self) -> &SchemaDocument {
        &self.type_defs
    }

    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn resolve_node(&self, id: &str) -> Result<NodeReference, NodeError> {
        let global_id = global_id::decode(id).map_err(|source| NodeError::Malformed {
            id: id.to_string(),
            source,
        })?;

        let node_type = self.registry.get(global_id.typename()).ok_or_else(|| {
            InvalidLookupIdError {
                id: id.to_string(),
                typename: global_id.typename().to_string(),
            }
        })?;

        Ok(node_type.reference(id))
    }

    /// Resolves an `_entities` representation. Only the typename is checked.
    pub fn resolve_entity(&self, representation: &Json) -> Result<NodeReference, NodeError> {
        let typename = representation
            .get("__typename")
            .and_then(Json::as_str)
            .ok_or(NodeError::MissingArgument {
                field: ENTITIES_FIELD,
                argument: "representations.__typename",
            })?;
        let id = representation
            .get(ID_FIELD)
            .and_then(id_string)
            .ok_or(NodeError::MissingArgument {
                field: ENTITIES_FIELD,
                argument: "representations.id",
            })?;

        let node_type = self
            .registry
            .get(typename)
            .ok_or_else(|| InvalidLookupIdError {
                id: id.clone(),
                typename: typename.to_string(),
            })?;

        Ok(node_type.reference(&id))
    }

    /// Executes a query against the virtual subgraph and returns a GraphQL
    /// response object.
    pub fn execute(&self, query: &str, variables: Option<&Json>) -> Json {
        let variables = variables_map(variables);
        let operation = match parse_operation(query, None, &variables) {
            Ok(operation) => operation,
            Err(e) => return json!({ "errors": [graphql_error(e, Vec::new(), None)] }),
        };
        if operation.kind != OperationKind::Query {
            return json!({
                "errors": [graphql_error("The node subgraph only supports queries", Vec::new(), None)]
            });
        }

        let mut errors = Vec::new();
        let mut data = Map::new();

        for field in collect_fields(&operation.selections, &|condition: &str| condition == "Query") {
            let key = field.response_key().to_string();
            let path = vec![Json::from(key.clone())];

            let value = match field.name.as_str() {
                "__typename" => json!("Query"),
                SERVICE_FIELD => self.project_service(&field.selections, path, &mut errors),
                NODE_FIELD => match argument(&field, ID_FIELD)
                    .and_then(|id| id_string(&id))
                    .ok_or(NodeError::MissingArgument {
                        field: NODE_FIELD,
                        argument: ID_FIELD,
                    })
                    .and_then(|id| self.resolve_node(&id))
                {
                    Ok(reference) => self.project(&reference, &field.selections, path, &mut errors),
                    Err(e) => {
                        errors.push(graphql_error(&e, path, Some(e.code())));
                        Json::Null
                    }
                },
                ENTITIES_FIELD => self.entities(&field, path, &mut errors),
                other => {
                    errors.push(graphql_error(
                        format!("Cannot query field \"{}\" on type \"Query\".", other),
                        path,
                        None,
                    ));
                    Json::Null
                }
            };

            data.insert(key, value);
        }

        if errors.is_empty() {
            json!({ "data": data })
        } else {
            json!({ "data": data, "errors": errors })
        }
    }

    fn entities(&self, field: &FieldSelection, path: Vec<Json>, errors: &mut Vec<Json>) -> Json {
        let Some(Json::Array(representations)) = argument(field, "representations") else {
            let e = NodeError::MissingArgument {
                field: ENTITIES_FIELD,
                argument: "representations",
            };
            errors.push(graphql_error(&e, path, Some(e.code())));
            return Json::Null;
        };

        let entities = representations
            .iter()
            .enumerate()
            .map(|(index, representation)| {
                let mut path = path.clone();
                path.push(Json::from(index));
                match self.resolve_entity(representation) {
                    Ok(reference) => self.project(&reference, &field.selections, path, errors),
                    Err(e) => {
                        errors.push(graphql_error(&e, path, Some(e.code())));
                        Json::Null
                    }
                }
            })
            .collect();

        Json::Array(entities)
    }

    fn project_service(
        &self,
        selections: &[Selection],
        path: Vec<Json>,
        errors: &mut Vec<Json>,
    ) -> Json {
        let mut object = Map::new();
        for field in collect_fields(selections, &|condition: &str| condition == "_Service") {
            let value = match field.name.as_str() {
                "__typename" => json!("_Service"),
                "sdl" => json!(self.sdl),
                other => {
                    errors.push(unknown_field(other, "_Service", &path, field.response_key()));
                    Json::Null
                }
            };
            object.insert(field.response_key().to_string(), value);
        }
        Json::Object(object)
    }

    fn project(
        &self,
        reference: &NodeReference,
        selections: &[Selection],
        path: Vec<Json>,
        errors: &mut Vec<Json>,
    ) -> Json {
        let applies = |condition: &str| {
            condition == NODE_INTERFACE || condition == reference.typename
        };

        let mut object = Map::new();
        for field in collect_fields(selections, &applies) {
            let value = match field.name.as_str() {
                "__typename" => json!(reference.typename),
                ID_FIELD => json!(reference.id),
                other => {
                    errors.push(unknown_field(
                        other,
                        &reference.typename,
                        &path,
                        field.response_key(),
                    ));
                    Json::Null
                }
            };
            object.insert(field.response_key().to_string(), value);
        }
        Json::Object(object)
    }
}

fn argument(field: &FieldSelection, name: &str) -> Option<Json> {
    field
        .arguments
        .iter()
        .find(|(argument, _)| argument == name)
        .map(|(_, value)| to_json(value, &Map::new()))
}

// IDs may arrive as integers.
fn id_string(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn graphql_error(message: impl Display, path: Vec<Json>, code: Option<&str>) -> Json {
    let mut error = Map::new();
    error.insert("message".to_string(), json!(message.to_string()));
    if !path.is_empty() {
        error.insert("path".to_string(), Json::Array(path));
    }
    if let Some(code) = code {
        error.insert("extensions".to_string(), json!({ "code": code }));
    }
    Json::Object(error)
}

fn unknown_field(field: &str, type_name: &str, path: &[Json], key: &str) -> Json {
    let mut path = path.to_vec();
    path.push(json!(key));
    graphql_error(
        format!("Cannot query field \"{}\" on type \"{}\".", field, type_name),
        path,
        None,
    )
}

fn named(name: &str) -> Type<'static, String> {
    Type::NamedType(name.to_string())
}

fn non_null(inner: Type<'static, String>) -> Type<'static, String> {
    Type::NonNullType(Box::new(inner))
}

fn directive(name: &str, arguments: Vec<(String, Value<'static, String>)>) -> Directive<'static, String> {
    Directive {
        position: Pos::default(),
        name: name.to_string(),
        arguments,
    }
}

fn id_field(directives: Vec<Directive<'static, String>>) -> Field<'static, String> {
    Field {
        position: Pos::default(),
        description: None,
        name: ID_FIELD.to_string(),
        arguments: Vec::new(),
        field_type: non_null(named("ID")),
        directives,
    }
}

fn node_interface() -> InterfaceType<'static, String> {
    let mut node = InterfaceType::new(NODE_INTERFACE.to_string());
    node.fields.push(id_field(Vec::new()));
    node
}

fn query_type() -> ObjectType<'static, String> {
    let mut query = ObjectType::new("Query".to_string());
    query.fields.push(Field {
        position: Pos::default(),
        description: None,
        name: NODE_FIELD.to_string(),
        arguments: vec![InputValue {
            position: Pos::default(),
            description: None,
            name: ID_FIELD.to_string(),
            value_type: non_null(named("ID")),
            default_value: None,
            directives: Vec::new(),
        }],
        field_type: named(NODE_INTERFACE),
        directives: Vec::new(),
    });
    query
}

/// `extend type T implements Node @key(fields: "id") { id: ID! @external }`
fn stub_type(name: &str) -> ObjectTypeExtension<'static, String> {
    let mut stub = ObjectTypeExtension::new(name.to_string());
    stub.implements_interfaces.push(NODE_INTERFACE.to_string());
    stub.directives.push(directive(
        "key",
        vec![("fields".to_string(), Value::String(ID_FIELD.to_string()))],
    ));
    stub.fields.push(id_field(vec![directive("external", Vec::new())]));
    stub
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_id::encode;
    use pretty_assertions::assert_eq;

    fn schema(types: &[&str]) -> NodeSchema {
        let node_types: NodeTypes = types.iter().map(|t| t.to_string()).collect();
        NodeSchema::synthesize(&node_types).unwrap()
    }

    fn stub_names(schema: &NodeSchema) -> Vec<String> {
        schema
            .type_defs()
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::TypeExtension(TypeExtension::Object(stub)) => Some(stub.name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn skips_empty_type_set() {
        assert!(NodeSchema::synthesize(&NodeTypes::new()).is_none());
    }

    #[test]
    fn builds_one_stub_per_node_type() {
        let schema = schema(&["Product", "Review"]);
        assert_eq!(stub_names(&schema), vec!["Product".to_string(), "Review".to_string()]);
        assert_eq!(schema.registry().len(), 2);
        assert!(schema.sdl().contains("node(id: ID!): Node"));
        assert!(
            schema
                .sdl()
                .contains("extend type Product implements Node @key(fields: \"id\")")
        );
        assert!(schema.sdl().contains("id: ID! @external"));
    }

    #[test]
    fn resolves_known_ids_to_references() {
        let schema = schema(&["Product"]);
        let id = encode("Product", "1");

        let response = schema.execute(
            "query($id: ID!) { node(id: $id) { __typename id ... on Product { id } } }",
            Some(&json!({ "id": id })),
        );

        assert_eq!(
            response,
            json!({ "data": { "node": { "__typename": "Product", "id": id } } })
        );
    }

    #[test]
    fn rejects_unknown_typename() {
        let schema = schema(&["Product"]);
        let id = encode("User", "1");

        assert_eq!(
            schema.resolve_node(&id),
            Err(NodeError::InvalidLookupId(InvalidLookupIdError {
                id: id.clone(),
                typename: "User".to_string(),
            }))
        );

        let response = schema.execute(&format!("{{ node(id: \"{}\") {{ id }} }}", id), None);
        assert_eq!(response["data"]["node"], Json::Null);
        assert_eq!(response["errors"][0]["extensions"]["code"], "BAD_USER_INPUT");
        assert_eq!(response["errors"][0]["path"], json!(["node"]));
    }

    #[test]
    fn rejects_malformed_ids() {
        let schema = schema(&["Product"]);
        assert!(matches!(
            schema.resolve_node("garbage"),
            Err(NodeError::Malformed { .. })
        ));
    }

    #[test]
    fn answers_service_sdl() {
        let schema = schema(&["Product"]);
        let response = schema.execute("query { _service { sdl } }", None);
        assert_eq!(response["data"]["_service"]["sdl"], json!(schema.sdl()));
    }

    #[test]
    fn resolves_entities_by_typename() {
        let schema = schema(&["Product"]);
        let response = schema.execute(
            "query($r: [_Any!]!) { _entities(representations: $r) { ... on Product { id } } }",
            Some(&json!({ "r": [
                { "__typename": "Product", "id": "a" },
                { "__typename": "User", "id": "b" },
            ] })),
        );

        assert_eq!(response["data"]["_entities"], json!([{ "id": "a" }, null]));
        assert_eq!(response["errors"][0]["path"], json!(["_entities", 1]));
    }

    #[test]
    fn reports_unknown_stub_fields() {
        let schema = schema(&["Product"]);
        let id = encode("Product", "1");
        let response = schema.execute(
            &format!("{{ node(id: \"{}\") {{ ... on Product {{ name }} }} }}", id),
            None,
        );
        assert_eq!(response["data"]["node"], json!({ "name": null }));
        assert_eq!(response["errors"][0]["path"], json!(["node", "name"]));
    }
}
