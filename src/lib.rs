pub mod composition;
pub mod config;
pub mod data_source;
pub mod federation_gateway;
pub mod global_id;
pub mod introspection;
pub mod node_compose;
pub mod node_scanner;
pub mod node_schema;
pub mod query_executor;
pub mod query_planner;
pub mod schema_registry;
pub mod selection;
pub mod value;

pub use composition::{Composer, CompositionError, SupergraphComposer};
pub use data_source::{
    DataSource, DataSourceRouter, HttpDataSource, HttpDataSourceRouter, LocalDataSource,
    NodeDataSourceRouter,
};
pub use federation_gateway::{FederationGateway, GatewayError, Snapshot};
pub use global_id::GlobalId;
pub use node_compose::{NODE_SERVICE_NAME, NodeCompose, NodeSchemaCache};
pub use node_schema::NodeSchema;
pub use query_executor::FederatedQueryExecutor;
pub use query_planner::FederatedQueryPlanner;
pub use schema_registry::InMemorySchemaRegistry;

use graphql_parser::schema::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type SchemaDocument = graphql_parser::schema::Document<'static, String>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    pub schema: String,
}

/// One subgraph as seen by composition: its name, its parsed type definitions
/// and, for real services, the URL it is reachable at.
#[derive(Clone, Debug, PartialEq)]
pub struct SubgraphDescriptor {
    pub name: String,
    pub type_defs: SchemaDocument,
    pub service_url: Option<String>,
}

impl SubgraphDescriptor {
    pub fn parse(
        name: impl Into<String>,
        sdl: &str,
        service_url: Option<String>,
    ) -> Result<Self, ParseError> {
        let type_defs = graphql_parser::parse_schema::<String>(sdl)?.into_static();
        Ok(SubgraphDescriptor {
            name: name.into(),
            type_defs,
            service_url,
        })
    }
}

impl TryFrom<ServiceConfig> for SubgraphDescriptor {
    type Error = ParseError;

    fn try_from(service: ServiceConfig) -> Result<Self, Self::Error> {
        SubgraphDescriptor::parse(service.name, &service.schema, Some(service.url))
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct GraphQLRequest {
    pub query: String,
    pub variables: Option<Value>,
    #[serde(rename = "operationName")]
    pub operation_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Scalar,
    Enum,
    InputObject,
}

/// The composed view of every subgraph plus the routing data the planner needs.
///
/// `type_to_service_map` is keyed by `Type` and `Type.field`; the services are
/// listed in subgraph order and `@external` fields are not counted as owned.
#[derive(Clone, Debug, PartialEq)]
pub struct Supergraph {
    pub subgraphs: Vec<SubgraphDescriptor>,
    pub query_type: String,
    pub mutation_type: Option<String>,
    pub type_kinds: HashMap<String, TypeKind>,
    pub type_to_service_map: HashMap<String, Vec<String>>,
    pub field_types: HashMap<String, String>,
    pub entity_keys: HashMap<String, Vec<String>>,
    pub implementations: HashMap<String, Vec<String>>,
}

impl Supergraph {
    pub fn subgraph(&self, name: &str) -> Option<&SubgraphDescriptor> {
        self.subgraphs.iter().find(|subgraph| subgraph.name == name)
    }

    pub fn owners(&self, type_name: &str, field: &str) -> &[String] {
        self.type_to_service_map
            .get(&format!("{}.{}", type_name, field))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn owner_of(&self, type_name: &str, field: &str) -> Option<&str> {
        self.owners(type_name, field).first().map(String::as_str)
    }

    /// Whether `service` defines or extends `type_name`.
    pub fn declares(&self, service: &str, type_name: &str) -> bool {
        self.type_to_service_map
            .get(type_name)
            .is_some_and(|services| services.iter().any(|s| s == service))
    }

    pub fn keys(&self, type_name: &str) -> &[String] {
        self.entity_keys
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_key_field(&self, type_name: &str, field: &str) -> bool {
        self.keys(type_name).iter().any(|key| key == field)
    }

    /// Key fields are available from any subgraph that knows the type.
    pub fn can_resolve(&self, service: &str, type_name: &str, field: &str) -> bool {
        self.owners(type_name, field).iter().any(|s| s == service)
            || (self.is_key_field(type_name, field) && self.declares(service, type_name))
    }

    pub fn field_type(&self, type_name: &str, field: &str) -> Option<&str> {
        if field == "__typename" {
            return Some("String");
        }
        self.field_types
            .get(&format!("{}.{}", type_name, field))
            .map(String::as_str)
    }

    pub fn is_composite(&self, type_name: &str) -> bool {
        matches!(
            self.type_kinds.get(type_name),
            Some(TypeKind::Object | TypeKind::Interface | TypeKind::Union)
        )
    }

    /// Whether an object of type `concrete` matches a fragment on `condition`.
    pub fn is_possible_type(&self, condition: &str, concrete: &str) -> bool {
        condition == concrete
            || self
                .implementations
                .get(condition)
                .is_some_and(|types| types.iter().any(|t| t == concrete))
    }
}
