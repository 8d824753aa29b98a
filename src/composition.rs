use graphql_parser::schema::{
    Definition, Directive, Field, Type, TypeDefinition, TypeExtension, Value,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::{
    SchemaDocument, SubgraphDescriptor, Supergraph, TypeKind,
    introspection::IntrospectionError,
};

const BUILTIN_SCALARS: [&str; 5] = ["String", "Int", "Float", "Boolean", "ID"];

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("Cannot compose an empty list of subgraphs")]
    NoSubgraphs,
    #[error("Subgraph {0} is defined more than once")]
    DuplicateSubgraph(String),
    #[error("Field {field} is defined by more than one subgraph: {services:?}")]
    RootFieldConflict { field: String, services: Vec<String> },
    #[error("Subgraph name {0} is reserved")]
    ReservedName(String),
    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
}

/// Merges subgraph descriptors into a supergraph.
pub trait Composer: Send + Sync {
    fn compose(&self, subgraphs: Vec<SubgraphDescriptor>) -> Result<Supergraph, CompositionError>;
}

/// Root types as named by a subgraph's `schema` definition, falling back to
/// `Query` and `Mutation`.
pub fn root_operation_types(document: &SchemaDocument) -> (String, Option<String>) {
    let schema = document.definitions.iter().find_map(|definition| match definition {
        Definition::SchemaDefinition(schema) => Some(schema),
        _ => None,
    });

    match schema {
        Some(schema) => (
            schema.query.clone().unwrap_or_else(|| "Query".to_string()),
            schema.mutation.clone(),
        ),
        None => {
            let has_mutation = document.definitions.iter().any(|definition| {
                matches!(
                    definition,
                    Definition::TypeDefinition(TypeDefinition::Object(object))
                        if object.name == "Mutation"
                )
            });
            ("Query".to_string(), has_mutation.then(|| "Mutation".to_string()))
        }
    }
}

#[derive(Default)]
pub struct SupergraphComposer;

impl SupergraphComposer {
    pub fn new() -> Self {
        SupergraphComposer
    }
}

impl Composer for SupergraphComposer {
    fn compose(&self, subgraphs: Vec<SubgraphDescriptor>) -> Result<Supergraph, CompositionError> {
        if subgraphs.is_empty() {
            return Err(CompositionError::NoSubgraphs);
        }

        let mut seen = HashSet::new();
        let mut builder = SupergraphBuilder::default();
        for subgraph in &subgraphs {
            if !seen.insert(subgraph.name.as_str()) {
                return Err(CompositionError::DuplicateSubgraph(subgraph.name.clone()));
            }
            builder.ingest(subgraph);
        }

        builder.check_root_fields()?;

        debug!(
            subgraphs = subgraphs.len(),
            entries = builder.type_to_service_map.len(),
            "composed supergraph"
        );
        Ok(builder.finish(subgraphs))
    }
}

#[derive(Default)]
struct SupergraphBuilder {
    has_mutation: bool,
    type_kinds: HashMap<String, TypeKind>,
    type_to_service_map: HashMap<String, Vec<String>>,
    field_types: HashMap<String, String>,
    entity_keys: HashMap<String, Vec<String>>,
    implementations: HashMap<String, Vec<String>>,
}

impl SupergraphBuilder {
    fn ingest(&mut self, subgraph: &SubgraphDescriptor) {
        let service = subgraph.name.as_str();
        let (query_type, mutation_type) = root_operation_types(&subgraph.type_defs);
        self.has_mutation |= mutation_type.is_some();

        // Root types are merged under their conventional names.
        let canonical = |name: &str| -> String {
            if name == query_type {
                "Query".to_string()
            } else if mutation_type.as_deref() == Some(name) {
                "Mutation".to_string()
            } else {
                name.to_string()
            }
        };

        for definition in &subgraph.type_defs.definitions {
            match definition {
                Definition::TypeDefinition(typedef) => match typedef {
                    TypeDefinition::Object(object) => self.object(
                        service,
                        &canonical(&object.name),
                        &object.implements_interfaces,
                        &object.directives,
                        &object.fields,
                    ),
                    TypeDefinition::Interface(iface) => {
                        self.interface(service, &iface.name, &iface.directives, &iface.fields)
                    }
                    TypeDefinition::Union(union_type) => {
                        self.union(service, &union_type.name, &union_type.types)
                    }
                    TypeDefinition::Scalar(scalar) => {
                        self.declare(service, &scalar.name, TypeKind::Scalar)
                    }
                    TypeDefinition::Enum(enum_type) => {
                        self.declare(service, &enum_type.name, TypeKind::Enum)
                    }
                    TypeDefinition::InputObject(input) => {
                        self.declare(service, &input.name, TypeKind::InputObject)
                    }
                },
                Definition::TypeExtension(extension) => match extension {
                    TypeExtension::Object(object) => self.object(
                        service,
                        &canonical(&object.name),
                        &object.implements_interfaces,
                        &object.directives,
                        &object.fields,
                    ),
                    TypeExtension::Interface(iface) => {
                        self.interface(service, &iface.name, &iface.directives, &iface.fields)
                    }
                    TypeExtension::Union(union_type) => {
                        self.union(service, &union_type.name, &union_type.types)
                    }
                    TypeExtension::Scalar(scalar) => {
                        self.declare(service, &scalar.name, TypeKind::Scalar)
                    }
                    TypeExtension::Enum(enum_type) => {
                        self.declare(service, &enum_type.name, TypeKind::Enum)
                    }
                    TypeExtension::InputObject(input) => {
                        self.declare(service, &input.name, TypeKind::InputObject)
                    }
                },
                _ => {}
            }
        }
    }

    fn declare(&mut self, service: &str, type_name: &str, kind: TypeKind) {
        self.type_kinds.entry(type_name.to_string()).or_insert(kind);
        push_unique(&mut self.type_to_service_map, type_name, service);
    }

    fn object(
        &mut self,
        service: &str,
        type_name: &str,
        interfaces: &[String],
        directives: &[Directive<'static, String>],
        fields: &[Field<'static, String>],
    ) {
        self.declare(service, type_name, TypeKind::Object);
        for iface in interfaces {
            push_unique(&mut self.implementations, iface, type_name);
        }
        self.keys(type_name, directives);
        self.fields(service, type_name, fields);
    }

    fn interface(
        &mut self,
        service: &str,
        type_name: &str,
        directives: &[Directive<'static, String>],
        fields: &[Field<'static, String>],
    ) {
        self.declare(service, type_name, TypeKind::Interface);
        self.keys(type_name, directives);
        self.fields(service, type_name, fields);
    }

    fn union(&mut self, service: &str, type_name: &str, members: &[String]) {
        self.declare(service, type_name, TypeKind::Union);
        for member in members {
            push_unique(&mut self.implementations, type_name, member);
        }
    }

    /// The first `@key` seen for a type wins.
    fn keys(&mut self, type_name: &str, directives: &[Directive<'static, String>]) {
        if self.entity_keys.contains_key(type_name) {
            return;
        }
        let key = directives
            .iter()
            .filter(|directive| directive.name == "key")
            .find_map(|directive| {
                directive.arguments.iter().find_map(|(name, value)| match value {
                    Value::String(fields) if name == "fields" => Some(fields.clone()),
                    _ => None,
                })
            });
        if let Some(fields) = key {
            self.entity_keys.insert(
                type_name.to_string(),
                fields.split_whitespace().map(str::to_string).collect(),
            );
        }
    }

    fn fields(&mut self, service: &str, type_name: &str, fields: &[Field<'static, String>]) {
        for field in fields {
            let field_key = format!("{}.{}", type_name, field.name);
            self.field_types
                .entry(field_key.clone())
                .or_insert_with(|| named_type(&field.field_type).to_string());

            let external = field.directives.iter().any(|d| d.name == "external");
            if !external {
                push_unique(&mut self.type_to_service_map, &field_key, service);
            }
        }
    }

    fn check_root_fields(&self) -> Result<(), CompositionError> {
        let mut conflicts: Vec<_> = self
            .type_to_service_map
            .iter()
            .filter(|(key, services)| {
                (key.starts_with("Query.") || key.starts_with("Mutation.")) && services.len() > 1
            })
            .collect();
        conflicts.sort_by(|a, b| a.0.cmp(b.0));

        match conflicts.first() {
            Some((field, services)) => Err(CompositionError::RootFieldConflict {
                field: field.to_string(),
                services: services.to_vec(),
            }),
            None => Ok(()),
        }
    }

    fn finish(mut self, subgraphs: Vec<SubgraphDescriptor>) -> Supergraph {
        for scalar in BUILTIN_SCALARS {
            self.type_kinds
                .entry(scalar.to_string())
                .or_insert(TypeKind::Scalar);
        }

        Supergraph {
            subgraphs,
            query_type: "Query".to_string(),
            mutation_type: self.has_mutation.then(|| "Mutation".to_string()),
            type_kinds: self.type_kinds,
            type_to_service_map: self.type_to_service_map,
            field_types: self.field_types,
            entity_keys: self.entity_keys,
            implementations: self.implementations,
        }
    }
}

fn push_unique(map: &mut HashMap<String, Vec<String>>, key: &str, value: &str) {
    let values = map.entry(key.to_string()).or_default();
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

fn named_type<'a>(ty: &'a Type<'static, String>) -> &'a str {
    match ty {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}
