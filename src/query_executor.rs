use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use graphql_parser::{
    Pos,
    query::{Type, VariableDefinition},
};
use serde_json::{Map, Value, json};
use std::{collections::HashMap, fmt::Display};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    Supergraph,
    data_source::{DataSourceError, SubgraphRequest},
    federation_gateway::Snapshot,
    node_schema::ENTITIES_FIELD,
    query_planner::{Fetch, QueryPlan, project},
    selection::{FieldSelection, OperationKind, Selection, collect_fields, print_operation},
    value::GraphQLValue,
};

const REPRESENTATIONS: &str = "representations";

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No data source bound for service {0}")]
    MissingDataSource(String),
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

#[async_trait]
pub trait QueryExecutor {
    async fn execute_plan(&self, plan: QueryPlan, snapshot: &Snapshot)
    -> Result<Value, ExecutionError>;
}

/// Runs root fetches, then fetches whatever the producing subgraph could not
/// resolve through `_entities` on the owning subgraph, one level at a time.
#[derive(Default)]
pub struct FederatedQueryExecutor;

impl FederatedQueryExecutor {
    pub fn new() -> Self {
        FederatedQueryExecutor
    }
}

#[async_trait]
impl QueryExecutor for FederatedQueryExecutor {
    async fn execute_plan(
        &self,
        plan: QueryPlan,
        snapshot: &Snapshot,
    ) -> Result<Value, ExecutionError> {
        if let Some(fetch) = plan
            .fetches
            .iter()
            .find(|fetch| snapshot.data_source(&fetch.service).is_none())
        {
            return Err(ExecutionError::MissingDataSource(fetch.service.clone()));
        }

        let execution = Execution {
            supergraph: &snapshot.supergraph,
            snapshot,
        };

        let results = if plan.kind == OperationKind::Mutation {
            let mut results = Vec::with_capacity(plan.fetches.len());
            for fetch in &plan.fetches {
                results.push(execution.fetch_root(plan.kind, &plan.root_type, fetch).await);
            }
            results
        } else {
            join_all(
                plan.fetches
                    .iter()
                    .map(|fetch| execution.fetch_root(plan.kind, &plan.root_type, fetch)),
            )
            .await
        };

        let mut data = Map::new();
        let mut errors = Vec::new();
        for (fields, fetch_errors) in results {
            data.extend(fields);
            errors.extend(fetch_errors);
        }

        let data = execution.shape(&Value::Object(data), &plan.root_type, &plan.selections);
        if errors.is_empty() {
            Ok(json!({ "data": data }))
        } else {
            Ok(json!({ "data": data, "errors": errors }))
        }
    }
}

struct Execution<'a> {
    supergraph: &'a Supergraph,
    snapshot: &'a Snapshot,
}

/// Fields of one object type that one subgraph is asked for through a
/// single `_entities` request.
struct EntityBatch {
    service: String,
    type_name: String,
    selections: Vec<Selection>,
    items: Vec<usize>,
}

impl EntityBatch {
    fn add(&mut self, item: usize, field: &FieldSelection) {
        if self.items.last() != Some(&item) {
            self.items.push(item);
        }
        let known = self.selections.iter().any(|selection| {
            matches!(selection, Selection::Field(f) if f.response_key() == field.response_key())
        });
        if !known {
            self.selections.push(Selection::Field(field.clone()));
        }
    }
}

/// Child objects from one level, completed together.
struct ChildBatch {
    producer: String,
    type_name: String,
    selections: Vec<Selection>,
    objects: Vec<Map<String, Value>>,
    paths: Vec<Vec<Value>>,
}

/// Where the objects of a child value went in its batch.
enum Slot {
    Object(usize),
    List(Vec<Slot>),
    Leaf(Value),
}

impl Execution<'_> {
    async fn fetch_root(
        &self,
        kind: OperationKind,
        root_type: &str,
        fetch: &Fetch,
    ) -> (Map<String, Value>, Vec<Value>) {
        let request = SubgraphRequest {
            query: print_operation(kind, Vec::new(), &fetch.selections),
            variables: None,
        };

        let (data, mut errors) = match self.send(&fetch.service, request).await {
            Ok(response) => {
                let data = response
                    .get("data")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                (data, tag_errors(&response, &fetch.service))
            }
            Err(e) => (
                Map::new(),
                vec![graphql_error(format!("Execution error: {}", e), &fetch.service)],
            ),
        };

        let root_fields: Vec<Selection> = fetch.fields.iter().cloned().map(Selection::Field).collect();
        let root_path = [Vec::new()];
        let (mut completed, nested_errors) = self
            .complete(&fetch.service, root_type, vec![data], &root_path, &root_fields)
            .await;
        errors.extend(nested_errors);

        (completed.pop().unwrap_or_default(), errors)
    }

    async fn send(&self, service: &str, request: SubgraphRequest) -> Result<Value, ExecutionError> {
        let data_source = self
            .snapshot
            .data_source(service)
            .ok_or_else(|| ExecutionError::MissingDataSource(service.to_string()))?;
        debug!(service, query = %request.query, "sending subgraph request");
        Ok(data_source.process(request).await?)
    }

    /// Completes every object `service` produced at one level: fields it did
    /// not return are fetched from their owners with one `_entities` request
    /// per owner and type, then composite children are completed the same way,
    /// grouped by the subgraph that produced them.
    fn complete<'s>(
        &'s self,
        service: &'s str,
        type_name: &'s str,
        mut objects: Vec<Map<String, Value>>,
        paths: &'s [Vec<Value>],
        selections: &'s [Selection],
    ) -> BoxFuture<'s, (Vec<Map<String, Value>>, Vec<Value>)> {
        async move {
            let mut errors = Vec::new();
            let concretes: Vec<String> = objects
                .iter()
                .map(|object| concrete_type(object, type_name).to_string())
                .collect();
            let fields: Vec<Vec<FieldSelection>> = concretes
                .iter()
                .map(|concrete| {
                    collect_fields(selections, &|condition: &str| {
                        self.supergraph.is_possible_type(condition, concrete)
                    })
                })
                .collect();

            let mut batches: Vec<EntityBatch> = Vec::new();
            for (index, object) in objects.iter().enumerate() {
                let concrete = &concretes[index];
                for field in &fields[index] {
                    if field.name == "__typename" || object.contains_key(field.response_key()) {
                        continue;
                    }
                    let owners = self.supergraph.owners(concrete, &field.name);
                    if owners.iter().any(|owner| owner == service) {
                        continue;
                    }
                    let Some(owner) = owners.first() else {
                        errors.push(graphql_error(
                            format!("Cannot query field \"{}\" on type \"{}\".", field.name, concrete),
                            service,
                        ));
                        continue;
                    };
                    let position = match batches
                        .iter()
                        .position(|batch| batch.service == *owner && batch.type_name == *concrete)
                    {
                        Some(position) => position,
                        None => {
                            batches.push(EntityBatch {
                                service: owner.clone(),
                                type_name: concrete.clone(),
                                selections: Vec::new(),
                                items: Vec::new(),
                            });
                            batches.len() - 1
                        }
                    };
                    batches[position].add(index, field);
                }
            }

            let fetched = join_all(
                batches
                    .iter()
                    .map(|batch| self.fetch_entities(batch, &objects, paths)),
            )
            .await;

            let mut producers: Vec<HashMap<String, String>> = vec![HashMap::new(); objects.len()];
            for (batch, (entities, batch_errors)) in batches.iter().zip(fetched) {
                errors.extend(batch_errors);
                for (index, entity) in entities {
                    let object = &mut objects[index];
                    for (key, value) in entity {
                        if !object.contains_key(&key) {
                            producers[index].insert(key.clone(), batch.service.clone());
                            object.insert(key, value);
                        }
                    }
                }
            }

            let mut children: Vec<ChildBatch> = Vec::new();
            let mut slots: Vec<(usize, String, usize, Slot)> = Vec::new();
            for (index, object) in objects.iter_mut().enumerate() {
                let concrete = concretes[index].as_str();
                for field in &fields[index] {
                    if field.selections.is_empty() {
                        continue;
                    }
                    let key = field.response_key();
                    let Some(value) = object.remove(key) else {
                        continue;
                    };
                    let producer = producers[index].get(key).map(String::as_str).unwrap_or(service);
                    let child_type = self
                        .supergraph
                        .field_type(concrete, &field.name)
                        .or_else(|| self.supergraph.field_type(type_name, &field.name))
                        .unwrap_or(type_name);

                    let position = match children.iter().position(|child| {
                        child.producer == producer
                            && child.type_name == child_type
                            && child.selections == field.selections
                    }) {
                        Some(position) => position,
                        None => {
                            children.push(ChildBatch {
                                producer: producer.to_string(),
                                type_name: child_type.to_string(),
                                selections: field.selections.clone(),
                                objects: Vec::new(),
                                paths: Vec::new(),
                            });
                            children.len() - 1
                        }
                    };

                    let mut path = paths.get(index).cloned().unwrap_or_default();
                    path.push(json!(key));
                    let slot = flatten(value, path, &mut children[position]);
                    slots.push((index, key.to_string(), position, slot));
                }
            }

            let inputs: Vec<Vec<Map<String, Value>>> = children
                .iter_mut()
                .map(|child| std::mem::take(&mut child.objects))
                .collect();
            let completed = join_all(children.iter().zip(inputs).map(|(child, objects)| {
                self.complete(
                    &child.producer,
                    &child.type_name,
                    objects,
                    &child.paths,
                    &child.selections,
                )
            }))
            .await;

            let mut completed: Vec<Vec<Option<Map<String, Value>>>> = completed
                .into_iter()
                .map(|(objects, child_errors)| {
                    errors.extend(child_errors);
                    objects.into_iter().map(Some).collect()
                })
                .collect();
            for (index, key, position, slot) in slots {
                let value = rebuild(slot, &mut completed[position]);
                objects[index].insert(key, value);
            }

            (objects, errors)
        }
        .boxed()
    }

    /// Sends one `_entities` request for every object in `batch`. Returns the
    /// fetched fields keyed by object index.
    async fn fetch_entities(
        &self,
        batch: &EntityBatch,
        objects: &[Map<String, Value>],
        paths: &[Vec<Value>],
    ) -> (Vec<(usize, Map<String, Value>)>, Vec<Value>) {
        let service = batch.service.as_str();
        let type_name = batch.type_name.as_str();
        let keys = self.supergraph.keys(type_name);
        if keys.is_empty() {
            let error = graphql_error(
                format!("Type \"{}\" has no key to fetch it from {}", type_name, service),
                service,
            );
            return (Vec::new(), vec![error]);
        }

        let mut errors = Vec::new();
        let mut items = Vec::with_capacity(batch.items.len());
        let mut representations = Vec::with_capacity(batch.items.len());
        for &index in &batch.items {
            match representation(type_name, keys, &objects[index]) {
                Ok(representation) => {
                    items.push(index);
                    representations.push(representation);
                }
                Err(key) => errors.push(graphql_error(
                    format!("Missing key field \"{}\" on type \"{}\"", key, type_name),
                    service,
                )),
            }
        }
        if items.is_empty() {
            return (Vec::new(), errors);
        }

        let mut entities = FieldSelection::new(ENTITIES_FIELD);
        entities.arguments = vec![(
            REPRESENTATIONS.to_string(),
            GraphQLValue::Variable(REPRESENTATIONS.to_string()),
        )];
        entities.selections = vec![Selection::Fragment {
            type_condition: Some(type_name.to_string()),
            selections: project(self.supergraph, service, type_name, &batch.selections),
        }];

        let request = SubgraphRequest {
            query: print_operation(
                OperationKind::Query,
                vec![representations_variable()],
                &[Selection::Field(entities)],
            ),
            variables: Some(json!({ REPRESENTATIONS: representations })),
        };

        let response = match self.send(service, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(service, error = %e, "entity fetch failed");
                errors.push(graphql_error(format!("Execution error: {}", e), service));
                return (Vec::new(), errors);
            }
        };

        let entities = response
            .pointer(&format!("/data/{}", ENTITIES_FIELD))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let fetched = items
            .iter()
            .zip(entities)
            .filter_map(|(&index, entity)| match entity {
                Value::Object(entity) => Some((index, entity)),
                _ => None,
            })
            .collect();
        errors.extend(
            tag_errors(&response, service)
                .into_iter()
                .map(|error| rebase_path(error, &items, paths)),
        );

        (fetched, errors)
    }

    /// Builds the client's view of `value`: requested response keys only, in
    /// selection order, with `__typename` answered for every object.
    fn shape(&self, value: &Value, type_name: &str, selections: &[Selection]) -> Value {
        match value {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.shape(item, type_name, selections))
                    .collect(),
            ),
            Value::Object(object) => {
                let concrete = object
                    .get("__typename")
                    .and_then(Value::as_str)
                    .unwrap_or(type_name);
                let mut shaped = Map::new();
                for field in collect_fields(selections, &|condition: &str| {
                    self.supergraph.is_possible_type(condition, concrete)
                }) {
                    let key = field.response_key();
                    let value = if field.name == "__typename" {
                        json!(concrete)
                    } else {
                        match object.get(key) {
                            Some(value) if !field.selections.is_empty() => {
                                let child_type = self
                                    .supergraph
                                    .field_type(concrete, &field.name)
                                    .or_else(|| self.supergraph.field_type(type_name, &field.name))
                                    .unwrap_or(type_name);
                                self.shape(value, child_type, &field.selections)
                            }
                            Some(value) => value.clone(),
                            None => Value::Null,
                        }
                    };
                    shaped.insert(key.to_string(), value);
                }
                Value::Object(shaped)
            }
            other => other.clone(),
        }
    }
}

fn representations_variable() -> VariableDefinition<'static, String> {
    let any = Type::NonNullType(Box::new(Type::NamedType("_Any".to_string())));
    VariableDefinition {
        position: Pos::default(),
        name: REPRESENTATIONS.to_string(),
        var_type: Type::NonNullType(Box::new(Type::ListType(Box::new(any)))),
        default_value: None,
    }
}

fn concrete_type<'v>(object: &'v Map<String, Value>, fallback: &'v str) -> &'v str {
    object
        .get("__typename")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
}

/// `{ __typename, <keys> }`, or the first key the object is missing.
fn representation(
    type_name: &str,
    keys: &[String],
    object: &Map<String, Value>,
) -> Result<Value, String> {
    let mut representation = Map::new();
    representation.insert("__typename".to_string(), json!(type_name));
    for key in keys {
        match object.get(key) {
            Some(value) if !value.is_null() => {
                representation.insert(key.clone(), value.clone());
            }
            _ => return Err(key.clone()),
        }
    }
    Ok(Value::Object(representation))
}

fn flatten(value: Value, path: Vec<Value>, batch: &mut ChildBatch) -> Slot {
    match value {
        Value::Object(object) => {
            batch.objects.push(object);
            batch.paths.push(path);
            Slot::Object(batch.objects.len() - 1)
        }
        Value::Array(items) => Slot::List(
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    let mut item_path = path.clone();
                    item_path.push(json!(index));
                    flatten(item, item_path, batch)
                })
                .collect(),
        ),
        other => Slot::Leaf(other),
    }
}

fn rebuild(slot: Slot, objects: &mut [Option<Map<String, Value>>]) -> Value {
    match slot {
        Slot::Object(index) => objects
            .get_mut(index)
            .and_then(Option::take)
            .map(Value::Object)
            .unwrap_or(Value::Null),
        Slot::List(items) => Value::Array(
            items
                .into_iter()
                .map(|item| rebuild(item, objects))
                .collect(),
        ),
        Slot::Leaf(value) => value,
    }
}

/// Moves an `_entities` error path onto the client path of the object it was
/// fetched for. Paths that cannot be mapped are dropped.
fn rebase_path(mut error: Value, items: &[usize], paths: &[Vec<Value>]) -> Value {
    if let Some(error_obj) = error.as_object_mut() {
        if let Some(Value::Array(path)) = error_obj.remove("path") {
            let base = match path.as_slice() {
                [Value::String(field), index, ..] if field == ENTITIES_FIELD => index
                    .as_u64()
                    .and_then(|index| items.get(index as usize))
                    .and_then(|&item| paths.get(item)),
                _ => None,
            };
            if let Some(base) = base {
                let mut rebased = base.clone();
                rebased.extend(path.iter().skip(2).cloned());
                error_obj.insert("path".to_string(), Value::Array(rebased));
            }
        }
    }
    error
}

fn graphql_error(message: impl Display, service: &str) -> Value {
    json!({
        "message": message.to_string(),
        "extensions": { "service": service },
    })
}

/// Copies a subgraph's errors, recording which service raised them.
fn tag_errors(response: &Value, service: &str) -> Vec<Value> {
    let Some(errors) = response.get("errors").and_then(Value::as_array) else {
        return Vec::new();
    };

    errors
        .iter()
        .cloned()
        .map(|mut error| {
            if let Value::Object(error_obj) = &mut error {
                let extensions = error_obj
                    .entry("extensions")
                    .or_insert_with(|| json!({}));
                if let Value::Object(extensions) = extensions {
                    extensions.insert("service".to_string(), json!(service));
                }
            }
            error
        })
        .collect()
}
