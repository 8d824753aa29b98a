use async_trait::async_trait;
use thiserror::Error;

use crate::{
    GraphQLRequest, Supergraph,
    selection::{
        FieldSelection, OperationError, OperationKind, Selection, collect_fields, ensure_field,
        parse_operation,
    },
    value::variables_map,
};

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("Subscriptions are not supported")]
    Subscription,
    #[error("Schema is not configured for mutations")]
    NoMutationType,
    #[error("No service found for operation type: {0}")]
    NoService(String),
}

/// One operation sent to one subgraph at the root of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetch {
    pub service: String,
    /// What the subgraph is asked for.
    pub selections: Vec<Selection>,
    /// The client fields this fetch answers, before projection.
    pub fields: Vec<FieldSelection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub kind: OperationKind,
    pub root_type: String,
    pub selections: Vec<Selection>,
    pub fetches: Vec<Fetch>,
}

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        supergraph: &Supergraph,
    ) -> Result<QueryPlan, PlanError>;
}

/// Splits root fields by owning subgraph and projects each field onto what that
/// subgraph can resolve. Anything left over is fetched through `_entities` at
/// execution time.
#[derive(Default)]
pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }

    fn root_type(kind: OperationKind, supergraph: &Supergraph) -> Result<String, PlanError> {
        match kind {
            OperationKind::Query => Ok(supergraph.query_type.clone()),
            OperationKind::Mutation => supergraph
                .mutation_type
                .clone()
                .ok_or(PlanError::NoMutationType),
            OperationKind::Subscription => Err(PlanError::Subscription),
        }
    }
}

#[async_trait]
impl QueryPlanner for FederatedQueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        supergraph: &Supergraph,
    ) -> Result<QueryPlan, PlanError> {
        let variables = variables_map(request.variables.as_ref());
        let operation = parse_operation(
            &request.query,
            request.operation_name.as_deref(),
            &variables,
        )?;
        let root_type = Self::root_type(operation.kind, supergraph)?;

        let mut groups: Vec<(String, Vec<FieldSelection>)> = Vec::new();
        for field in collect_fields(&operation.selections, &|condition: &str| {
            condition == root_type
        }) {
            if field.name == "__typename" {
                continue;
            }
            let service = supergraph
                .owner_of(&root_type, &field.name)
                .ok_or_else(|| PlanError::NoService(field.name.clone()))?;

            match groups.iter_mut().find(|(s, _)| s == service) {
                Some((_, fields)) => fields.push(field),
                None => groups.push((service.to_string(), vec![field])),
            }
        }

        let fetches = groups
            .into_iter()
            .map(|(service, fields)| {
                let root_fields: Vec<Selection> =
                    fields.iter().cloned().map(Selection::Field).collect();
                Fetch {
                    selections: project(supergraph, &service, &root_type, &root_fields),
                    service,
                    fields,
                }
            })
            .collect();

        Ok(QueryPlan {
            kind: operation.kind,
            root_type,
            selections: operation.selections,
            fetches,
        })
    }
}

/// Keeps the parts of `selections` that `service` resolves itself, plus the
/// typenames and key fields needed to fetch the rest elsewhere.
pub fn project(
    supergraph: &Supergraph,
    service: &str,
    parent_type: &str,
    selections: &[Selection],
) -> Vec<Selection> {
    let mut projected = Vec::new();
    let mut needs_keys = false;
    let mut foreign_conditions = Vec::new();

    for selection in selections {
        match selection {
            Selection::Field(field) if field.name == "__typename" => {
                projected.push(selection.clone());
            }
            Selection::Field(field) => {
                if !supergraph.can_resolve(service, parent_type, &field.name) {
                    needs_keys = true;
                    continue;
                }
                let children = match supergraph.field_type(parent_type, &field.name) {
                    Some(child_type) if supergraph.is_composite(child_type) => {
                        project_composite(supergraph, service, child_type, &field.selections)
                    }
                    _ => Vec::new(),
                };
                projected.push(Selection::Field(field.with_selections(children)));
            }
            Selection::Fragment {
                type_condition,
                selections,
            } => {
                let condition = type_condition.as_deref().unwrap_or(parent_type);
                if !supergraph.declares(service, condition) {
                    foreign_conditions.push(condition);
                    continue;
                }
                let inner = project(supergraph, service, condition, selections);
                if !inner.is_empty() {
                    projected.push(Selection::Fragment {
                        type_condition: type_condition.clone(),
                        selections: inner,
                    });
                }
            }
        }
    }

    if needs_keys {
        for key in supergraph.keys(parent_type) {
            ensure_field(&mut projected, key);
        }
    }
    // A fragment on a type this service does not know can still be fetched
    // later if the abstract parent exposes that type's keys.
    for condition in foreign_conditions {
        for key in supergraph.keys(condition) {
            if supergraph.can_resolve(service, parent_type, key) {
                ensure_field(&mut projected, key);
            }
        }
    }

    projected
}

fn project_composite(
    supergraph: &Supergraph,
    service: &str,
    type_name: &str,
    selections: &[Selection],
) -> Vec<Selection> {
    let mut projected = project(supergraph, service, type_name, selections);
    ensure_field(&mut projected, "__typename");
    projected
}
