//! A normalized view of GraphQL selections.
//!
//! Operations are flattened into [`Selection`] trees with variables substituted,
//! named fragments inlined and `@skip`/`@include` applied, so planning and
//! execution never look at fragment definitions or variables again. Subgraph
//! operations are printed back through the `graphql_parser` AST.

use graphql_parser::{
    Pos,
    query::{
        self, Definition, Directive, Document, FragmentDefinition, Mutation,
        OperationDefinition, Query, SelectionSet, TypeCondition, VariableDefinition,
    },
};
use serde_json::{Map, Value as Json};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::value::{GraphQLValue, substitute};

#[derive(Debug, Error, PartialEq)]
pub enum OperationError {
    #[error("Failed to parse query: {0}")]
    Parse(String),
    #[error("Unknown operation named \"{0}\"")]
    UnknownOperation(String),
    #[error("Must provide operation name if query contains multiple operations")]
    AmbiguousOperation,
    #[error("Must provide an operation")]
    NoOperation,
    #[error("Unknown fragment \"{0}\"")]
    UnknownFragment(String),
    #[error("Fragment \"{0}\" spreads itself")]
    FragmentCycle(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub selections: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSelection {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, GraphQLValue)>,
    pub selections: Vec<Selection>,
}

impl FieldSelection {
    pub fn new(name: impl Into<String>) -> Self {
        FieldSelection {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            selections: Vec::new(),
        }
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn with_selections(&self, selections: Vec<Selection>) -> Self {
        FieldSelection {
            alias: self.alias.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            selections,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(FieldSelection),
    Fragment {
        type_condition: Option<String>,
        selections: Vec<Selection>,
    },
}

pub fn parse_operation(
    query: &str,
    operation_name: Option<&str>,
    variables: &Map<String, Json>,
) -> Result<Operation, OperationError> {
    let document = query::parse_query::<String>(query)
        .map_err(|e| OperationError::Parse(e.to_string()))?
        .into_static();

    let mut fragments = HashMap::new();
    let mut operations = Vec::new();
    for definition in &document.definitions {
        match definition {
            Definition::Fragment(fragment) => {
                fragments.insert(fragment.name.as_str(), fragment);
            }
            Definition::Operation(operation) => operations.push(operation),
        }
    }

    let operation = match operation_name {
        Some(name) => operations
            .into_iter()
            .find(|operation| operation_name_of(operation) == Some(name))
            .ok_or_else(|| OperationError::UnknownOperation(name.to_string()))?,
        None => match operations.as_slice() {
            [operation] => *operation,
            [] => return Err(OperationError::NoOperation),
            _ => return Err(OperationError::AmbiguousOperation),
        },
    };

    let (kind, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, set),
        OperationDefinition::Query(q) => (OperationKind::Query, &q.selection_set),
        OperationDefinition::Mutation(m) => (OperationKind::Mutation, &m.selection_set),
        OperationDefinition::Subscription(s) => (OperationKind::Subscription, &s.selection_set),
    };

    let normalizer = Normalizer {
        fragments,
        variables,
    };
    let selections = normalizer.selection_set(selection_set, &mut HashSet::new())?;

    Ok(Operation { kind, selections })
}

fn operation_name_of<'a>(operation: &'a OperationDefinition<'static, String>) -> Option<&'a str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

struct Normalizer<'a> {
    fragments: HashMap<&'a str, &'a FragmentDefinition<'static, String>>,
    variables: &'a Map<String, Json>,
}

impl<'a> Normalizer<'a> {
    fn selection_set(
        &self,
        set: &'a SelectionSet<'static, String>,
        visiting: &mut HashSet<&'a str>,
    ) -> Result<Vec<Selection>, OperationError> {
        let mut selections = Vec::with_capacity(set.items.len());

        for item in &set.items {
            match item {
                query::Selection::Field(field) => {
                    if !self.included(&field.directives) {
                        continue;
                    }
                    selections.push(Selection::Field(FieldSelection {
                        alias: field.alias.clone(),
                        name: field.name.clone(),
                        arguments: field
                            .arguments
                            .iter()
                            .map(|(name, value)| (name.clone(), substitute(value, self.variables)))
                            .collect(),
                        selections: self.selection_set(&field.selection_set, visiting)?,
                    }));
                }
                query::Selection::InlineFragment(fragment) => {
                    if !self.included(&fragment.directives) {
                        continue;
                    }
                    selections.push(Selection::Fragment {
                        type_condition: fragment
                            .type_condition
                            .as_ref()
                            .map(|TypeCondition::On(name)| name.clone()),
                        selections: self.selection_set(&fragment.selection_set, visiting)?,
                    });
                }
                query::Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives) {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let fragment: &'a FragmentDefinition<'static, String> = self
                        .fragments
                        .get(name)
                        .copied()
                        .ok_or_else(|| OperationError::UnknownFragment(name.to_string()))?;
                    if !visiting.insert(name) {
                        return Err(OperationError::FragmentCycle(name.to_string()));
                    }
                    let TypeCondition::On(type_condition) = &fragment.type_condition;
                    let inner = self.selection_set(&fragment.selection_set, visiting)?;
                    visiting.remove(name);
                    selections.push(Selection::Fragment {
                        type_condition: Some(type_condition.clone()),
                        selections: inner,
                    });
                }
            }
        }

        Ok(selections)
    }

    fn included(&self, directives: &[Directive<'static, String>]) -> bool {
        directives.iter().all(|directive| {
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| substitute(value, self.variables));
            match (directive.name.as_str(), condition) {
                ("skip", Some(GraphQLValue::Boolean(true))) => false,
                ("include", Some(GraphQLValue::Boolean(false))) => false,
                _ => true,
            }
        })
    }
}

/// Flattens fragments that apply to an object, merging fields that share a
/// response key. `applies` decides whether a fragment's type condition matches.
pub fn collect_fields(
    selections: &[Selection],
    applies: &dyn Fn(&str) -> bool,
) -> Vec<FieldSelection> {
    let mut fields: Vec<FieldSelection> = Vec::new();
    collect_into(selections, applies, &mut fields);
    fields
}

fn collect_into(
    selections: &[Selection],
    applies: &dyn Fn(&str) -> bool,
    fields: &mut Vec<FieldSelection>,
) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                match fields
                    .iter_mut()
                    .find(|f| f.response_key() == field.response_key())
                {
                    Some(existing) => existing.selections.extend(field.selections.iter().cloned()),
                    None => fields.push(field.clone()),
                }
            }
            Selection::Fragment {
                type_condition,
                selections,
            } => {
                if type_condition.as_deref().is_none_or(applies) {
                    collect_into(selections, applies, fields);
                }
            }
        }
    }
}

/// Adds an unaliased field unless one with the same response key is present.
pub fn ensure_field(selections: &mut Vec<Selection>, name: &str) {
    let present = selections.iter().any(|selection| {
        matches!(selection, Selection::Field(field) if field.response_key() == name)
    });
    if !present {
        selections.push(Selection::Field(FieldSelection::new(name)));
    }
}

pub fn to_selection_set(selections: &[Selection]) -> SelectionSet<'static, String> {
    SelectionSet {
        span: (Pos::default(), Pos::default()),
        items: selections.iter().map(to_ast_selection).collect(),
    }
}

fn to_ast_selection(selection: &Selection) -> query::Selection<'static, String> {
    match selection {
        Selection::Field(field) => query::Selection::Field(query::Field {
            position: Pos::default(),
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: field.arguments.clone(),
            directives: Vec::new(),
            selection_set: to_selection_set(&field.selections),
        }),
        Selection::Fragment {
            type_condition,
            selections,
        } => query::Selection::InlineFragment(query::InlineFragment {
            position: Pos::default(),
            type_condition: type_condition.clone().map(TypeCondition::On),
            directives: Vec::new(),
            selection_set: to_selection_set(selections),
        }),
    }
}

/// Prints a single anonymous operation.
pub fn print_operation(
    kind: OperationKind,
    variable_definitions: Vec<VariableDefinition<'static, String>>,
    selections: &[Selection],
) -> String {
    let selection_set = to_selection_set(selections);
    let operation = match kind {
        OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
            position: Pos::default(),
            name: None,
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
        _ => OperationDefinition::Query(Query {
            position: Pos::default(),
            name: None,
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
    };

    Document {
        definitions: vec![Definition::Operation(operation)],
    }
    .to_string()
}
