//! Conversions between JSON and GraphQL literal values.

use graphql_parser::query::{Number, Value};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

pub type GraphQLValue = Value<'static, String>;

pub fn from_json(json: &Json) -> GraphQLValue {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Value::Int(Number::from(i)),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(from_json).collect()),
        Json::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), from_json(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}

/// Converts a literal to JSON, reading `$variables` from `variables`.
/// Unknown variables become `null`.
pub fn to_json(value: &GraphQLValue, variables: &Map<String, Json>) -> Json {
    match value {
        Value::Variable(name) => variables.get(name).cloned().unwrap_or(Json::Null),
        Value::Int(n) => n.as_i64().map(Json::from).unwrap_or(Json::Null),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(s) => Json::String(s.clone()),
        Value::Boolean(b) => Json::Bool(*b),
        Value::Null => Json::Null,
        Value::Enum(e) => Json::String(e.clone()),
        Value::List(items) => Json::Array(items.iter().map(|v| to_json(v, variables)).collect()),
        Value::Object(fields) => Json::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v, variables)))
                .collect(),
        ),
    }
}

/// Replaces every variable reference with its literal value.
pub fn substitute(value: &GraphQLValue, variables: &Map<String, Json>) -> GraphQLValue {
    match value {
        Value::Variable(name) => variables.get(name).map(from_json).unwrap_or(Value::Null),
        Value::List(items) => Value::List(items.iter().map(|v| substitute(v, variables)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn variables_map(variables: Option<&Json>) -> Map<String, Json> {
    match variables {
        Some(Json::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
