use serde_json::Value;
use thiserror::Error;

use crate::{SubgraphDescriptor, node_schema::NodeSchema};

/// The self-description query every federated subgraph answers.
pub const SERVICE_SDL_QUERY: &str = "query { _service { sdl } }";

#[derive(Debug, Error)]
pub enum IntrospectionError {
    #[error("Service {service} returned errors for its SDL query: {errors}")]
    Execution { service: String, errors: Value },
    #[error("Service {0} returned no SDL")]
    MissingSdl(String),
    #[error("Failed to parse SDL of service {service}: {message}")]
    Parse { service: String, message: String },
}

/// Turns the synthesized schema into a descriptor by asking it for its own SDL,
/// exactly as a remote service would be introspected.
pub fn introspect(name: &str, schema: &NodeSchema) -> Result<SubgraphDescriptor, IntrospectionError> {
    let response = schema.execute(SERVICE_SDL_QUERY, None);

    if let Some(errors) = response.get("errors") {
        return Err(IntrospectionError::Execution {
            service: name.to_string(),
            errors: errors.clone(),
        });
    }

    let sdl = response["data"]["_service"]["sdl"]
        .as_str()
        .ok_or_else(|| IntrospectionError::MissingSdl(name.to_string()))?;

    SubgraphDescriptor::parse(name, sdl, None).map_err(|e| IntrospectionError::Parse {
        service: name.to_string(),
        message: e.to_string(),
    })
}
