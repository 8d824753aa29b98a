use async_trait::async_trait;
use graphql_parser::schema::ParseError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::{ServiceConfig, SubgraphDescriptor};

#[derive(Debug, Error)]
#[error("Failed to parse schema for service {service}: {source}")]
pub struct RegistryError {
    pub service: String,
    #[source]
    pub source: ParseError,
}

/// Source of the subgraph descriptors fed to each composition pass.
#[async_trait]
pub trait SchemaRegistry {
    async fn register_service(&mut self, service: ServiceConfig) -> Result<(), RegistryError>;
    /// Replaces the whole service list. Nothing changes if any schema fails
    /// to parse.
    async fn replace_services(&mut self, services: Vec<ServiceConfig>)
    -> Result<(), RegistryError>;
    async fn subgraphs(&self) -> Vec<SubgraphDescriptor>;
}

/// Keeps services in registration order. Re-registering a name replaces the
/// old descriptor in place.
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    services: Arc<RwLock<Vec<SubgraphDescriptor>>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        InMemorySchemaRegistry {
            services: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

fn parse(service: ServiceConfig) -> Result<SubgraphDescriptor, RegistryError> {
    let name = service.name.clone();
    SubgraphDescriptor::try_from(service).map_err(|source| RegistryError {
        service: name,
        source,
    })
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_service(&mut self, service: ServiceConfig) -> Result<(), RegistryError> {
        let name = service.name.clone();
        let descriptor = parse(service)?;

        let mut services = self.services.write().await;
        match services.iter_mut().find(|existing| existing.name == name) {
            Some(existing) => *existing = descriptor,
            None => services.push(descriptor),
        }
        info!(service = %name, "registered service");

        Ok(())
    }

    async fn replace_services(
        &mut self,
        services: Vec<ServiceConfig>,
    ) -> Result<(), RegistryError> {
        let mut descriptors: Vec<SubgraphDescriptor> = Vec::with_capacity(services.len());
        for service in services {
            let descriptor = parse(service)?;
            match descriptors.iter_mut().find(|existing| existing.name == descriptor.name) {
                Some(existing) => *existing = descriptor,
                None => descriptors.push(descriptor),
            }
        }

        let count = descriptors.len();
        *self.services.write().await = descriptors;
        info!(services = count, "replaced registered services");

        Ok(())
    }

    async fn subgraphs(&self) -> Vec<SubgraphDescriptor> {
        self.services.read().await.clone()
    }
}
