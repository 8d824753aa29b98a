use arc_swap::ArcSwapOption;
use serde_json::Value;
use std::{collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::{
    GraphQLRequest, ServiceConfig, Supergraph,
    composition::{Composer, CompositionError, SupergraphComposer},
    config::{ConfigError, SupergraphConfig},
    data_source::{
        DataSource, DataSourceRouter, HttpDataSourceRouter, NodeDataSourceRouter, RouterError,
    },
    node_compose::NodeCompose,
    query_executor::{ExecutionError, FederatedQueryExecutor, QueryExecutor},
    query_planner::{FederatedQueryPlanner, PlanError, QueryPlanner},
    schema_registry::{RegistryError, SchemaRegistry},
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No supergraph has been published yet")]
    NotReady,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// A composed supergraph together with the data source bound to each of its
/// subgraphs. Never mutated once published.
pub struct Snapshot {
    pub version: u64,
    pub supergraph: Arc<Supergraph>,
    pub data_sources: HashMap<String, Arc<dyn DataSource>>,
}

impl Snapshot {
    pub fn data_source(&self, service: &str) -> Option<&Arc<dyn DataSource>> {
        self.data_sources.get(service)
    }
}

pub struct FederationGateway {
    schema_registry: Arc<RwLock<Box<dyn SchemaRegistry + Send + Sync>>>,
    composer: Arc<dyn Composer>,
    router: Arc<dyn DataSourceRouter>,
    query_planner: Arc<Box<dyn QueryPlanner + Send + Sync>>,
    query_executor: Arc<Box<dyn QueryExecutor + Send + Sync>>,
    snapshot: ArcSwapOption<Snapshot>,
    // Serializes reloads and holds the last published version.
    reload_lock: Mutex<u64>,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Box<dyn SchemaRegistry + Send + Sync>,
        composer: Arc<dyn Composer>,
        router: Arc<dyn DataSourceRouter>,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        query_executor: Box<dyn QueryExecutor + Send + Sync>,
    ) -> Self {
        FederationGateway {
            schema_registry: Arc::new(RwLock::new(schema_registry)),
            composer,
            router,
            query_planner: Arc::new(query_planner),
            query_executor: Arc::new(query_executor),
            snapshot: ArcSwapOption::empty(),
            reload_lock: Mutex::new(0),
        }
    }

    /// Remote subgraphs over HTTP, plus an in-process subgraph answering
    /// `node(id:)` for every type implementing `Node`.
    pub fn with_node_lookup(schema_registry: Box<dyn SchemaRegistry + Send + Sync>) -> Self {
        let composer = NodeCompose::new(SupergraphComposer::new());
        let router = NodeDataSourceRouter::new(composer.cache(), HttpDataSourceRouter::new());

        FederationGateway::new(
            schema_registry,
            Arc::new(composer),
            Arc::new(router),
            Box::new(FederatedQueryPlanner::new()),
            Box::new(FederatedQueryExecutor::new()),
        )
    }

    /// Remote subgraphs over HTTP only.
    pub fn without_node_lookup(schema_registry: Box<dyn SchemaRegistry + Send + Sync>) -> Self {
        FederationGateway::new(
            schema_registry,
            Arc::new(SupergraphComposer::new()),
            Arc::new(HttpDataSourceRouter::new()),
            Box::new(FederatedQueryPlanner::new()),
            Box::new(FederatedQueryExecutor::new()),
        )
    }

    pub async fn register_service(&self, service: ServiceConfig) -> Result<(), GatewayError> {
        let mut schema_registry = self.schema_registry.write().await;
        Ok(schema_registry.register_service(service).await?)
    }

    /// Makes the registry mirror `config`: listed subgraphs are re-read and
    /// anything no longer listed is dropped. Schema paths are relative to
    /// `config_path`.
    pub async fn load_config(
        &self,
        config: &SupergraphConfig,
        config_path: &Path,
    ) -> Result<usize, GatewayError> {
        let services = config.services(config_path)?;
        let count = services.len();
        let mut schema_registry = self.schema_registry.write().await;
        schema_registry.replace_services(services).await?;
        Ok(count)
    }

    /// Composes the registered subgraphs, binds a data source to each and
    /// publishes the result. On failure the previous snapshot stays in place.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<Arc<Snapshot>, GatewayError> {
        let mut version = self.reload_lock.lock().await;

        let subgraphs = self.schema_registry.read().await.subgraphs().await;
        let supergraph = self.composer.compose(subgraphs).inspect_err(|e| {
            warn!(error = %e, "composition failed, keeping previous supergraph");
        })?;

        let mut data_sources = HashMap::with_capacity(supergraph.subgraphs.len());
        for subgraph in &supergraph.subgraphs {
            let data_source = self.router.create_data_source(subgraph).inspect_err(|e| {
                warn!(subgraph = %subgraph.name, error = %e, "failed to bind data source");
            })?;
            data_sources.insert(subgraph.name.clone(), data_source);
        }

        *version += 1;
        let snapshot = Arc::new(Snapshot {
            version: *version,
            supergraph: Arc::new(supergraph),
            data_sources,
        });
        self.snapshot.store(Some(Arc::clone(&snapshot)));
        info!(
            version = snapshot.version,
            subgraphs = snapshot.supergraph.subgraphs.len(),
            "published supergraph"
        );

        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.load_full()
    }

    #[instrument(skip(self, request), fields(operation = ?request.operation_name))]
    pub async fn process_request(&self, request: GraphQLRequest) -> Result<Value, GatewayError> {
        // Requests keep the snapshot they started with even if a reload
        // publishes a new one meanwhile.
        let snapshot = self.snapshot.load_full().ok_or(GatewayError::NotReady)?;

        let query_plan = self
            .query_planner
            .plan_query(&request, &snapshot.supergraph)
            .await?;

        let response = self
            .query_executor
            .execute_plan(query_plan, &snapshot)
            .await?;

        Ok(response)
    }
}
