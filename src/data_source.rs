use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::{
    SubgraphDescriptor,
    node_compose::{NODE_SERVICE_NAME, NodeSchemaCache},
    node_schema::NodeSchema,
};

#[derive(Debug, Clone)]
pub struct SubgraphRequest {
    pub query: String,
    pub variables: Option<Value>,
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("Failed to send request to {service}: {source}")]
    Request {
        service: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to parse response from {service}: {source}")]
    Response {
        service: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Something a subgraph operation can be sent to.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn process(&self, request: SubgraphRequest) -> Result<Value, DataSourceError>;
}

pub struct HttpDataSource {
    client: reqwest::Client,
    service: String,
    url: String,
}

impl HttpDataSource {
    pub fn new(client: reqwest::Client, service: impl Into<String>, url: impl Into<String>) -> Self {
        HttpDataSource {
            client,
            service: service.into(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn process(&self, request: SubgraphRequest) -> Result<Value, DataSourceError> {
        let request_body = json!({
            "query": request.query,
            "variables": request.variables.unwrap_or_else(|| json!({})),
        });

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|source| DataSourceError::Request {
                service: self.service.clone(),
                source,
            })?;

        response
            .json::<Value>()
            .await
            .map_err(|source| DataSourceError::Response {
                service: self.service.clone(),
                source,
            })
    }
}

/// Executes against the synthesized node schema without leaving the process.
pub struct LocalDataSource {
    schema: Arc<NodeSchema>,
}

impl LocalDataSource {
    pub fn new(schema: Arc<NodeSchema>) -> Self {
        LocalDataSource { schema }
    }
}

#[async_trait]
impl DataSource for LocalDataSource {
    async fn process(&self, request: SubgraphRequest) -> Result<Value, DataSourceError> {
        Ok(self
            .schema
            .execute(&request.query, request.variables.as_ref()))
    }
}

#[derive(Debug, Error)]
#[error(
    "Subgraph {0} has no synthesized schema; the supergraph was not composed through NodeCompose"
)]
pub struct RouterConsistencyError(pub String);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Consistency(#[from] RouterConsistencyError),
    #[error("Subgraph {0} has no service URL")]
    MissingServiceUrl(String),
}

/// Decides where operations for a subgraph are sent.
pub trait DataSourceRouter: Send + Sync {
    fn create_data_source(
        &self,
        subgraph: &SubgraphDescriptor,
    ) -> Result<Arc<dyn DataSource>, RouterError>;
}

#[derive(Default)]
pub struct HttpDataSourceRouter {
    client: reqwest::Client,
}

impl HttpDataSourceRouter {
    pub fn new() -> Self {
        HttpDataSourceRouter {
            client: reqwest::Client::new(),
        }
    }
}

impl DataSourceRouter for HttpDataSourceRouter {
    fn create_data_source(
        &self,
        subgraph: &SubgraphDescriptor,
    ) -> Result<Arc<dyn DataSource>, RouterError> {
        let url = subgraph
            .service_url
            .as_ref()
            .ok_or_else(|| RouterError::MissingServiceUrl(subgraph.name.clone()))?;

        Ok(Arc::new(HttpDataSource::new(
            self.client.clone(),
            subgraph.name.clone(),
            url.clone(),
        )))
    }
}

/// Sends the virtual node subgraph to its in-process schema and everything else
/// to `inner`.
pub struct NodeDataSourceRouter<R> {
    node_schema: Option<NodeSchemaCache>,
    inner: R,
}

impl<R: DataSourceRouter> NodeDataSourceRouter<R> {
    pub fn new(node_schema: NodeSchemaCache, inner: R) -> Self {
        NodeDataSourceRouter {
            node_schema: Some(node_schema),
            inner,
        }
    }

    /// A router not wired to any composition; asking it for the node subgraph
    /// is a consistency error.
    pub fn detached(inner: R) -> Self {
        NodeDataSourceRouter {
            node_schema: None,
            inner,
        }
    }
}

impl<R: DataSourceRouter> DataSourceRouter for NodeDataSourceRouter<R> {
    fn create_data_source(
        &self,
        subgraph: &SubgraphDescriptor,
    ) -> Result<Arc<dyn DataSource>, RouterError> {
        if subgraph.name != NODE_SERVICE_NAME {
            return self.inner.create_data_source(subgraph);
        }

        let schema = self
            .node_schema
            .as_ref()
            .and_then(|cache| cache.load_full())
            .ok_or_else(|| RouterConsistencyError(subgraph.name.clone()))?;

        debug!(subgraph = %subgraph.name, "binding local data source");
        Ok(Arc::new(LocalDataSource::new(schema)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composition::{Composer, SupergraphComposer},
        global_id::encode,
        node_compose::NodeCompose,
    };
    use arc_swap::ArcSwapOption;
    use pretty_assertions::assert_eq;

    fn node_descriptor() -> SubgraphDescriptor {
        SubgraphDescriptor::parse(NODE_SERVICE_NAME, "type Query { node(id: ID!): Node }", None)
            .unwrap()
    }

    #[test]
    fn detached_router_rejects_node_subgraph() {
        let router = NodeDataSourceRouter::detached(HttpDataSourceRouter::new());
        assert!(matches!(
            router.create_data_source(&node_descriptor()),
            Err(RouterError::Consistency(_))
        ));
    }

    #[test]
    fn empty_cache_is_a_consistency_error() {
        let router = NodeDataSourceRouter::new(
            Arc::new(ArcSwapOption::empty()),
            HttpDataSourceRouter::new(),
        );
        assert!(matches!(
            router.create_data_source(&node_descriptor()),
            Err(RouterError::Consistency(_))
        ));
    }

    #[test]
    fn remote_subgraphs_need_a_url() {
        let router = HttpDataSourceRouter::new();
        let subgraph = SubgraphDescriptor::parse("a", "type Query { a: Int }", None).unwrap();
        assert!(matches!(
            router.create_data_source(&subgraph),
            Err(RouterError::MissingServiceUrl(name)) if name == "a"
        ));
    }

    #[tokio::test]
    async fn routes_node_subgraph_in_process() {
        let compose = NodeCompose::new(SupergraphComposer);
        let supergraph = compose
            .compose(vec![
                SubgraphDescriptor::parse(
                    "product",
                    "type Query { a: Int } type Product implements Node { id: ID! }",
                    Some("http://product/graphql".to_string()),
                )
                .unwrap(),
            ])
            .unwrap();
        let router = NodeDataSourceRouter::new(compose.cache(), HttpDataSourceRouter::new());

        let node = supergraph.subgraph(NODE_SERVICE_NAME).unwrap();
        let data_source = router.create_data_source(node).unwrap();
        let id = encode("Product", "7");
        let response = data_source
            .process(SubgraphRequest {
                query: "query($id: ID!) { node(id: $id) { id } }".to_string(),
                variables: Some(json!({ "id": id })),
            })
            .await
            .unwrap();

        assert_eq!(response, json!({ "data": { "node": { "id": id } } }));

        let product = supergraph.subgraph("product").unwrap();
        assert!(router.create_data_source(product).is_ok());
    }
}
