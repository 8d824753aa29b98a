use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    SubgraphDescriptor, Supergraph,
    composition::{Composer, CompositionError},
    introspection::introspect,
    node_scanner::scan,
    node_schema::NodeSchema,
};

/// Name of the virtual subgraph hosting `Query.node`.
pub const NODE_SERVICE_NAME: &str = "NODE_SERVICE";

/// The synthesized schema of the last successful composition pass, if it had
/// any node types.
pub type NodeSchemaCache = Arc<ArcSwapOption<NodeSchema>>;

/// Wraps a composer so that every composition also gets a virtual subgraph
/// resolving `node(id:)` for all types implementing `Node`.
pub struct NodeCompose<C> {
    inner: C,
    node_schema: NodeSchemaCache,
}

impl<C: Composer> NodeCompose<C> {
    pub fn new(inner: C) -> Self {
        NodeCompose {
            inner,
            node_schema: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Shared handle to the synthesized schema, for binding local data sources.
    pub fn cache(&self) -> NodeSchemaCache {
        Arc::clone(&self.node_schema)
    }

    pub fn node_schema(&self) -> Option<Arc<NodeSchema>> {
        self.node_schema.load_full()
    }
}

impl<C: Composer> Composer for NodeCompose<C> {
    fn compose(&self, subgraphs: Vec<SubgraphDescriptor>) -> Result<Supergraph, CompositionError> {
        if let Some(subgraph) = subgraphs.iter().find(|s| s.name == NODE_SERVICE_NAME) {
            return Err(CompositionError::ReservedName(subgraph.name.clone()));
        }

        let scanned = scan(subgraphs.clone());
        let Some(schema) = NodeSchema::synthesize(&scanned.node_types) else {
            debug!("no node types found, composing subgraphs unchanged");
            let supergraph = self.inner.compose(subgraphs)?;
            self.node_schema.store(None);
            return Ok(supergraph);
        };

        let descriptor = introspect(NODE_SERVICE_NAME, &schema)?;
        let mut extended = scanned.subgraphs;
        extended.push(descriptor);

        let supergraph = self.inner.compose(extended)?;
        info!(
            node_types = scanned.node_types.len(),
            "composed supergraph with node subgraph"
        );
        // Only a successful pass replaces the cache, so it always matches the
        // last supergraph handed out.
        self.node_schema.store(Some(Arc::new(schema)));

        Ok(supergraph)
    }
}
