use async_trait::async_trait;
use portkey_node::{
    DataSource, DataSourceRouter, FederatedQueryExecutor, FederatedQueryPlanner,
    FederationGateway, GatewayError, GraphQLRequest, InMemorySchemaRegistry, NODE_SERVICE_NAME,
    NodeCompose, NodeDataSourceRouter, ServiceConfig, SubgraphDescriptor, SupergraphComposer,
    config::SupergraphConfig,
    data_source::{DataSourceError, RouterError, SubgraphRequest},
    global_id::encode,
    selection::{Selection, parse_operation},
    value::{to_json, variables_map},
};
use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A subgraph backed by fixed JSON objects. Root fields ignore their arguments;
/// `_entities` looks objects up by `__typename` and `id`.
struct FakeSubgraph {
    roots: Map<String, Value>,
    entities: HashMap<(String, String), Value>,
    queries: Mutex<Vec<String>>,
}

impl FakeSubgraph {
    fn new(roots: Value, entities: Vec<Value>) -> Arc<Self> {
        let entities = entities
            .into_iter()
            .map(|entity| {
                let typename = entity["__typename"].as_str().unwrap().to_string();
                let id = entity["id"].as_str().unwrap().to_string();
                ((typename, id), entity)
            })
            .collect();

        Arc::new(FakeSubgraph {
            roots: roots.as_object().cloned().unwrap_or_default(),
            entities,
            queries: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

fn select(value: &Value, selections: &[Selection]) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|i| select(i, selections)).collect()),
        Value::Object(object) => {
            let mut selected = Map::new();
            select_into(object, selections, &mut selected);
            Value::Object(selected)
        }
        other => other.clone(),
    }
}

fn select_into(object: &Map<String, Value>, selections: &[Selection], out: &mut Map<String, Value>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let value = object.get(&field.name).cloned().unwrap_or(Value::Null);
                let value = if field.selections.is_empty() {
                    value
                } else {
                    select(&value, &field.selections)
                };
                out.insert(field.response_key().to_string(), value);
            }
            Selection::Fragment {
                type_condition,
                selections,
            } => {
                let typename = object.get("__typename").and_then(Value::as_str);
                if type_condition.is_none() || type_condition.as_deref() == typename {
                    select_into(object, selections, out);
                }
            }
        }
    }
}

#[async_trait]
impl DataSource for FakeSubgraph {
    async fn process(&self, request: SubgraphRequest) -> Result<Value, DataSourceError> {
        self.queries.lock().unwrap().push(request.query.clone());

        let variables = variables_map(request.variables.as_ref());
        let operation = parse_operation(&request.query, None, &variables).unwrap();

        let mut data = Map::new();
        for selection in &operation.selections {
            let Selection::Field(field) = selection else {
                continue;
            };
            let value = if field.name == "_entities" {
                let representations = to_json(&field.arguments[0].1, &Map::new());
                let entities = representations
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|representation| {
                        let key = (
                            representation["__typename"].as_str().unwrap().to_string(),
                            representation["id"].as_str().unwrap().to_string(),
                        );
                        self.entities
                            .get(&key)
                            .map(|entity| select(entity, &field.selections))
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                Value::Array(entities)
            } else {
                let root = self.roots.get(&field.name).cloned().unwrap_or(Value::Null);
                select(&root, &field.selections)
            };
            data.insert(field.response_key().to_string(), value);
        }

        Ok(json!({ "data": data }))
    }
}

struct FakeRouter {
    subgraphs: HashMap<String, Arc<FakeSubgraph>>,
}

impl DataSourceRouter for FakeRouter {
    fn create_data_source(
        &self,
        subgraph: &SubgraphDescriptor,
    ) -> Result<Arc<dyn DataSource>, RouterError> {
        self.subgraphs
            .get(&subgraph.name)
            .map(|fake| Arc::clone(fake) as Arc<dyn DataSource>)
            .ok_or_else(|| RouterError::MissingServiceUrl(subgraph.name.clone()))
    }
}

// Test fixture wiring the bundled schemas to in-process subgraphs
struct TestFixture {
    gateway: FederationGateway,
    product: Arc<FakeSubgraph>,
    review: Arc<FakeSubgraph>,
}

fn product_id() -> String {
    encode("Product", "1")
}

fn review_id() -> String {
    encode("Review", "1")
}

impl TestFixture {
    fn subgraphs() -> (Arc<FakeSubgraph>, Arc<FakeSubgraph>) {
        let lamp = json!({ "__typename": "Product", "id": product_id(), "name": "Lamp" });
        let desk = json!({ "__typename": "Product", "id": encode("Product", "2"), "name": "Desk" });
        let review = json!({
            "__typename": "Review", "id": review_id(), "body": "Bright enough", "rating": 5
        });

        let product = FakeSubgraph::new(
            json!({ "product": lamp, "products": [lamp, desk] }),
            vec![lamp.clone(), desk.clone()],
        );
        let review_subgraph = FakeSubgraph::new(
            json!({ "review": review }),
            vec![
                review.clone(),
                json!({
                    "__typename": "Product",
                    "id": product_id(),
                    "reviews": { "edges": [{ "cursor": "c1", "node": review }] }
                }),
                json!({
                    "__typename": "Product",
                    "id": encode("Product", "2"),
                    "reviews": { "edges": [] }
                }),
            ],
        );
        (product, review_subgraph)
    }

    fn router(product: &Arc<FakeSubgraph>, review: &Arc<FakeSubgraph>) -> FakeRouter {
        FakeRouter {
            subgraphs: HashMap::from([
                ("product".to_string(), Arc::clone(product)),
                ("review".to_string(), Arc::clone(review)),
            ]),
        }
    }

    async fn register_bundled(gateway: &FederationGateway) {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("schemas/supergraph.yaml");
        let config = SupergraphConfig::from_file(&path).unwrap();
        gateway.load_config(&config, &path).await.unwrap();
    }

    async fn setup() -> Self {
        let (product, review) = Self::subgraphs();
        let composer = NodeCompose::new(SupergraphComposer::new());
        let router = NodeDataSourceRouter::new(composer.cache(), Self::router(&product, &review));

        let gateway = FederationGateway::new(
            Box::new(InMemorySchemaRegistry::new()),
            Arc::new(composer),
            Arc::new(router),
            Box::new(FederatedQueryPlanner::new()),
            Box::new(FederatedQueryExecutor::new()),
        );
        Self::register_bundled(&gateway).await;
        gateway.reload().await.unwrap();

        TestFixture {
            gateway,
            product,
            review,
        }
    }

    async fn execute_query(&self, query: &str, variables: Option<Value>) -> Value {
        let request = GraphQLRequest {
            query: query.to_string(),
            variables,
            operation_name: None,
        };
        self.gateway.process_request(request).await.unwrap()
    }
}

#[tokio::test]
async fn resolves_node_through_owning_subgraph() {
    let fixture = TestFixture::setup().await;

    let result = fixture
        .execute_query(
            "query($id: ID!) { node(id: $id) { __typename id ... on Product { name } } }",
            Some(json!({ "id": product_id() })),
        )
        .await;

    assert_eq!(
        result,
        json!({ "data": { "node": { "__typename": "Product", "id": product_id(), "name": "Lamp" } } })
    );
    assert_eq!(fixture.product.calls(), 1);
    assert_eq!(fixture.review.calls(), 0);
    assert!(fixture.product.queries.lock().unwrap()[0].contains("_entities"));
}

#[tokio::test]
async fn strips_fields_added_for_routing() {
    let fixture = TestFixture::setup().await;

    let result = fixture
        .execute_query(
            r#"
            query Lookup($id: ID!) {
              node(id: $id) {
                ... on Product {
                  title: name
                  reviews { edges { node { body } } }
                }
              }
            }
            "#,
            Some(json!({ "id": product_id() })),
        )
        .await;

    assert_eq!(
        result,
        json!({
            "data": {
                "node": {
                    "title": "Lamp",
                    "reviews": { "edges": [{ "node": { "body": "Bright enough" } }] }
                }
            }
        })
    );
    assert_eq!(fixture.product.calls(), 1);
    assert_eq!(fixture.review.calls(), 1);
}

#[tokio::test]
async fn node_lookup_works_for_every_node_type() {
    let fixture = TestFixture::setup().await;

    let result = fixture
        .execute_query(
            &format!("{{ node(id: \"{}\") {{ ... on Review {{ rating }} }} }}", review_id()),
            None,
        )
        .await;

    assert_eq!(result, json!({ "data": { "node": { "rating": 5 } } }));
    assert_eq!(fixture.product.calls(), 0);
}

#[tokio::test]
async fn rejects_malformed_and_unknown_ids() {
    let fixture = TestFixture::setup().await;

    for id in ["not base64!".to_string(), encode("Unknown", "1"), "UHJvZHVjdA==".to_string()] {
        let result = fixture
            .execute_query(
                "query($id: ID!) { node(id: $id) { id } }",
                Some(json!({ "id": id })),
            )
            .await;

        assert_eq!(result["data"], json!({ "node": null }), "id {}", id);
        let error = &result["errors"][0];
        assert_eq!(error["extensions"]["code"], "BAD_USER_INPUT", "id {}", id);
        assert_eq!(error["extensions"]["service"], NODE_SERVICE_NAME);
    }
    assert_eq!(fixture.product.calls(), 0);
    assert_eq!(fixture.review.calls(), 0);
}

#[tokio::test]
async fn root_fields_keep_their_owners() {
    let fixture = TestFixture::setup().await;

    let result = fixture
        .execute_query("{ product(id: \"1\") { name } }", None)
        .await;

    assert_eq!(result, json!({ "data": { "product": { "name": "Lamp" } } }));
    assert_eq!(fixture.product.calls(), 1);
}

#[tokio::test]
async fn detached_router_fails_reload() {
    let (product, review) = TestFixture::subgraphs();
    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Arc::new(NodeCompose::new(SupergraphComposer::new())),
        Arc::new(NodeDataSourceRouter::detached(TestFixture::router(
            &product, &review,
        ))),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(FederatedQueryExecutor::new()),
    );
    TestFixture::register_bundled(&gateway).await;

    assert!(matches!(
        gateway.reload().await,
        Err(GatewayError::Router(RouterError::Consistency(_)))
    ));
    assert!(gateway.snapshot().is_none());
}

#[tokio::test]
async fn schemas_without_node_types_compose_unchanged() {
    let (product, review) = TestFixture::subgraphs();
    let composer = NodeCompose::new(SupergraphComposer::new());
    let router = NodeDataSourceRouter::new(composer.cache(), TestFixture::router(&product, &review));
    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Arc::new(composer),
        Arc::new(router),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(FederatedQueryExecutor::new()),
    );
    gateway
        .register_service(ServiceConfig {
            name: "product".to_string(),
            url: "http://product/graphql".to_string(),
            schema: "type Query { product(id: ID!): Product } type Product { id: ID! name: String! }"
                .to_string(),
        })
        .await
        .unwrap();

    let snapshot = gateway.reload().await.unwrap();
    let names: Vec<_> = snapshot
        .supergraph
        .subgraphs
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, vec!["product"]);
    assert!(snapshot.data_source(NODE_SERVICE_NAME).is_none());
}

#[tokio::test]
async fn reload_replaces_node_types() {
    let fixture = TestFixture::setup().await;
    fixture
        .gateway
        .register_service(ServiceConfig {
            name: "review".to_string(),
            url: "http://review/graphql".to_string(),
            schema: "type Query { review(id: ID!): Review } type Review { id: ID! body: String! }"
                .to_string(),
        })
        .await
        .unwrap();
    let snapshot = fixture.gateway.reload().await.unwrap();
    assert_eq!(snapshot.version, 2);

    let result = fixture
        .execute_query(
            "query($id: ID!) { node(id: $id) { id } }",
            Some(json!({ "id": review_id() })),
        )
        .await;
    assert_eq!(result["errors"][0]["extensions"]["code"], "BAD_USER_INPUT");
}

#[tokio::test]
async fn list_references_share_one_entity_fetch() {
    let fixture = TestFixture::setup().await;

    let result = fixture
        .execute_query("{ products { reviews { edges { cursor } } name } }", None)
        .await;

    assert_eq!(
        result,
        json!({
            "data": {
                "products": [
                    { "reviews": { "edges": [{ "cursor": "c1" }] }, "name": "Lamp" },
                    { "reviews": { "edges": [] }, "name": "Desk" }
                ]
            }
        })
    );
    let first = result["data"]["products"][0].as_object().unwrap();
    assert_eq!(first.keys().collect::<Vec<_>>(), vec!["reviews", "name"]);
    assert_eq!(fixture.product.calls(), 1);
    assert_eq!(fixture.review.calls(), 1);
}
