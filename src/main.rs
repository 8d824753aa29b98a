use anyhow::Context;
use clap::Parser;
use portkey_node::{
    FederationGateway, GraphQLRequest, InMemorySchemaRegistry, config::SupergraphConfig,
};
use serde_json::json;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE, LOCATION,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portkey-node", about = "GraphQL federation gateway with global object lookup")]
struct Args {
    /// Path to supergraph.yaml
    #[arg(long, default_value = "./schemas/supergraph.yaml")]
    config: PathBuf,

    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Seconds between schema reloads; overrides the config file. 0 disables polling.
    #[arg(long)]
    poll_interval: Option<u64>,
}

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Portkey Federation Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    function graphQLFetcher(graphQLParams) {
      return fetch('/graphql', {
        method: 'post',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    debug!(method = %req.method(), path = req.uri().path(), "incoming request");

    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "failed to read request body");
                    return Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(full("Failed to read request body"))
                        .unwrap_or_else(|_| internal_server_error()));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(graphql_req) => {
                    let body = match gateway.process_request(graphql_req).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "request failed");
                            json!({ "errors": [{ "message": e.to_string() }] })
                        }
                    };
                    let json = serde_json::to_string(&body).unwrap_or_default();

                    Response::builder()
                        .header(CONTENT_TYPE, "application/json")
                        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                        .body(full(json))
                        .unwrap_or_else(|_| internal_server_error())
                }
                Err(e) => Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                    .body(full(format!("Invalid JSON request: {}", e)))
                    .unwrap_or_else(|_| internal_server_error()),
            }
        }

        (&Method::GET, "/graphiql") => Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full(GRAPHIQL_HTML))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, "/graphiql")
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::OPTIONS, _) => Response::builder()
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

/// Re-reads the config and schema files, then recomposes. Errors are logged and
/// the gateway keeps serving its current supergraph.
fn spawn_poller(gateway: Arc<FederationGateway>, config_path: PathBuf, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; startup already loaded.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = refresh(&gateway, &config_path).await {
                error!(error = %e, "schema reload failed");
            }
        }
    });
}

async fn refresh(gateway: &FederationGateway, config_path: &Path) -> anyhow::Result<()> {
    let config = SupergraphConfig::from_file(config_path)?;
    gateway.load_config(&config, config_path).await?;
    gateway.reload().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SupergraphConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let schema_registry = Box::new(InMemorySchemaRegistry::new());
    let gateway = Arc::new(if config.node_lookup {
        FederationGateway::with_node_lookup(schema_registry)
    } else {
        FederationGateway::without_node_lookup(schema_registry)
    });

    let services = gateway
        .load_config(&config, &args.config)
        .await
        .context("failed to register subgraphs")?;
    let snapshot = gateway
        .reload()
        .await
        .context("failed to compose supergraph")?;
    info!(
        services,
        subgraphs = snapshot.supergraph.subgraphs.len(),
        node_lookup = config.node_lookup,
        "supergraph ready"
    );

    let poll_interval = match args.poll_interval {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.poll_interval(),
    };
    if let Some(period) = poll_interval {
        info!(seconds = period.as_secs(), "polling schema files");
        spawn_poller(Arc::clone(&gateway), args.config.clone(), period);
    }

    let listener = TcpListener::bind(args.listen).await?;
    info!("GraphQL Federation Gateway starting on http://{}", args.listen);
    info!("GraphiQL UI available at http://{}/graphiql", args.listen);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway_clone = Arc::clone(&gateway);

        let executor = TokioExecutor;

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            match hyper_util::server::conn::auto::Builder::new(executor)
                .serve_connection(io, service)
                .await
            {
                Ok(_) => debug!("connection closed"),
                Err(e) => error!(error = %e, "error processing connection"),
            }
        });
    }
}
