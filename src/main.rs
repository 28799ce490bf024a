use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use stitch_gateway::policy::{OpaEvaluator, PolicyEvaluators};
use stitch_gateway::resources::PolicyType;
use stitch_gateway::{
    Config, FileSystemResourceRepository, GatewayError, GatewayRuntime, GatewayServices, GraphQLRequest,
    RefreshHandle, ResourceUpdateStream, RuntimeState,
};

type HttpResponse = Response<BoxBody<Bytes, hyper::Error>>;

#[derive(Clone)]
struct AppState {
    runtime: Arc<GatewayRuntime>,
    refresh: RefreshHandle,
}

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(serde_json::to_string(body).unwrap_or_default()))
        .unwrap_or_else(|_| internal_server_error())
}

fn error_response(status: StatusCode, message: impl ToString) -> HttpResponse {
    json_response(status, &json!({ "errors": [{ "message": message.to_string() }] }))
}

async fn handle_request(req: Request<Incoming>, state: AppState) -> Result<HttpResponse, Infallible> {
    let headers = extract_headers(&req);

    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return Ok(error_response(StatusCode::BAD_REQUEST, "Failed to read request body")),
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(mut graphql_req) => {
                    graphql_req.headers = headers;

                    match state.runtime.process_request(graphql_req).await {
                        Ok(result) => json_response(StatusCode::OK, &result),
                        Err(err @ (GatewayError::NotReady | GatewayError::Disposed)) => {
                            error_response(StatusCode::SERVICE_UNAVAILABLE, err)
                        }
                        Err(err) => {
                            tracing::error!(%err, "Failed to process request");
                            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
                        }
                    }
                }
                Err(e) => error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON request: {e}")),
            }
        }

        (&Method::GET, "/health") => {
            let state = state.runtime.state();
            let status = match state {
                RuntimeState::Ready => StatusCode::OK,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            json_response(status, &json!({ "status": format!("{state:?}") }))
        }

        (&Method::GET, "/schema") => match state.runtime.current() {
            Some(gateway) => Response::builder()
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                .body(full(gateway.sdl().to_string()))
                .unwrap_or_else(|_| internal_server_error()),
            None => error_response(StatusCode::SERVICE_UNAVAILABLE, GatewayError::NotReady),
        },

        (&Method::POST, "/refresh") => {
            state.refresh.refresh();
            json_response(StatusCode::ACCEPTED, &json!({ "success": true }))
        }

        (&Method::OPTIONS, _) => Response::builder()
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
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

// Create a standard internal server error response
fn internal_server_error() -> HttpResponse {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full("Internal Server Error"))
        .unwrap()
}

// Headers that are not valid UTF-8 are dropped
fn extract_headers(req: &Request<Incoming>) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn services(config: &Config) -> GatewayServices {
    let services = GatewayServices::default().with_default_timeout(config.default_timeout());
    match &config.opa_url {
        Some(opa_url) => {
            let opa = OpaEvaluator::new(services.http.clone(), opa_url).with_timeout(config.default_timeout());
            let evaluators = PolicyEvaluators::default().with(PolicyType::Opa, Arc::new(opa));
            services.with_evaluators(evaluators)
        }
        None => services,
    }
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::parse();
    init_tracing(&config);

    let repository = Arc::new(FileSystemResourceRepository::new(&config.resources_path));
    let updates = ResourceUpdateStream::poll(repository, config.resource_update_interval());
    let (updates, refresh) = updates.split();

    let runtime = GatewayRuntime::new(services(&config));
    runtime.spawn(updates);
    let state = AppState {
        runtime: runtime.clone(),
        refresh,
    };

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, resources = %config.resources_path.display(), "Stitching gateway listening");

    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let io = TokioIo::new(stream);

        let state = state.clone();
        let executor = TokioExecutor;

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));

            if let Err(err) = hyper_util::server::conn::auto::Builder::new(executor)
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(%err, "Error processing connection");
            }
        });
    }

    tracing::info!("Shutting down");
    runtime.dispose().await;
    Ok(())
}
