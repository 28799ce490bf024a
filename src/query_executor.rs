use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::query_planner::{QueryPlan, RemoteSchema};
use crate::request_context::RequestScope;
use crate::upstreams::{UpstreamError, Upstreams};

const INTROSPECTION_ATTEMPTS: u32 = 3;

/// One operation sent to a remote GraphQL service.
pub struct RemoteRequest<'a> {
    pub url: &'a str,
    pub plan: QueryPlan,
    pub timeout: Duration,
    pub scope: Option<&'a RequestScope>,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Returns the `data` object of a successful response.
    async fn execute(
        &self,
        request: RemoteRequest<'_>,
        upstreams: &Upstreams,
    ) -> Result<Value, UpstreamError>;
}

pub struct HttpQueryExecutor {
    client: reqwest::Client,
}

impl HttpQueryExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        HttpQueryExecutor { client }
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(
        &self,
        request: RemoteRequest<'_>,
        upstreams: &Upstreams,
    ) -> Result<Value, UpstreamError> {
        let mut url = Url::parse(request.url).map_err(|e| UpstreamError::InvalidUrl {
            url: request.url.to_string(),
            message: e.to_string(),
        })?;
        let mut headers = HeaderMap::new();
        upstreams.apply(&mut url, &mut headers, request.scope).await?;

        let request_body = json!({
            "query": request.plan.query,
            "variables": request.plan.variables,
        });

        let response = self
            .client
            .post(url.clone())
            .headers(headers)
            .timeout(request.timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| UpstreamError::request(url.as_str(), &e, request.timeout))?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let json_response = response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::request(url.as_str(), &e, request.timeout))?;

        let data = json_response.get("data").cloned().unwrap_or(Value::Null);
        if let Some(errors) = json_response.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() && data.is_null() {
                let message = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(UpstreamError::Remote {
                    url: url.to_string(),
                    message,
                });
            }
            tracing::warn!(%url, errors = errors.len(), "Remote service returned partial errors");
        }
        Ok(data)
    }
}

/// Introspection results per remote url, fetched at most once per schema snapshot.
#[derive(Default)]
pub struct RemoteSchemaCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<RemoteSchema>>>>>,
}

impl RemoteSchemaCache {
    pub async fn get(
        &self,
        url: &str,
        executor: &dyn QueryExecutor,
        upstreams: &Upstreams,
        timeout: Duration,
    ) -> Result<Arc<RemoteSchema>, UpstreamError> {
        let cell = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| introspect(url, executor, upstreams, timeout))
            .await
            .cloned()
    }
}

async fn introspect(
    url: &str,
    executor: &dyn QueryExecutor,
    upstreams: &Upstreams,
    timeout: Duration,
) -> Result<Arc<RemoteSchema>, UpstreamError> {
    let mut attempt = 1;
    loop {
        let request = RemoteRequest {
            url,
            plan: QueryPlan {
                query: RemoteSchema::INTROSPECTION_QUERY.to_string(),
                variables: Map::new(),
            },
            timeout,
            scope: None,
        };
        let result = executor.execute(request, upstreams).await.and_then(|data| {
            RemoteSchema::from_introspection(&data).map_err(|message| UpstreamError::Remote {
                url: url.to_string(),
                message,
            })
        });

        match result {
            Ok(schema) => {
                tracing::debug!(%url, "Remote schema introspected");
                return Ok(Arc::new(schema));
            }
            Err(err) if attempt < INTROSPECTION_ATTEMPTS => {
                tracing::warn!(%url, attempt, %err, "Remote schema introspection failed, retrying");
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
