use async_graphql::ErrorExtensions;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{FieldInvocation, Resolver, WiringEnv};
use crate::param_injection::{inject, stringify};
use crate::upstreams::{UpstreamError, Upstreams};

#[derive(Debug, Clone, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Arguments of `@rest`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestArgs {
    pub url: String,
    pub method: Option<String>,
    pub body: Option<String>,
    pub body_arg: Option<String>,
    pub query: Option<Vec<KeyValue>>,
    pub headers: Option<Vec<KeyValue>>,
    pub timeout_ms: Option<u64>,
    pub not_found_as_null: Option<bool>,
}

pub(super) fn resolver(args: RestArgs, env: &WiringEnv) -> Resolver {
    let args = Arc::new(args);
    let http = env.http.clone();
    let upstreams = env.upstreams.clone();
    let default_timeout = env.default_timeout;

    Arc::new(move |invocation: FieldInvocation| {
        let args = args.clone();
        let http = http.clone();
        let upstreams = upstreams.clone();
        async move {
            call(&args, &invocation, &http, &upstreams, default_timeout)
                .await
                .map_err(|err| {
                    tracing::warn!(%err, field = %invocation.field_name, "REST call failed");
                    err.extend()
                })
        }
        .boxed()
    })
}

async fn call(
    args: &RestArgs,
    invocation: &FieldInvocation,
    http: &reqwest::Client,
    upstreams: &Upstreams,
    default_timeout: Duration,
) -> Result<Value, UpstreamError> {
    let ctx = invocation.context(None);

    let raw_url = stringify(&inject(&args.url, &ctx));
    let mut url = Url::parse(&raw_url).map_err(|e| UpstreamError::InvalidUrl {
        url: raw_url.clone(),
        message: e.to_string(),
    })?;

    let mut pairs = Vec::new();
    for param in args.query.iter().flatten() {
        match inject(&param.value, &ctx) {
            Value::Null => {}
            Value::String(s) if s.is_empty() => {}
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (param.key.clone(), stringify(item))))
            }
            other => pairs.push((param.key.clone(), stringify(&other))),
        }
    }
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }

    let mut headers = HeaderMap::new();
    for header in args.headers.iter().flatten() {
        let value = stringify(&inject(&header.value, &ctx));
        match (
            HeaderName::from_bytes(header.key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!(header = %header.key, "Skipping invalid header"),
        }
    }
    upstreams
        .apply(&mut url, &mut headers, Some(invocation.scope.as_ref()))
        .await?;

    let method = args
        .method
        .as_deref()
        .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()))
        .transpose()
        .map_err(|e| UpstreamError::Request {
            url: url.to_string(),
            message: e.to_string(),
        })?
        .unwrap_or(Method::GET);

    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);

    let mut request = http
        .request(method.clone(), url.clone())
        .headers(headers)
        .timeout(timeout);
    if let Some(body) = request_body(args, invocation, &method) {
        request = request.json(&body);
    }

    tracing::debug!(%url, %method, "Calling REST upstream");
    let response = request
        .send()
        .await
        .map_err(|e| UpstreamError::request(url.as_str(), &e, timeout))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND && args.not_found_as_null.unwrap_or(false) {
        return Ok(Value::Null);
    }
    if !status.is_success() {
        return Err(UpstreamError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let text = response
        .text()
        .await
        .map_err(|e| UpstreamError::request(url.as_str(), &e, timeout))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// `body` wins; otherwise the `bodyArg` argument (default `input`) for non-GET calls.
fn request_body(args: &RestArgs, invocation: &FieldInvocation, method: &Method) -> Option<Value> {
    if let Some(template) = &args.body {
        return Some(inject(template, &invocation.context(None)));
    }
    if *method == Method::GET || *method == Method::HEAD {
        return None;
    }
    let arg = args.body_arg.as_deref().unwrap_or("input");
    invocation.args.get(arg).filter(|v| !v.is_null()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::tests::{env, invocation};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rest(url: String) -> RestArgs {
        RestArgs {
            url,
            method: None,
            body: None,
            body_arg: None,
            query: None,
            headers: None,
            timeout_ms: None,
            not_found_as_null: None,
        }
    }

    #[tokio::test]
    async fn injects_url_query_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/7"))
            .and(query_param("tag", "a"))
            .and(header("x-caller", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 7 })))
            .mount(&server)
            .await;

        let mut args = rest(format!("{}/users/{{args.id}}", server.uri()));
        args.query = Some(vec![
            KeyValue {
                key: "tag".into(),
                value: "{args.tags}".into(),
            },
            KeyValue {
                key: "skip".into(),
                value: "{args.missing}".into(),
            },
        ]);
        args.headers = Some(vec![KeyValue {
            key: "x-caller".into(),
            value: "{args.id}".into(),
        }]);

        let value = resolver(args, &env())(invocation(json!({ "id": 7, "tags": ["a"] })))
            .await
            .unwrap();
        assert_eq!(value, json!({ "id": 7 }));
    }

    #[tokio::test]
    async fn posts_the_input_argument() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .and(body_json(json!({ "name": "ann" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 1, "name": "ann" })))
            .mount(&server)
            .await;

        let mut args = rest(format!("{}/users", server.uri()));
        args.method = Some("post".into());

        let value = resolver(args, &env())(invocation(json!({ "input": { "name": "ann" } })))
            .await
            .unwrap();
        assert_eq!(value, json!({ "id": 1, "name": "ann" }));
    }

    #[tokio::test]
    async fn not_found_can_resolve_to_null() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut args = rest(format!("{}/missing", server.uri()));
        let strict = resolver(args.clone(), &env())(invocation(json!({}))).await;
        assert!(strict.is_err());

        args.not_found_as_null = Some(true);
        let lenient = resolver(args, &env())(invocation(json!({}))).await.unwrap();
        assert_eq!(lenient, Value::Null);
    }

    #[tokio::test]
    async fn slow_upstreams_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut args = rest(format!("{}/slow", server.uri()));
        args.timeout_ms = Some(50);

        let err = resolver(args, &env())(invocation(json!({}))).await.unwrap_err();
        let extensions = serde_json::to_value(&err.extensions).unwrap();
        assert_eq!(extensions["code"], json!("UPSTREAM_TIMEOUT"));
    }
}
