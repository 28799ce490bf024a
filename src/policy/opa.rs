use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;

use super::{PolicyDecision, PolicyError, PolicyEvaluationInput, PolicyEvaluator};

/// Queries an OPA server's data API for `{namespace}/{name}`.
pub struct OpaEvaluator {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct OpaResponse {
    result: Option<OpaResult>,
}

#[derive(Deserialize)]
struct OpaResult {
    #[serde(default)]
    allow: bool,
}

impl OpaEvaluator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        OpaEvaluator {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn opa_input(args: Option<Map<String, Value>>, query: Option<Value>) -> Value {
    let mut input = json!({ "args": args.unwrap_or_default() });
    if let Some(query) = query {
        input["query"] = query;
    }
    json!({ "input": input })
}

#[async_trait]
impl PolicyEvaluator for OpaEvaluator {
    async fn evaluate(&self, input: PolicyEvaluationInput) -> Result<PolicyDecision, PolicyError> {
        let metadata = input.definition.metadata;
        let url = format!(
            "{}/v1/data/{}/{}",
            self.base_url, metadata.namespace, metadata.name
        );
        let fail = |message: String| PolicyError::execution_failed(metadata.clone(), message);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&opa_input(input.args, input.query))
            .send()
            .await
            .map_err(|e| fail(format!("Failed to reach OPA at {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(fail(format!("OPA returned status {}", response.status())));
        }

        let body = response
            .json::<OpaResponse>()
            .await
            .map_err(|e| fail(format!("Failed to parse OPA response: {e}")))?;

        Ok(PolicyDecision {
            allow: body.result.is_some_and(|result| result.allow),
        })
    }
}
