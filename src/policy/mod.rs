mod cache;
mod executor;
mod opa;

pub use cache::{PolicyCacheKey, PolicyResultCache};
pub use executor::{PolicyExecutor, Relation};
pub use opa::OpaEvaluator;

use async_graphql::{ErrorExtensions, Value as GqlValue};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::resources::{PolicyDefinition, PolicyType, ResourceMetadata};

pub const UNAUTHORIZED_BY_POLICY: &str = "UNAUTHORIZED_BY_POLICY";
pub const POLICY_EXECUTION_FAILED: &str = "POLICY_EXECUTION_FAILED";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    /// The policy ran and denied access.
    #[error("Unauthorized by policy: {}", join_metadata(policies))]
    Unauthorized { policies: Vec<ResourceMetadata> },

    /// The policy could not produce a decision.
    #[error("Policy {policy} execution failed: {message}")]
    ExecutionFailed {
        policy: ResourceMetadata,
        message: String,
    },
}

fn join_metadata(policies: &[ResourceMetadata]) -> String {
    policies
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PolicyError {
    pub fn execution_failed(policy: ResourceMetadata, message: impl Into<String>) -> Self {
        PolicyError::ExecutionFailed {
            policy,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::Unauthorized { .. } => UNAUTHORIZED_BY_POLICY,
            PolicyError::ExecutionFailed { .. } => POLICY_EXECUTION_FAILED,
        }
    }
}

impl ErrorExtensions for PolicyError {
    fn extend(&self) -> async_graphql::Error {
        let policies = match self {
            PolicyError::Unauthorized { policies } => policies.clone(),
            PolicyError::ExecutionFailed { policy, .. } => vec![policy.clone()],
        };
        let policies = serde_json::to_value(policies)
            .ok()
            .and_then(|value| GqlValue::from_json(value).ok())
            .unwrap_or(GqlValue::Null);

        async_graphql::Error::new(self.to_string()).extend_with(|_, e| {
            e.set("code", self.code());
            e.set("policies", policies);
        })
    }
}

/// What an evaluator receives for one decision.
#[derive(Debug, Clone)]
pub struct PolicyEvaluationInput {
    pub definition: PolicyDefinition,
    pub args: Option<Map<String, Value>>,
    /// The `data` of the definition's policy query, when it has one.
    pub query: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allow: bool,
}

/// Runs the policy engine for one policy type.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, input: PolicyEvaluationInput) -> Result<PolicyDecision, PolicyError>;
}

/// Executes policy queries against the schema of the request being authorized.
#[async_trait]
pub trait PolicyQueryRunner: Send + Sync {
    /// Runs `query` with policies switched off and returns its `data`.
    async fn run(&self, query: &str, variables: Map<String, Value>) -> Result<Value, String>;
}

/// Per-request collaborators of the policy executor.
#[derive(Clone, Copy)]
pub struct PolicyScope<'a> {
    pub cache: &'a PolicyResultCache,
    pub queries: Option<&'a Arc<dyn PolicyQueryRunner>>,
}

impl<'a> From<&'a PolicyResultCache> for PolicyScope<'a> {
    fn from(cache: &'a PolicyResultCache) -> Self {
        PolicyScope { cache, queries: None }
    }
}

/// Evaluators by policy type, shared by every schema snapshot.
#[derive(Clone, Default)]
pub struct PolicyEvaluators {
    by_type: HashMap<PolicyType, Arc<dyn PolicyEvaluator>>,
}

impl PolicyEvaluators {
    pub fn with(mut self, policy_type: PolicyType, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.by_type.insert(policy_type, evaluator);
        self
    }

    pub fn get(&self, policy_type: PolicyType) -> Option<Arc<dyn PolicyEvaluator>> {
        self.by_type.get(&policy_type).cloned()
    }
}
