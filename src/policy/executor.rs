use futures::FutureExt;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::{PolicyCacheKey, PolicyError, PolicyEvaluationInput, PolicyEvaluators, PolicyQueryRunner, PolicyScope};
use crate::param_injection::{ResolutionContext, inject};
use crate::resources::{Policy, PolicyDefinition, PolicyQuery, ResourceMetadata};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Relation {
    #[serde(rename = "AND")]
    And,
    #[default]
    #[serde(rename = "OR")]
    Or,
}

/// Validates policy references against the definitions of one resource snapshot.
pub struct PolicyExecutor {
    definitions: Arc<Vec<PolicyDefinition>>,
    evaluators: PolicyEvaluators,
}

impl PolicyExecutor {
    pub fn new(definitions: Vec<PolicyDefinition>, evaluators: PolicyEvaluators) -> Self {
        PolicyExecutor {
            definitions: Arc::new(definitions),
            evaluators,
        }
    }

    pub fn definition(&self, namespace: &str, name: &str) -> Option<&PolicyDefinition> {
        self.definitions
            .iter()
            .find(|p| p.metadata.namespace == namespace && p.metadata.name == name)
    }

    pub async fn validate_policy<'s>(
        &self,
        policy: &Policy,
        ctx: &ResolutionContext<'_>,
        scope: impl Into<PolicyScope<'s>>,
    ) -> Result<(), PolicyError> {
        let scope = scope.into();
        let metadata = policy.metadata();
        let definition = self
            .definition(&policy.namespace, &policy.name)
            .ok_or_else(|| PolicyError::execution_failed(metadata.clone(), "The policy was not found"))?;

        let args = prepare_policy_args(policy, definition, ctx)?;
        let evaluator = self.evaluators.get(definition.policy_type).ok_or_else(|| {
            PolicyError::execution_failed(
                metadata.clone(),
                format!("No evaluator registered for policy type {}", definition.policy_type),
            )
        })?;

        let key = PolicyCacheKey {
            policy: metadata.clone(),
            args: args.clone().map(Value::Object),
        };
        let query = definition
            .query
            .as_ref()
            .map(|query| (query.gql.clone(), prepare_query_variables(query, args.as_ref())));
        let runner = scope.queries.cloned();
        let definition = definition.clone();
        let allow = scope
            .cache
            .get_or_evaluate(key, move || {
                async move {
                    let query = match query {
                        Some((gql, variables)) => {
                            Some(run_policy_query(runner, &definition.metadata, &gql, variables).await?)
                        }
                        None => None,
                    };
                    let input = PolicyEvaluationInput {
                        definition,
                        args,
                        query,
                    };
                    evaluator.evaluate(input).await.map(|decision| decision.allow)
                }
                .boxed()
            })
            .await?;

        tracing::trace!(policy = %metadata, allow, "Policy evaluated");
        if allow {
            Ok(())
        } else {
            Err(PolicyError::Unauthorized {
                policies: vec![metadata],
            })
        }
    }

    /// Runs every check to completion and combines the outcomes under `relation`.
    pub async fn validate_policies<'s>(
        &self,
        policies: &[Policy],
        relation: Relation,
        ctx: &ResolutionContext<'_>,
        scope: impl Into<PolicyScope<'s>>,
    ) -> Result<(), PolicyError> {
        let scope = scope.into();
        let results = join_all(
            policies
                .iter()
                .map(|policy| self.validate_policy(policy, ctx, scope)),
        )
        .await;

        let approved = match relation {
            Relation::And => results.iter().all(Result::is_ok),
            Relation::Or => results.iter().any(Result::is_ok),
        };
        if approved {
            return Ok(());
        }

        let mut denied = Vec::new();
        let mut failed = Vec::new();
        for error in results.into_iter().filter_map(Result::err) {
            match error {
                PolicyError::Unauthorized { policies } => denied.extend(policies),
                other => failed.push(other),
            }
        }

        match failed.first() {
            Some(PolicyError::ExecutionFailed { policy, .. }) => Err(PolicyError::execution_failed(
                policy.clone(),
                failed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
            _ => Err(PolicyError::Unauthorized { policies: denied }),
        }
    }
}

/// Fills the declared arguments of `definition` from `policy.args` or defaults,
/// injecting string values.
pub(crate) fn prepare_policy_args(
    policy: &Policy,
    definition: &PolicyDefinition,
    ctx: &ResolutionContext<'_>,
) -> Result<Option<Map<String, Value>>, PolicyError> {
    let Some(declared) = &definition.args else {
        return Ok(None);
    };

    let metadata: ResourceMetadata = definition.metadata.clone();
    let mut prepared = Map::new();
    for (name, arg) in declared {
        let provided = policy.args.as_ref().and_then(|args| args.get(name));
        let value = match provided.or(arg.default.as_ref()) {
            Some(Value::String(template)) => inject(template, ctx),
            Some(value) => value.clone(),
            None if arg.optional => Value::Null,
            None => {
                return Err(PolicyError::execution_failed(
                    metadata,
                    format!("Missing argument \"{name}\""),
                ));
            }
        };

        if value.is_null() && arg.is_non_null() {
            return Err(PolicyError::execution_failed(
                metadata,
                format!("Non-nullable argument \"{name}\" got value \"null\""),
            ));
        }
        prepared.insert(name.clone(), value);
    }
    Ok(Some(prepared))
}

/// String variables of a policy query may reference the prepared arguments.
fn prepare_query_variables(query: &PolicyQuery, args: Option<&Map<String, Value>>) -> Map<String, Value> {
    let args = Value::Object(args.cloned().unwrap_or_default());
    let ctx = ResolutionContext {
        args: &args,
        ..ResolutionContext::empty()
    };
    query
        .variables
        .iter()
        .flatten()
        .map(|(name, value)| {
            let value = match value {
                Value::String(template) => inject(template, &ctx),
                other => other.clone(),
            };
            (name.clone(), value)
        })
        .collect()
}

async fn run_policy_query(
    runner: Option<Arc<dyn PolicyQueryRunner>>,
    metadata: &ResourceMetadata,
    gql: &str,
    variables: Map<String, Value>,
) -> Result<Value, PolicyError> {
    let runner = runner.ok_or_else(|| {
        PolicyError::execution_failed(metadata.clone(), "Policy queries cannot run outside a gateway request")
    })?;
    tracing::trace!(policy = %metadata, "Executing policy query");
    runner.run(gql, variables).await.map_err(|message| {
        tracing::error!(policy = %metadata, %message, "Policy query execution failed");
        PolicyError::execution_failed(metadata.clone(), format!("Policy query execution failed: {message}"))
    })
}
