use async_graphql::ErrorExtensions;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{FieldInvocation, Resolver};
use crate::policy::{PolicyError, PolicyExecutor, Relation};
use crate::resources::Policy;

/// Arguments of `@policies`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoliciesArgs {
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub relation: Relation,
    #[serde(default)]
    pub post_resolve: bool,
}

/// An authorization check around a resolver.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    policies: Vec<Policy>,
    relation: Option<Relation>,
    post_resolve: bool,
    object_level: bool,
}

impl PolicyGate {
    pub fn single(policy: Policy) -> Self {
        PolicyGate {
            policies: vec![policy],
            relation: None,
            post_resolve: false,
            object_level: false,
        }
    }

    pub fn composite(args: PoliciesArgs) -> Self {
        PolicyGate {
            policies: args.policies,
            relation: Some(args.relation),
            post_resolve: args.post_resolve,
            object_level: false,
        }
    }

    /// A gate declared on an object type. Post-resolve checks see the whole
    /// object as `{result.*}`, so every field of one object shares a decision.
    pub fn on_object(mut self) -> Self {
        self.object_level = true;
        self
    }

    /// Pre-resolve gates never call `inner` when denied. Post-resolve gates see the
    /// field's result as `{result.*}` and discard it when denied.
    pub fn wrap(self, inner: Resolver, executor: Arc<PolicyExecutor>) -> Resolver {
        let gate = Arc::new(self);
        Arc::new(move |invocation: FieldInvocation| {
            let gate = gate.clone();
            let inner = inner.clone();
            let executor = executor.clone();
            async move {
                if invocation.scope.ignores_policies() {
                    return inner(invocation).await;
                }
                if gate.post_resolve && gate.object_level {
                    let object = invocation.source().clone();
                    gate.check(&executor, &invocation, Some(&object))
                        .await
                        .map_err(|e| e.extend())?;
                    return inner(invocation).await;
                }
                if !gate.post_resolve {
                    gate.check(&executor, &invocation, None)
                        .await
                        .map_err(|e| e.extend())?;
                    return inner(invocation).await;
                }

                let result = inner(invocation.clone()).await?;
                gate.check(&executor, &invocation, Some(&result))
                    .await
                    .map_err(|e| e.extend())?;
                Ok(result)
            }
            .boxed()
        })
    }

    async fn check(
        &self,
        executor: &PolicyExecutor,
        invocation: &FieldInvocation,
        result: Option<&Value>,
    ) -> Result<(), PolicyError> {
        let ctx = invocation.context(result);
        let scope = invocation.scope.policy_scope();
        let outcome = match (self.relation, self.policies.as_slice()) {
            (None, [policy]) => executor.validate_policy(policy, &ctx, scope).await,
            (relation, policies) => {
                executor
                    .validate_policies(policies, relation.unwrap_or_default(), &ctx, scope)
                    .await
            }
        };
        outcome.inspect_err(|err| {
            tracing::debug!(
                %err,
                field = %format!("{}.{}", invocation.parent_type, invocation.field_name),
                "Field access denied"
            )
        })
    }
}
