use async_graphql::ErrorExtensions;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{FieldInvocation, Resolver, WiringEnv};
use crate::param_injection::deep_inject;
use crate::query_executor::{QueryExecutor, RemoteRequest, RemoteSchemaCache};
use crate::query_planner::{OperationType, plan_delegation};
use crate::upstreams::{UpstreamError, Upstreams};

/// Arguments of `@gql`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlArgs {
    pub url: String,
    pub field_name: String,
    #[serde(default)]
    pub operation_type: OperationType,
    pub arguments: Option<Map<String, Value>>,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone)]
struct Delegation {
    executor: Arc<dyn QueryExecutor>,
    upstreams: Arc<Upstreams>,
    remote_schemas: Arc<RemoteSchemaCache>,
    default_timeout: Duration,
}

pub(super) fn resolver(args: GqlArgs, env: &WiringEnv) -> Resolver {
    let args = Arc::new(args);
    let delegation = Delegation {
        executor: env.query_executor.clone(),
        upstreams: env.upstreams.clone(),
        remote_schemas: env.remote_schemas.clone(),
        default_timeout: env.default_timeout,
    };

    Arc::new(move |invocation: FieldInvocation| {
        let args = args.clone();
        let delegation = delegation.clone();
        async move {
            delegation.run(&args, &invocation).await.map_err(|err| {
                tracing::warn!(%err, field = %invocation.field_name, "Remote GraphQL call failed");
                err.extend()
            })
        }
        .boxed()
    })
}

impl Delegation {
    async fn run(&self, args: &GqlArgs, invocation: &FieldInvocation) -> Result<Value, UpstreamError> {
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let remote = self
            .remote_schemas
            .get(&args.url, self.executor.as_ref(), &self.upstreams, timeout)
            .await?;

        // without explicit arguments the field's own arguments are forwarded
        let arguments = match &args.arguments {
            Some(template) => deep_inject(&Value::Object(template.clone()), &invocation.context(None)),
            None => invocation.args.clone(),
        };
        let arguments: Map<String, Value> = arguments
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let plan = plan_delegation(
            args.operation_type,
            &args.field_name,
            &arguments,
            &remote,
            &invocation.selection,
        )
        .map_err(|message| UpstreamError::Remote {
            url: args.url.clone(),
            message,
        })?;

        let request = RemoteRequest {
            url: &args.url,
            plan,
            timeout,
            scope: Some(invocation.scope.as_ref()),
        };
        let data = self.executor.execute(request, &self.upstreams).await?;
        Ok(data.get(&args.field_name).cloned().unwrap_or(Value::Null))
    }
}
