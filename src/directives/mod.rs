//! Field resolver construction from schema directives.
//!
//! Every recognised directive maps to one [`ResolverBuilder`] variant. Builders are
//! applied to a field in a fixed order, independent of how the directives are
//! written:
//!
//! 1. at most one data source (`@stub`, `@localResolver`, `@rest`, `@gql`) replaces
//!    the default property resolver; a merging `@localResolver` wraps it instead,
//! 2. `@select` transforms wrap the data source,
//! 3. field level `@policy`/`@policies` gates wrap those, the leftmost outermost,
//! 4. type level gates wrap the field gates,
//! 5. the resource group's base policy wraps everything.
//!
//! `@export` never changes the resolver; it only feeds the schema's [`ExportMap`].
//!
//! [`ExportMap`]: crate::exports::ExportMap

mod gql;
mod policy;
mod rest;
mod stub;

use futures::FutureExt;
use futures::future::BoxFuture;
use graphql_parser::schema::{Directive, Field, Value as SdlValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BuildError;
use crate::exports::ObjectNode;
use crate::param_injection::{ExportLookup, ResolutionContext, lookup_path};
use crate::policy::PolicyExecutor;
use crate::query_executor::{QueryExecutor, RemoteSchemaCache};
use crate::query_planner::SelectionNode;
use crate::request_context::RequestScope;
use crate::resources::Policy;
use crate::upstreams::Upstreams;

pub use policy::PolicyGate;

/// Directive definitions and scalars merged into every composed schema.
pub const BASE_SDL: &str = r#"
scalar JSON
scalar JSONObject
scalar Date
scalar Time
scalar DateTime

input KeyValue {
  key: String!
  value: String!
}

enum GraphQLOperationType {
  Query
  Mutation
}

enum LocalResolverMergeStrategy {
  Replace
  Merge
  MergeDeep
}

enum PoliciesRelation {
  AND
  OR
}

input PolicyDetails {
  namespace: String!
  name: String!
  args: JSONObject
}

directive @stub(value: JSON!) on FIELD_DEFINITION
directive @localResolver(value: JSON!, mergeStrategy: LocalResolverMergeStrategy = Replace) on FIELD_DEFINITION
directive @rest(url: String!, method: String, body: String, bodyArg: String, query: [KeyValue!], headers: [KeyValue!], timeoutMs: Int, notFoundAsNull: Boolean) on FIELD_DEFINITION
directive @gql(url: String!, fieldName: String!, operationType: GraphQLOperationType, arguments: JSONObject, timeoutMs: Int) on FIELD_DEFINITION
directive @select(path: [String!]!) on FIELD_DEFINITION
directive @export(key: String!) on FIELD_DEFINITION
directive @policy(namespace: String!, name: String!, args: JSONObject) on OBJECT | FIELD_DEFINITION
directive @policies(policies: [PolicyDetails!]!, relation: PoliciesRelation = OR, postResolve: Boolean = false) on OBJECT | FIELD_DEFINITION
"#;

/// Composed when a resource group holds no schemas.
pub const DEFAULT_SDL: &str = r#"type Query { default: String! @stub(value: "default") }"#;

pub type FieldResult = Result<Value, async_graphql::Error>;

/// A field resolver over plain JSON values.
pub type Resolver = Arc<dyn Fn(FieldInvocation) -> BoxFuture<'static, FieldResult> + Send + Sync>;

/// One call of a field resolver.
#[derive(Clone)]
pub struct FieldInvocation {
    pub parent_type: Arc<str>,
    pub field_name: Arc<str>,
    pub parent: Option<ObjectNode>,
    pub args: Value,
    pub scope: Arc<RequestScope>,
    /// Only collected for fields that delegate to a remote GraphQL service.
    pub selection: Arc<[SelectionNode]>,
}

impl FieldInvocation {
    pub fn source(&self) -> &Value {
        static NO_SOURCE: Value = Value::Null;
        self.parent.as_ref().map_or(&NO_SOURCE, ObjectNode::value)
    }

    pub fn context<'a>(&'a self, result: Option<&'a Value>) -> ResolutionContext<'a> {
        ResolutionContext {
            source: self.source(),
            args: &self.args,
            jwt: self.scope.jwt(),
            exports: Some(ExportLookup {
                tracker: &self.scope.exports,
                parent_type: &self.parent_type,
                parent: self.parent.as_ref(),
            }),
            result,
        }
    }
}

/// Snapshot-bound collaborators that resolvers close over.
#[derive(Clone)]
pub struct WiringEnv {
    pub http: reqwest::Client,
    pub upstreams: Arc<Upstreams>,
    pub query_executor: Arc<dyn QueryExecutor>,
    pub remote_schemas: Arc<RemoteSchemaCache>,
    pub policy_executor: Arc<PolicyExecutor>,
    pub default_timeout: Duration,
    pub base_policy: Option<Policy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Stub,
    LocalResolver,
    Rest,
    Gql,
    Select,
    Export,
    Policy,
    Policies,
}

const DIRECTIVES: &[(&str, DirectiveKind)] = &[
    ("stub", DirectiveKind::Stub),
    ("localResolver", DirectiveKind::LocalResolver),
    ("rest", DirectiveKind::Rest),
    ("gql", DirectiveKind::Gql),
    ("select", DirectiveKind::Select),
    ("export", DirectiveKind::Export),
    ("policy", DirectiveKind::Policy),
    ("policies", DirectiveKind::Policies),
];

pub fn directive_kind(name: &str) -> Option<DirectiveKind> {
    DIRECTIVES
        .iter()
        .find(|(directive, _)| *directive == name)
        .map(|(_, kind)| *kind)
}

/// A parsed directive, ready to produce or wrap a resolver.
pub enum ResolverBuilder {
    Stub(Value),
    LocalResolver(stub::LocalResolverArgs),
    Rest(rest::RestArgs),
    Gql(gql::GqlArgs),
    Select(Vec<String>),
    Gate(PolicyGate),
}

impl ResolverBuilder {
    fn is_data_source(&self) -> bool {
        match self {
            ResolverBuilder::Stub(_) | ResolverBuilder::Rest(_) | ResolverBuilder::Gql(_) => true,
            ResolverBuilder::LocalResolver(args) => args.merge_strategy == stub::MergeStrategy::Replace,
            ResolverBuilder::Select(_) | ResolverBuilder::Gate(_) => false,
        }
    }

    /// Data sources ignore `inner`; every other variant wraps it.
    pub fn apply(self, inner: Resolver, env: &WiringEnv) -> Resolver {
        match self {
            ResolverBuilder::Stub(value) => stub::resolver(value),
            ResolverBuilder::LocalResolver(args) => stub::local_resolver(args, inner),
            ResolverBuilder::Rest(args) => rest::resolver(args, env),
            ResolverBuilder::Gql(args) => gql::resolver(args, env),
            ResolverBuilder::Select(path) => select(path, inner),
            ResolverBuilder::Gate(gate) => gate.wrap(inner, env.policy_executor.clone()),
        }
    }
}

#[derive(Deserialize)]
struct StubArgs {
    value: Value,
}

#[derive(Deserialize)]
struct SelectArgs {
    path: Vec<String>,
}

#[derive(Deserialize)]
struct ExportArgs {
    key: String,
}

/// The resolver chain for one field plus what the schema builder needs to know.
pub struct WiredField {
    pub resolver: Resolver,
    pub needs_selection: bool,
}

pub fn wire_field(
    type_name: &str,
    field: &Field<'static, String>,
    type_directives: &[Directive<'static, String>],
    env: &WiringEnv,
) -> Result<WiredField, BuildError> {
    let coordinate = format!("{type_name}.{}", field.name);

    let mut source = None;
    let mut merges = Vec::new();
    let mut selects = Vec::new();
    let mut field_gates = Vec::new();
    let mut field_policies = Vec::new();
    for directive in &field.directives {
        let Some(kind) = directive_kind(&directive.name) else {
            continue;
        };
        let builder = match kind {
            DirectiveKind::Stub => ResolverBuilder::Stub(parse_args::<StubArgs>(directive, &coordinate)?.value),
            DirectiveKind::LocalResolver => ResolverBuilder::LocalResolver(parse_args(directive, &coordinate)?),
            DirectiveKind::Rest => ResolverBuilder::Rest(parse_args(directive, &coordinate)?),
            DirectiveKind::Gql => ResolverBuilder::Gql(parse_args(directive, &coordinate)?),
            DirectiveKind::Select => {
                ResolverBuilder::Select(parse_args::<SelectArgs>(directive, &coordinate)?.path)
            }
            DirectiveKind::Export => {
                parse_args::<ExportArgs>(directive, &coordinate)?;
                continue;
            }
            DirectiveKind::Policy => {
                let policy: Policy = parse_args(directive, &coordinate)?;
                field_policies.push(policy.clone());
                ResolverBuilder::Gate(PolicyGate::single(policy))
            }
            DirectiveKind::Policies => {
                ResolverBuilder::Gate(PolicyGate::composite(parse_args(directive, &coordinate)?))
            }
        };

        if builder.is_data_source() {
            if source.is_some() {
                return Err(BuildError::Directive {
                    directive: directive.name.clone(),
                    coordinate,
                    message: "a field can have only one data source directive".into(),
                });
            }
            source = Some(builder);
        } else if let ResolverBuilder::LocalResolver(_) = builder {
            merges.push(builder);
        } else if let ResolverBuilder::Select(_) = builder {
            selects.push(builder);
        } else {
            field_gates.push(builder);
        }
    }

    let needs_selection = matches!(source, Some(ResolverBuilder::Gql(_)));
    let mut resolver = match source {
        Some(builder) => builder.apply(default_resolver(), env),
        None => default_resolver(),
    };
    for merge in merges {
        resolver = merge.apply(resolver, env);
    }
    for select in selects {
        resolver = select.apply(resolver, env);
    }
    for gate in field_gates.into_iter().rev() {
        resolver = gate.apply(resolver, env);
    }

    let mut type_gates = Vec::new();
    for directive in type_directives {
        match directive_kind(&directive.name) {
            Some(DirectiveKind::Policy) if field_policies.is_empty() => {
                type_gates.push(PolicyGate::single(parse_args(directive, type_name)?));
            }
            Some(DirectiveKind::Policies) => {
                type_gates.push(PolicyGate::composite(parse_args(directive, type_name)?).on_object());
            }
            _ => {}
        }
    }
    for gate in type_gates.into_iter().rev() {
        resolver = gate.wrap(resolver, env.policy_executor.clone());
    }

    if let Some(base_policy) = &env.base_policy {
        let overridden = field_policies.iter().any(|policy| {
            env.policy_executor
                .definition(&policy.namespace, &policy.name)
                .and_then(|definition| definition.should_override_base_policy)
                .unwrap_or(false)
        });
        if !overridden {
            resolver = PolicyGate::single(base_policy.clone()).wrap(resolver, env.policy_executor.clone());
        }
    }

    Ok(WiredField {
        resolver,
        needs_selection,
    })
}

/// The `@export` key of a field, if any.
pub fn export_key(field: &Field<'static, String>) -> Option<String> {
    field
        .directives
        .iter()
        .filter(|d| directive_kind(&d.name) == Some(DirectiveKind::Export))
        .find_map(|d| serde_json::from_value::<ExportArgs>(directive_arguments(d)).ok())
        .map(|args| args.key)
}

/// Reads `source[field_name]`.
pub fn default_resolver() -> Resolver {
    Arc::new(|invocation: FieldInvocation| {
        let value = invocation
            .source()
            .get(invocation.field_name.as_ref())
            .cloned()
            .unwrap_or(Value::Null);
        futures::future::ready(FieldResult::Ok(value)).boxed()
    })
}

fn select(path: Vec<String>, inner: Resolver) -> Resolver {
    let path = Arc::new(path.join("."));
    Arc::new(move |invocation: FieldInvocation| {
        let inner = inner.clone();
        let path = path.clone();
        async move {
            let result = inner(invocation).await?;
            FieldResult::Ok(if path.is_empty() {
                result
            } else {
                lookup_path(&result, &path)
            })
        }
        .boxed()
    })
}

fn parse_args<T: DeserializeOwned>(
    directive: &Directive<'static, String>,
    coordinate: &str,
) -> Result<T, BuildError> {
    serde_json::from_value(directive_arguments(directive)).map_err(|e| BuildError::Directive {
        directive: directive.name.clone(),
        coordinate: coordinate.to_string(),
        message: e.to_string(),
    })
}

/// Directive arguments as a JSON object. Enum values become strings.
pub fn directive_arguments(directive: &Directive<'static, String>) -> Value {
    Value::Object(
        directive
            .arguments
            .iter()
            .map(|(name, value)| (name.clone(), sdl_value_to_json(value)))
            .collect::<Map<_, _>>(),
    )
}

pub fn sdl_value_to_json(value: &SdlValue<'static, String>) -> Value {
    match value {
        SdlValue::Variable(_) | SdlValue::Null => Value::Null,
        SdlValue::Int(n) => n.as_i64().map(Value::from).unwrap_or(Value::Null),
        SdlValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        SdlValue::String(s) => Value::String(s.clone()),
        SdlValue::Boolean(b) => Value::Bool(*b),
        SdlValue::Enum(e) => Value::String(e.clone()),
        SdlValue::List(items) => Value::Array(items.iter().map(sdl_value_to_json).collect()),
        SdlValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), sdl_value_to_json(v)))
                .collect(),
        ),
    }
}
