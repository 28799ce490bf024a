//! One immutable, executable snapshot of the composed schema.
//!
//! A gateway is built from a [`ResourceGroup`] in a single pass: the schemas are
//! merged, every field is wired through its directives, and the result is lowered
//! into an `async_graphql` dynamic schema. Values flow through resolvers as plain
//! JSON; objects carry an [`ObjectNode`] so that nested fields can reach their
//! source and exported ancestors.

use async_graphql::dynamic::{
    Enum, EnumItem, Field, FieldFuture, FieldValue, InputObject, InputValue, Interface,
    InterfaceField, Object, ResolverContext, Scalar, Schema, SchemaBuilder, TypeRef, Union,
};
use async_graphql::{ErrorExtensions, Name, Number, Pos, Response, ServerError, Value as ConstValue, Variables};
use async_trait::async_trait;
use graphql_parser::schema::{self as sdl, Definition, TypeDefinition};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::GraphQLRequest;
use crate::directives::{
    BASE_SDL, DEFAULT_SDL, FieldInvocation, WiredField, WiringEnv, export_key, wire_field,
};
use crate::error::BuildError;
use crate::exports::{ExportMap, ObjectNode};
use crate::param_injection::ResolutionContext;
use crate::policy::{PolicyError, PolicyEvaluators, PolicyExecutor, PolicyQueryRunner};
use crate::query_executor::{HttpQueryExecutor, QueryExecutor, RemoteSchemaCache};
use crate::query_planner::{self, SelectionNode};
use crate::request_context::RequestScope;
use crate::resources::ResourceGroup;
use crate::schema_merger::{self, NamedDocument, SchemaDocument};
use crate::upstreams::{ClientCredentialsTokenProvider, TokenProvider, Upstreams};

const BUILTIN_SCALARS: [&str; 5] = ["String", "Int", "Float", "Boolean", "ID"];

/// Long-lived collaborators shared by every snapshot.
#[derive(Clone)]
pub struct GatewayServices {
    pub http: reqwest::Client,
    pub query_executor: Arc<dyn QueryExecutor>,
    pub tokens: Arc<dyn TokenProvider>,
    pub evaluators: PolicyEvaluators,
    pub default_timeout: Duration,
}

impl Default for GatewayServices {
    fn default() -> Self {
        let http = reqwest::Client::new();
        GatewayServices {
            query_executor: Arc::new(HttpQueryExecutor::new(http.clone())),
            tokens: Arc::new(ClientCredentialsTokenProvider::new(http.clone())),
            http,
            evaluators: PolicyEvaluators::default(),
            default_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayServices {
    pub fn with_evaluators(mut self, evaluators: PolicyEvaluators) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn with_query_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.query_executor = executor;
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

#[derive(Debug, Default)]
struct TypeIndex {
    kinds: HashMap<String, TypeKind>,
}

impl TypeIndex {
    fn from_document(document: &SchemaDocument) -> Self {
        let mut kinds: HashMap<String, TypeKind> = BUILTIN_SCALARS
            .iter()
            .map(|name| (name.to_string(), TypeKind::Scalar))
            .collect();
        for definition in &document.definitions {
            if let Definition::TypeDefinition(definition) = definition {
                let kind = match definition {
                    TypeDefinition::Scalar(_) => TypeKind::Scalar,
                    TypeDefinition::Object(_) => TypeKind::Object,
                    TypeDefinition::Interface(_) => TypeKind::Interface,
                    TypeDefinition::Union(_) => TypeKind::Union,
                    TypeDefinition::Enum(_) => TypeKind::Enum,
                    TypeDefinition::InputObject(_) => TypeKind::InputObject,
                };
                kinds.entry(type_name(definition).to_string()).or_insert(kind);
            }
        }
        TypeIndex { kinds }
    }

    fn kind(&self, name: &str) -> Option<TypeKind> {
        self.kinds.get(name).copied()
    }
}

pub struct ExecutableGateway {
    schema: Schema,
    sdl: Arc<str>,
    resource_group: Arc<ResourceGroup>,
    export_map: Arc<ExportMap>,
    policy_executor: Arc<PolicyExecutor>,
}

impl ExecutableGateway {
    pub fn build(resource_group: Arc<ResourceGroup>, services: &GatewayServices) -> Result<Self, BuildError> {
        let mut documents = vec![NamedDocument::parse("stitch/base", BASE_SDL)?];
        if resource_group.schemas.is_empty() {
            documents.push(NamedDocument::parse("stitch/default", DEFAULT_SDL)?);
        } else {
            for schema in &resource_group.schemas {
                documents.push(NamedDocument::parse(schema.metadata.to_string(), &schema.schema)?);
            }
        }
        let merged = schema_merger::merge(&documents)?;

        let types = Arc::new(TypeIndex::from_document(&merged));
        let export_map = Arc::new(build_export_map(&merged));
        let policy_executor = Arc::new(PolicyExecutor::new(
            resource_group.policies.clone(),
            services.evaluators.clone(),
        ));
        let env = WiringEnv {
            http: services.http.clone(),
            upstreams: Arc::new(Upstreams::from_resource_group(
                &resource_group,
                services.tokens.clone(),
            )?),
            query_executor: services.query_executor.clone(),
            remote_schemas: Arc::new(RemoteSchemaCache::default()),
            policy_executor: policy_executor.clone(),
            default_timeout: services.default_timeout,
            base_policy: resource_group.base_policy.clone(),
        };

        let (query_root, mutation_root) = root_types(&merged, &types);
        let mut builder = Schema::build(&query_root, mutation_root.as_deref(), None);
        let mut registered = HashSet::new();
        for definition in &merged.definitions {
            let Definition::TypeDefinition(definition) = definition else {
                continue;
            };
            let name = type_name(definition);
            if BUILTIN_SCALARS.contains(&name) {
                continue;
            }
            if !registered.insert(name.to_string()) {
                tracing::warn!(type_name = name, "Ignoring duplicate type definition");
                continue;
            }
            builder = lower_type(builder, definition, &types, &env)?;
        }

        let schema = builder
            .finish()
            .map_err(|e| BuildError::Schema(format!("{e:?}")))?;

        tracing::debug!(
            schemas = resource_group.schemas.len(),
            exports = !export_map.is_empty(),
            "Built executable schema"
        );
        Ok(ExecutableGateway {
            schema,
            sdl: merged.to_string().into(),
            resource_group,
            export_map,
            policy_executor,
        })
    }

    /// The merged SDL this gateway serves.
    pub fn sdl(&self) -> Arc<str> {
        self.sdl.clone()
    }

    pub fn resource_group(&self) -> &Arc<ResourceGroup> {
        &self.resource_group
    }

    pub async fn execute(&self, request: GraphQLRequest) -> Response {
        let queries = Arc::new(SchemaPolicyQueries {
            schema: self.schema.clone(),
            export_map: self.export_map.clone(),
            headers: request.headers.clone(),
        });
        let scope = Arc::new(
            RequestScope::new(self.export_map.clone(), request.headers).with_policy_queries(queries),
        );

        if let Err(err) = self
            .check_introspection(&request.query, request.operation_name.as_deref(), &scope)
            .await
        {
            return Response::from_errors(vec![into_server_error(err)]);
        }

        let mut gql_request = async_graphql::Request::new(request.query).data(scope);
        if let Some(variables) = request.variables {
            gql_request = gql_request.variables(Variables::from_json(variables));
        }
        if let Some(operation_name) = request.operation_name {
            gql_request = gql_request.operation_name(operation_name);
        }
        self.schema.execute(gql_request).await
    }

    /// Operations selecting `__schema` or `__type` need the introspection policy,
    /// or the base policy when none is configured.
    async fn check_introspection(
        &self,
        query: &str,
        operation_name: Option<&str>,
        scope: &RequestScope,
    ) -> Result<(), PolicyError> {
        let policy = self
            .resource_group
            .introspection_query_policy
            .as_ref()
            .or(self.resource_group.base_policy.as_ref());
        let Some(policy) = policy else {
            return Ok(());
        };
        // unparsable queries are reported by the executor
        let Ok(fields) = query_planner::root_fields(query, operation_name) else {
            return Ok(());
        };
        if !fields.iter().any(|f| f == "__schema" || f == "__type") {
            return Ok(());
        }

        let ctx = ResolutionContext::empty().with_jwt(scope.jwt());
        self.policy_executor
            .validate_policy(policy, &ctx, scope.policy_scope())
            .await
    }
}

/// Runs policy queries through the snapshot's own schema, with the caller's headers
/// and without policy gates.
struct SchemaPolicyQueries {
    schema: Schema,
    export_map: Arc<ExportMap>,
    headers: HashMap<String, String>,
}

#[async_trait]
impl PolicyQueryRunner for SchemaPolicyQueries {
    async fn run(&self, query: &str, variables: Map<String, Value>) -> Result<Value, String> {
        let scope = Arc::new(RequestScope::new(self.export_map.clone(), self.headers.clone()).ignoring_policies());
        let request = async_graphql::Request::new(query)
            .variables(Variables::from_json(Value::Object(variables)))
            .data(scope);
        let response = self.schema.execute(request).await;
        if !response.errors.is_empty() {
            return Err(response
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join(", "));
        }
        response.data.into_json().map_err(|e| e.to_string())
    }
}

fn into_server_error(err: PolicyError) -> ServerError {
    err.extend().into_server_error(Pos::default())
}

fn type_name<'d>(definition: &'d TypeDefinition<'static, String>) -> &'d str {
    match definition {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

/// Query and mutation roots. A `Subscription` type is lowered as a plain object;
/// subscription operations are rejected by the executor.
fn root_types(document: &SchemaDocument, types: &TypeIndex) -> (String, Option<String>) {
    let declared = document.definitions.iter().find_map(|d| match d {
        Definition::SchemaDefinition(schema) => Some(schema),
        _ => None,
    });
    match declared {
        Some(schema) => (
            schema.query.clone().unwrap_or_else(|| "Query".to_string()),
            schema.mutation.clone(),
        ),
        None => (
            "Query".to_string(),
            (types.kind("Mutation") == Some(TypeKind::Object)).then(|| "Mutation".to_string()),
        ),
    }
}

fn build_export_map(document: &SchemaDocument) -> ExportMap {
    let mut exports = ExportMap::default();
    for definition in &document.definitions {
        if let Definition::TypeDefinition(TypeDefinition::Object(object)) = definition {
            for field in &object.fields {
                if let Some(key) = export_key(field) {
                    exports.mark(&object.name, &field.name, &key);
                }
            }
        }
    }
    exports
}

fn lower_type(
    builder: SchemaBuilder,
    definition: &TypeDefinition<'static, String>,
    types: &Arc<TypeIndex>,
    env: &WiringEnv,
) -> Result<SchemaBuilder, BuildError> {
    Ok(match definition {
        TypeDefinition::Scalar(scalar) => {
            let mut lowered = Scalar::new(&scalar.name);
            if let Some(description) = &scalar.description {
                lowered = lowered.description(description);
            }
            builder.register(lowered)
        }
        TypeDefinition::Object(object) => builder.register(lower_object(object, types, env)?),
        TypeDefinition::Interface(interface) => {
            let mut lowered = Interface::new(&interface.name);
            if let Some(description) = &interface.description {
                lowered = lowered.description(description);
            }
            for implemented in &interface.implements_interfaces {
                lowered = lowered.implement(implemented);
            }
            for field in &interface.fields {
                let mut lowered_field = InterfaceField::new(&field.name, type_ref(&field.field_type));
                for argument in &field.arguments {
                    lowered_field = lowered_field.argument(input_value(argument));
                }
                if let Some(description) = &field.description {
                    lowered_field = lowered_field.description(description);
                }
                lowered = lowered.field(lowered_field);
            }
            builder.register(lowered)
        }
        TypeDefinition::Union(union_type) => {
            let mut lowered = Union::new(&union_type.name);
            if let Some(description) = &union_type.description {
                lowered = lowered.description(description);
            }
            for member in &union_type.types {
                lowered = lowered.possible_type(member);
            }
            builder.register(lowered)
        }
        TypeDefinition::Enum(enum_type) => {
            let mut lowered = Enum::new(&enum_type.name);
            if let Some(description) = &enum_type.description {
                lowered = lowered.description(description);
            }
            for value in &enum_type.values {
                let mut item = EnumItem::new(&value.name);
                if let Some(description) = &value.description {
                    item = item.description(description);
                }
                lowered = lowered.item(item);
            }
            builder.register(lowered)
        }
        TypeDefinition::InputObject(input) => {
            let mut lowered = InputObject::new(&input.name);
            if let Some(description) = &input.description {
                lowered = lowered.description(description);
            }
            for field in &input.fields {
                lowered = lowered.field(input_value(field));
            }
            builder.register(lowered)
        }
    })
}

fn lower_object(
    object: &sdl::ObjectType<'static, String>,
    types: &Arc<TypeIndex>,
    env: &WiringEnv,
) -> Result<Object, BuildError> {
    let mut lowered = Object::new(&object.name);
    if let Some(description) = &object.description {
        lowered = lowered.description(description);
    }
    for implemented in &object.implements_interfaces {
        lowered = lowered.implement(implemented);
    }

    let parent_type: Arc<str> = object.name.as_str().into();
    for field in &object.fields {
        let wired = wire_field(&object.name, field, &object.directives, env)?;
        let resolver = field_resolver(Arc::new(BoundField {
            wired,
            field_type: field.field_type.clone(),
            parent_type: parent_type.clone(),
            field_name: field.name.as_str().into(),
            types: types.clone(),
        }));

        let mut lowered_field = Field::new(&field.name, type_ref(&field.field_type), resolver);
        for argument in &field.arguments {
            lowered_field = lowered_field.argument(input_value(argument));
        }
        if let Some(description) = &field.description {
            lowered_field = lowered_field.description(description);
        }
        lowered = lowered.field(lowered_field);
    }
    Ok(lowered)
}

fn type_ref(ty: &sdl::Type<'static, String>) -> TypeRef {
    match ty {
        sdl::Type::NamedType(name) => TypeRef::named(name),
        sdl::Type::ListType(inner) => TypeRef::List(Box::new(type_ref(inner))),
        sdl::Type::NonNullType(inner) => TypeRef::NonNull(Box::new(type_ref(inner))),
    }
}

fn input_value(value: &sdl::InputValue<'static, String>) -> InputValue {
    let mut lowered = InputValue::new(&value.name, type_ref(&value.value_type));
    if let Some(default) = &value.default_value {
        lowered = lowered.default_value(to_const_value(default));
    }
    if let Some(description) = &value.description {
        lowered = lowered.description(description);
    }
    lowered
}

fn to_const_value(value: &sdl::Value<'static, String>) -> ConstValue {
    match value {
        sdl::Value::Variable(_) | sdl::Value::Null => ConstValue::Null,
        sdl::Value::Int(n) => n
            .as_i64()
            .map(|i| ConstValue::Number(i.into()))
            .unwrap_or(ConstValue::Null),
        sdl::Value::Float(f) => Number::from_f64(*f)
            .map(ConstValue::Number)
            .unwrap_or(ConstValue::Null),
        sdl::Value::String(s) => ConstValue::String(s.clone()),
        sdl::Value::Boolean(b) => ConstValue::Boolean(*b),
        sdl::Value::Enum(e) => ConstValue::Enum(Name::new(e)),
        sdl::Value::List(items) => ConstValue::List(items.iter().map(to_const_value).collect()),
        sdl::Value::Object(fields) => ConstValue::Object(
            fields
                .iter()
                .map(|(name, value)| (Name::new(name), to_const_value(value)))
                .collect(),
        ),
    }
}

/// Everything a lowered field needs to call its resolver chain.
struct BoundField {
    wired: WiredField,
    field_type: sdl::Type<'static, String>,
    parent_type: Arc<str>,
    field_name: Arc<str>,
    types: Arc<TypeIndex>,
}

impl BoundField {
    fn is_nullable(&self) -> bool {
        !matches!(self.field_type, sdl::Type::NonNullType(_))
    }

    async fn resolve<'a>(
        &self,
        ctx: &ResolverContext<'a>,
    ) -> Result<Option<FieldValue<'a>>, async_graphql::Error> {
        let scope = ctx.data::<Arc<RequestScope>>()?.clone();
        let parent = ctx.parent_value.downcast_ref::<ObjectNode>().cloned();
        let args = Value::Object(
            ctx.args
                .as_index_map()
                .iter()
                .map(|(name, value)| Ok::<_, serde_json::Error>((name.to_string(), value.clone().into_json()?)))
                .collect::<Result<Map<_, _>, serde_json::Error>>()?,
        );
        let selection: Arc<[SelectionNode]> = if self.wired.needs_selection {
            collect_selection(ctx.field()).into()
        } else {
            Vec::new().into()
        };

        let invocation = FieldInvocation {
            parent_type: self.parent_type.clone(),
            field_name: self.field_name.clone(),
            parent: parent.clone(),
            args,
            scope: scope.clone(),
            selection,
        };
        let value = (self.wired.resolver)(invocation).await?;

        let output = Output {
            types: &self.types,
            scope: &scope,
            parent: parent.as_ref(),
            parent_type: &self.parent_type,
        };
        output.convert(value, &self.field_type)
    }
}

/// Failures of nullable fields are reported with their path and resolve to null.
/// Non-null fields hand the error back to the executor.
fn field_resolver(
    bound: Arc<BoundField>,
) -> impl for<'a> Fn(ResolverContext<'a>) -> FieldFuture<'a> + Send + Sync + 'static {
    move |ctx: ResolverContext| {
        let bound = bound.clone();
        FieldFuture::new(async move {
            match bound.resolve(&ctx).await {
                Ok(value) => Ok(value),
                Err(err) if bound.is_nullable() => {
                    ctx.add_error(ctx.set_error_path(err.into_server_error(ctx.item.pos)));
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })
    }
}

fn collect_selection(field: async_graphql::SelectionField<'_>) -> Vec<SelectionNode> {
    field
        .selection_set()
        .map(|child| SelectionNode {
            name: child.name().to_string(),
            arguments: child
                .arguments()
                .unwrap_or_default()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            children: collect_selection(child),
        })
        .collect()
}

/// Shapes a resolver's JSON result after the field's declared type.
struct Output<'c> {
    types: &'c TypeIndex,
    scope: &'c RequestScope,
    parent: Option<&'c ObjectNode>,
    parent_type: &'c str,
}

impl Output<'_> {
    fn convert<'a>(
        &self,
        value: Value,
        ty: &sdl::Type<'static, String>,
    ) -> Result<Option<FieldValue<'a>>, async_graphql::Error> {
        match ty {
            sdl::Type::NonNullType(inner) => self.convert(value, inner),
            sdl::Type::ListType(inner) => match value {
                Value::Null => Ok(None),
                Value::Array(items) => {
                    let items = items
                        .into_iter()
                        .map(|item| {
                            Ok::<_, async_graphql::Error>(
                                self.convert(item, inner)?
                                    .unwrap_or_else(|| FieldValue::value(ConstValue::Null)),
                            )
                        })
                        .collect::<Result<Vec<_>, async_graphql::Error>>()?;
                    Ok(Some(FieldValue::list(items)))
                }
                other => Err(async_graphql::Error::new(format!(
                    "Expected a list but the resolver returned {other}"
                ))),
            },
            sdl::Type::NamedType(name) => {
                if value.is_null() {
                    return Ok(None);
                }
                let converted = match self.types.kind(name) {
                    Some(TypeKind::Object) => FieldValue::owned_any(self.record(value)),
                    Some(TypeKind::Interface | TypeKind::Union) => {
                        let concrete = value
                            .get("__typename")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| {
                                async_graphql::Error::new(format!(
                                    "Expecting a \"__typename\" property in source when resolving an interface or union: {name}"
                                ))
                            })?;
                        FieldValue::owned_any(self.record(value)).with_type(concrete)
                    }
                    Some(TypeKind::Enum) => match value {
                        Value::String(s) => FieldValue::value(ConstValue::Enum(Name::new(s))),
                        other => FieldValue::value(ConstValue::from_json(other)?),
                    },
                    _ => FieldValue::value(scalar(name, value)?),
                };
                Ok(Some(converted))
            }
        }
    }

    fn record(&self, value: Value) -> ObjectNode {
        self.scope.exports.record(value, self.parent, self.parent_type)
    }
}

/// Built-in text scalars accept numbers and booleans by printing them.
fn scalar(name: &str, value: Value) -> Result<ConstValue, serde_json::Error> {
    match (name, value) {
        ("String" | "ID", Value::Number(n)) => Ok(ConstValue::String(n.to_string())),
        ("String" | "ID", Value::Bool(b)) => Ok(ConstValue::String(b.to_string())),
        (_, other) => ConstValue::from_json(other),
    }
}
