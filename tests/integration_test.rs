use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stitch_gateway::policy::{PolicyDecision, PolicyError, PolicyEvaluationInput, PolicyEvaluator, PolicyEvaluators};
use stitch_gateway::resources::{PolicyDefinition, PolicyType, ResourceMetadata, Schema, Upstream, UpstreamHeader};
use stitch_gateway::{
    GatewayError, GatewayRuntime, GatewayServices, GraphQLRequest, InMemoryResourceRepository, RefreshHandle,
    ResourceGroup, ResourceRepository, ResourceUpdateStream,
};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USERS_SCHEMA: &str = r#"
type Query {
  user(id: ID!): User @rest(url: "USERS_URL/users/{args.id}")
  slowUser(id: ID!): User @rest(url: "USERS_URL/slow/{args.id}", timeoutMs: 100)
}

type User {
  id: ID! @export(key: "userId")
  name: String
  orders: [Order] @rest(url: "ORDERS_URL/orders", query: [{ key: "user", value: "{source.id}" }])
}
"#;

const ORDERS_SCHEMA: &str = r#"
type Order {
  id: ID!
  total: Float
  lines: [OrderLine] @rest(url: "ORDERS_URL/orders/{source.id}/lines", query: [{ key: "user", value: "{exports.userId}" }])
}

type OrderLine {
  sku: String
  quantity: Int
}
"#;

const REPORTS_SCHEMA: &str = r#"
type Query {
  report: String @stub(value: "quarterly") @policies(policies: [{ namespace: "reports", name: "allow-read" }, { namespace: "reports", name: "deny-write" }], relation: OR)
  audit: String @stub(value: "audit") @policies(policies: [{ namespace: "reports", name: "allow-read" }, { namespace: "reports", name: "deny-write" }], relation: AND)
  summary: String @stub(value: "summary") @policy(namespace: "reports", name: "allow-read")
}
"#;

/// Allows policies whose name starts with "allow" and counts evaluations.
#[derive(Default)]
struct CountingEvaluator {
    calls: AtomicUsize,
}

#[async_trait]
impl PolicyEvaluator for CountingEvaluator {
    async fn evaluate(&self, input: PolicyEvaluationInput) -> Result<PolicyDecision, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(PolicyDecision {
            allow: input.definition.metadata.name.starts_with("allow"),
        })
    }
}

// Test fixture wiring a runtime to mocked upstream services through a polled repository
struct TestFixture {
    runtime: Arc<GatewayRuntime>,
    repository: InMemoryResourceRepository,
    refresh: RefreshHandle,
    evaluator: Arc<CountingEvaluator>,
    users: MockServer,
    orders: MockServer,
}

impl TestFixture {
    async fn setup() -> Result<Self, Box<dyn std::error::Error>> {
        let users = MockServer::start().await;
        let orders = MockServer::start().await;
        TestFixture::mount_services(&users, &orders).await;

        let evaluator = Arc::new(CountingEvaluator::default());
        let services = GatewayServices::default()
            .with_evaluators(PolicyEvaluators::default().with(PolicyType::Opa, evaluator.clone()));

        let repository = InMemoryResourceRepository::with_resource_group(TestFixture::resource_group(&users, &orders));
        let stream = ResourceUpdateStream::poll(Arc::new(repository.clone()), Duration::from_millis(50));
        let (updates, refresh) = stream.split();

        let runtime = GatewayRuntime::new(services);
        runtime.spawn(updates);
        tokio::time::timeout(Duration::from_secs(5), runtime.wait_until_ready()).await??;

        Ok(Self {
            runtime,
            repository,
            refresh,
            evaluator,
            users,
            orders,
        })
    }

    async fn mount_services(users: &MockServer, orders: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .and(header("x-tenant", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "u1", "name": "Ann" })))
            .mount(users)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow/u1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "u1", "name": "Late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(users)
            .await;

        Mock::given(method("GET"))
            .and(path("/orders"))
            .and(query_param("user", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "o1", "total": 12.5 }])))
            .mount(orders)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/o1/lines"))
            .and(query_param("user", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "sku": "sku-1", "quantity": 2 }])))
            .mount(orders)
            .await;
    }

    fn resource_group(users: &MockServer, orders: &MockServer) -> ResourceGroup {
        let expand = |sdl: &str| {
            sdl.replace("USERS_URL", &users.uri())
                .replace("ORDERS_URL", &orders.uri())
        };
        let users_host = users.uri().trim_start_matches("http://").to_string();

        ResourceGroup {
            schemas: vec![
                schema("users", &expand(USERS_SCHEMA)),
                schema("orders", &expand(ORDERS_SCHEMA)),
                schema("reports", REPORTS_SCHEMA),
            ],
            upstreams: vec![Upstream {
                metadata: ResourceMetadata::new("services", "users"),
                host: Some(users_host),
                source_hosts: None,
                target_origin: None,
                headers: vec![UpstreamHeader {
                    name: "x-tenant".to_string(),
                    value: "{incomingRequest.headers.x-tenant}".to_string(),
                }],
                auth: None,
            }],
            policies: vec![policy("allow-read"), policy("deny-write")],
            ..Default::default()
        }
    }

    // Helper method to execute GraphQL queries as the "acme" tenant
    async fn execute_query(&self, query: &str, variables: Option<Value>) -> Result<Value, GatewayError> {
        let mut request = GraphQLRequest::new(query).with_header("X-Tenant", "acme");
        request.variables = variables;
        self.runtime.process_request(request).await
    }

    // Stores `group` and waits until the runtime publishes a different schema
    async fn publish(&self, group: ResourceGroup) -> Result<(), Box<dyn std::error::Error>> {
        let mut changes = self.runtime.schema_changes();
        changes.borrow_and_update();
        self.repository.update(group).await?;
        self.refresh.refresh();
        tokio::time::timeout(Duration::from_secs(5), changes.changed()).await??;
        Ok(())
    }
}

fn schema(name: &str, sdl: &str) -> Schema {
    Schema {
        metadata: ResourceMetadata::new("services", name),
        schema: sdl.to_string(),
    }
}

fn policy(name: &str) -> PolicyDefinition {
    PolicyDefinition {
        metadata: ResourceMetadata::new("reports", name),
        policy_type: PolicyType::Opa,
        code: String::new(),
        args: None,
        should_override_base_policy: None,
        query: None,
    }
}

fn error_codes(result: &Value) -> Vec<String> {
    result["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e["extensions"]["code"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_stitched_queries() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestFixture::setup().await?;

    // Test 1: a REST field with upstream headers taken from the incoming request
    let result = fixture
        .execute_query(r#"query($id: ID!) { user(id: $id) { id name } }"#, Some(json!({ "id": "u1" })))
        .await?;
    assert_eq!(result["data"], json!({ "user": { "id": "u1", "name": "Ann" } }));

    // Test 2: nested fields read their parent and an exported ancestor value
    let result = fixture
        .execute_query(r#"{ user(id: "u1") { name orders { id total lines { sku quantity } } } }"#, None)
        .await?;
    assert_eq!(
        result["data"],
        json!({ "user": {
            "name": "Ann",
            "orders": [{ "id": "o1", "total": 12.5, "lines": [{ "sku": "sku-1", "quantity": 2 }] }]
        } })
    );

    // Test 3: a timed out upstream fails only its own field
    let result = fixture
        .execute_query(r#"{ user(id: "u1") { name } slowUser(id: "u1") { name } }"#, None)
        .await?;
    assert_eq!(result["data"], json!({ "user": { "name": "Ann" }, "slowUser": null }));
    assert_eq!(error_codes(&result), vec!["UPSTREAM_TIMEOUT"]);
    assert_eq!(result["errors"][0]["path"], json!(["slowUser"]));

    Ok(())
}

#[tokio::test]
async fn test_policies_combine_and_memoize() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestFixture::setup().await?;

    let before = fixture.evaluator.calls.load(Ordering::SeqCst);
    let result = fixture.execute_query("{ report audit summary }", None).await?;

    assert_eq!(
        result["data"],
        json!({ "report": "quarterly", "audit": null, "summary": "summary" })
    );
    assert_eq!(error_codes(&result), vec!["UNAUTHORIZED_BY_POLICY"]);
    assert_eq!(result["errors"][0]["path"], json!(["audit"]));

    // two distinct decisions, shared by all three fields of the request
    assert_eq!(fixture.evaluator.calls.load(Ordering::SeqCst) - before, 2);

    // a new request evaluates again
    fixture.execute_query("{ summary }", None).await?;
    assert_eq!(fixture.evaluator.calls.load(Ordering::SeqCst) - before, 3);

    Ok(())
}

#[tokio::test]
async fn test_schema_reload() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestFixture::setup().await?;

    // Test 1: a new schema resource becomes queryable after the next poll
    let mut group = TestFixture::resource_group(&fixture.users, &fixture.orders);
    group
        .schemas
        .push(schema("status", r#"type Query { status: String @stub(value: "green") }"#));
    fixture.publish(group.clone()).await?;

    let result = fixture.execute_query("{ status }", None).await?;
    assert_eq!(result["data"], json!({ "status": "green" }));

    // Test 2: a conflicting snapshot is rejected and the previous schema keeps serving
    let mut broken = group.clone();
    broken
        .schemas
        .push(schema("conflict", "type Query { status: Int }"));
    fixture.repository.update(broken).await?;
    fixture.refresh.refresh();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let result = fixture.execute_query("{ status }", None).await?;
    assert_eq!(result["data"], json!({ "status": "green" }));

    // Test 3: the next valid snapshot is applied again
    group.schemas.retain(|s| s.metadata.name != "status");
    fixture.publish(group).await?;

    let result = fixture.execute_query("{ status }", None).await?;
    assert!(result["errors"].is_array());

    fixture.runtime.dispose().await;
    assert!(matches!(
        fixture.execute_query("{ report }", None).await,
        Err(GatewayError::Disposed)
    ));

    Ok(())
}
