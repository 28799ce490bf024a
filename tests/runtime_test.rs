use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stitch_gateway::query_planner::RemoteSchema;
use stitch_gateway::resources::{ResourceMetadata, Schema};
use stitch_gateway::{
    FileSystemResourceRepository, GatewayRuntime, GatewayServices, GraphQLRequest, RegistryError, ResourceGroup,
    ResourceUpdateStream, RuntimeState, SchemaRegistry,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn schema(name: &str, sdl: &str) -> Schema {
    Schema {
        metadata: ResourceMetadata::new("runtime", name),
        schema: sdl.to_string(),
    }
}

fn group(schemas: Vec<Schema>) -> Arc<ResourceGroup> {
    Arc::new(ResourceGroup {
        schemas,
        ..Default::default()
    })
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stitch-gateway-it-{}-{name}", std::process::id()))
}

#[tokio::test]
async fn in_flight_requests_finish_on_the_schema_they_started_with() -> Result<(), Box<dyn std::error::Error>> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!("done"))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let runtime = GatewayRuntime::new(GatewayServices::default());
    let slow_sdl = format!(r#"type Query {{ slow: String @rest(url: "{}/slow") }}"#, server.uri());
    runtime.apply(group(vec![schema("slow", &slow_sdl)])).await?;

    let in_flight = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.process_request(GraphQLRequest::new("{ slow }")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    runtime
        .apply(group(vec![schema("fresh", r#"type Query { fresh: String @stub(value: "fresh") }"#)]))
        .await?;

    let finished = in_flight.await??;
    assert_eq!(finished["data"], json!({ "slow": "done" }));

    let fresh = runtime.process_request(GraphQLRequest::new("{ fresh }")).await?;
    assert_eq!(fresh["data"], json!({ "fresh": "fresh" }));

    let stale = runtime.process_request(GraphQLRequest::new("{ slow }")).await?;
    assert!(stale["errors"].is_array());
    Ok(())
}

#[tokio::test]
async fn failed_builds_keep_the_current_gateway() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = GatewayRuntime::new(GatewayServices::default());

    // nothing is published before a valid snapshot arrives
    let broken = group(vec![schema("broken", "type Query {")]);
    assert!(runtime.apply(broken.clone()).await.is_err());
    assert_eq!(runtime.state(), RuntimeState::Initializing);

    runtime
        .apply(group(vec![schema("a", r#"type Query { a: String @stub(value: "a") }"#)]))
        .await?;
    let current = runtime.current().ok_or("no gateway")?;

    assert!(runtime.apply(broken).await.is_err());
    let after = runtime.current().ok_or("no gateway")?;
    assert!(Arc::ptr_eq(&current, &after));
    assert_eq!(runtime.state(), RuntimeState::Ready);
    Ok(())
}

#[tokio::test]
#[serial]
async fn registry_changes_reach_the_gateway_through_the_file_store() -> Result<(), Box<dyn std::error::Error>> {
    let resources = temp_path("resources.yaml");
    let repository = Arc::new(FileSystemResourceRepository::new(&resources));
    let registry = SchemaRegistry::new(repository.clone());

    registry
        .update_schemas(
            vec![
                schema("users", r#"type Query { me: User @stub(value: { name: "Ann" }) }"#),
                schema("user-type", "type User { name: String }"),
            ],
            false,
        )
        .await?;

    // the registry rejects what the gateway could not build
    let rejected = registry
        .update_schemas(vec![schema("clash", "type User { name: Int }")], false)
        .await;
    assert!(matches!(rejected, Err(RegistryError::Validation(_))));

    let (updates, _refresh) = ResourceUpdateStream::poll(repository, Duration::from_millis(20)).split();
    let runtime = GatewayRuntime::new(GatewayServices::default());
    runtime.spawn(updates);
    tokio::time::timeout(Duration::from_secs(5), runtime.wait_until_ready()).await??;

    let body = runtime.process_request(GraphQLRequest::new("{ me { name } }")).await?;
    assert_eq!(body["data"], json!({ "me": { "name": "Ann" } }));

    runtime.dispose().await;
    tokio::fs::remove_file(&resources).await?;
    Ok(())
}

#[tokio::test]
async fn remote_fields_are_delegated() -> Result<(), Box<dyn std::error::Error>> {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "query": RemoteSchema::INTROSPECTION_QUERY })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "__schema": {
            "queryType": { "name": "Query" },
            "mutationType": null,
            "types": [{
                "name": "Query",
                "fields": [{
                    "name": "account",
                    "args": [{ "name": "id", "type": { "kind": "NON_NULL", "name": null, "ofType": { "kind": "SCALAR", "name": "ID", "ofType": null } } }]
                }]
            }]
        } } })))
        .expect(1)
        .mount(&remote)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "variables": { "id": "a-7" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "account": { "__typename": "Account", "owner": "Bea", "balance": 40 } }
        })))
        .expect(2)
        .mount(&remote)
        .await;

    let sdl = format!(
        r#"
        type Query {{ account(id: ID!): Account @gql(url: "{}/graphql", fieldName: "account") }}
        type Account {{ owner: String balance: Int }}
        "#,
        remote.uri()
    );
    let runtime = GatewayRuntime::new(GatewayServices::default());
    runtime.apply(group(vec![schema("accounts", &sdl)])).await?;

    for _ in 0..2 {
        let body = runtime
            .process_request(
                GraphQLRequest::new("query($id: ID!) { account(id: $id) { owner balance } }")
                    .with_variables(json!({ "id": "a-7" })),
            )
            .await?;
        assert_eq!(body["data"], json!({ "account": { "owner": "Bea", "balance": 40 } }));
    }
    Ok(())
}
