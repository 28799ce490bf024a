pub mod config;
pub mod directives;
pub mod error;
pub mod executable_gateway;
pub mod exports;
pub mod gateway_runtime;
pub mod param_injection;
pub mod policy;
pub mod query_executor;
pub mod query_planner;
pub mod request_context;
pub mod resource_repository;
pub mod resource_updates;
pub mod resources;
pub mod schema_merger;
pub mod schema_registry;
pub mod upstreams;

pub use config::Config;
pub use error::{BuildError, GatewayError, RegistryError, RepositoryError, SchemaMergeError};
pub use executable_gateway::{ExecutableGateway, GatewayServices};
pub use gateway_runtime::{GatewayRuntime, RuntimeState};
pub use query_executor::HttpQueryExecutor;
pub use resource_repository::{FileSystemResourceRepository, InMemoryResourceRepository, ResourceRepository};
pub use resource_updates::{RefreshHandle, ResourceUpdateStream};
pub use resources::ResourceGroup;
pub use schema_registry::SchemaRegistry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName", alias = "operation_name")]
    pub operation_name: Option<String>,
    /// Incoming HTTP headers, available to `{incomingRequest.headers.*}` templates.
    #[serde(skip)]
    pub headers: HashMap<String, String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
