//! Write side of the resource store: every change is composed into a full schema
//! before it is persisted, so the gateway only ever polls buildable groups.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{RegistryError, RepositoryError};
use crate::executable_gateway::{ExecutableGateway, GatewayServices};
use crate::resource_repository::{FetchLatest, ResourceRepository};
use crate::resources::{
    Policy, PolicyDefinition, ResourceGroup, ResourceGroupDeletions, ResourceGroupUpdate, Schema,
    Upstream, UpstreamClientCredentials,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub success: bool,
}

pub struct SchemaRegistry {
    repository: Arc<dyn ResourceRepository>,
    services: GatewayServices,
    // read-modify-write of the stored group is serialized
    write_lock: Mutex<()>,
}

impl SchemaRegistry {
    pub fn new(repository: Arc<dyn ResourceRepository>) -> Self {
        Self::with_services(repository, GatewayServices::default())
    }

    pub fn with_services(repository: Arc<dyn ResourceRepository>, services: GatewayServices) -> Self {
        SchemaRegistry {
            repository,
            services,
            write_lock: Mutex::new(()),
        }
    }

    /// The stored group, or an empty one when nothing has been stored yet.
    pub async fn resource_group(&self) -> Result<ResourceGroup, RegistryError> {
        match self.repository.fetch_latest(None).await {
            Ok(FetchLatest {
                resource_group: Some(group),
                ..
            }) => Ok(group),
            Ok(_) | Err(RepositoryError::NotFound) => Ok(ResourceGroup::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Runs the full compose over `group` without storing anything.
    pub fn validate(&self, group: &ResourceGroup) -> Result<(), RegistryError> {
        ExecutableGateway::build(Arc::new(group.clone()), &self.services)?;
        Ok(())
    }

    async fn modify(
        &self,
        dry_run: bool,
        change: impl FnOnce(&ResourceGroup) -> ResourceGroup,
    ) -> Result<UpdateResult, RegistryError> {
        let _write = self.write_lock.lock().await;
        let next = change(&self.resource_group().await?);

        if let Err(err) = self.validate(&next) {
            tracing::warn!(%err, dry_run, "Rejected resource change");
            return Err(err);
        }
        if !dry_run {
            self.repository.update(next).await?;
            tracing::info!("Stored resource change");
        }
        Ok(UpdateResult { success: true })
    }

    pub async fn update_resource_group(
        &self,
        update: ResourceGroupUpdate,
        dry_run: bool,
    ) -> Result<UpdateResult, RegistryError> {
        self.modify(dry_run, |group| group.with_updates(update)).await
    }

    pub async fn update_schemas(&self, schemas: Vec<Schema>, dry_run: bool) -> Result<UpdateResult, RegistryError> {
        self.update_resource_group(
            ResourceGroupUpdate {
                schemas: Some(schemas),
                ..Default::default()
            },
            dry_run,
        )
        .await
    }

    pub async fn update_upstreams(
        &self,
        upstreams: Vec<Upstream>,
        dry_run: bool,
    ) -> Result<UpdateResult, RegistryError> {
        self.update_resource_group(
            ResourceGroupUpdate {
                upstreams: Some(upstreams),
                ..Default::default()
            },
            dry_run,
        )
        .await
    }

    pub async fn update_upstream_client_credentials(
        &self,
        credentials: Vec<UpstreamClientCredentials>,
        dry_run: bool,
    ) -> Result<UpdateResult, RegistryError> {
        self.update_resource_group(
            ResourceGroupUpdate {
                upstream_client_credentials: Some(credentials),
                ..Default::default()
            },
            dry_run,
        )
        .await
    }

    pub async fn update_policies(
        &self,
        policies: Vec<PolicyDefinition>,
        dry_run: bool,
    ) -> Result<UpdateResult, RegistryError> {
        self.update_resource_group(
            ResourceGroupUpdate {
                policies: Some(policies),
                ..Default::default()
            },
            dry_run,
        )
        .await
    }

    pub async fn update_base_policy(&self, policy: Policy, dry_run: bool) -> Result<UpdateResult, RegistryError> {
        self.update_resource_group(
            ResourceGroupUpdate {
                base_policy: Some(policy),
                ..Default::default()
            },
            dry_run,
        )
        .await
    }

    pub async fn delete_resources(
        &self,
        deletions: ResourceGroupDeletions,
        dry_run: bool,
    ) -> Result<UpdateResult, RegistryError> {
        self.modify(dry_run, |group| group.with_deletions(&deletions)).await
    }

    pub async fn validate_resource_group(&self, update: ResourceGroupUpdate) -> Result<UpdateResult, RegistryError> {
        self.update_resource_group(update, true).await
    }

    pub async fn validate_schemas(&self, schemas: Vec<Schema>) -> Result<UpdateResult, RegistryError> {
        self.update_schemas(schemas, true).await
    }

    pub async fn validate_upstreams(&self, upstreams: Vec<Upstream>) -> Result<UpdateResult, RegistryError> {
        self.update_upstreams(upstreams, true).await
    }

    pub async fn validate_upstream_client_credentials(
        &self,
        credentials: Vec<UpstreamClientCredentials>,
    ) -> Result<UpdateResult, RegistryError> {
        self.update_upstream_client_credentials(credentials, true).await
    }

    pub async fn validate_policies(&self, policies: Vec<PolicyDefinition>) -> Result<UpdateResult, RegistryError> {
        self.update_policies(policies, true).await
    }

    pub async fn validate_base_policy(&self, policy: Policy) -> Result<UpdateResult, RegistryError> {
        self.update_base_policy(policy, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_repository::InMemoryResourceRepository;
    use crate::resources::ResourceMetadata;
    use pretty_assertions::assert_eq;

    fn schema(name: &str, sdl: &str) -> Schema {
        Schema {
            metadata: ResourceMetadata::new("ns", name),
            schema: sdl.to_string(),
        }
    }

    fn registry() -> (SchemaRegistry, InMemoryResourceRepository) {
        let repository = InMemoryResourceRepository::new();
        (SchemaRegistry::new(Arc::new(repository.clone())), repository)
    }

    #[tokio::test]
    async fn valid_schemas_are_stored() {
        let (registry, _) = registry();
        let result = registry
            .update_schemas(vec![schema("a", "type Query { a: String }")], false)
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { success: true });

        registry
            .update_schemas(vec![schema("b", "type Query { b: String }")], false)
            .await
            .unwrap();
        let stored = registry.resource_group().await.unwrap();
        assert_eq!(stored.schemas.len(), 2);
    }

    #[tokio::test]
    async fn conflicting_schemas_are_rejected_and_not_stored() {
        let (registry, repository) = registry();
        registry
            .update_schemas(vec![schema("a", "type Query { a: String }")], false)
            .await
            .unwrap();

        let err = registry
            .update_schemas(vec![schema("b", "type Query { a: Int }")], false)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        let stored = repository.fetch_latest(None).await.unwrap().resource_group.unwrap();
        assert_eq!(stored.schemas.len(), 1);
    }

    #[tokio::test]
    async fn validation_never_persists() {
        let (registry, repository) = registry();
        registry
            .validate_schemas(vec![schema("a", "type Query { a: String }")])
            .await
            .unwrap();
        assert!(matches!(
            repository.fetch_latest(None).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn upstreams_need_one_host_form() {
        let (registry, _) = registry();
        let upstream = Upstream {
            metadata: ResourceMetadata::new("ns", "api"),
            host: None,
            source_hosts: None,
            target_origin: None,
            headers: vec![],
            auth: None,
        };
        assert!(registry.validate_upstreams(vec![upstream]).await.is_err());
    }

    #[tokio::test]
    async fn deletions_remove_matching_resources() {
        let (registry, _) = registry();
        registry
            .update_schemas(
                vec![
                    schema("a", "type Query { a: String }"),
                    schema("b", "type Query { b: String }"),
                ],
                false,
            )
            .await
            .unwrap();

        registry
            .delete_resources(
                ResourceGroupDeletions {
                    schemas: Some(vec![ResourceMetadata::new("ns", "a")]),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        let stored = registry.resource_group().await.unwrap();
        assert_eq!(stored.schemas, vec![schema("b", "type Query { b: String }")]);
    }
}
