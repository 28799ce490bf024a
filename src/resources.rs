use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Identity key of a resource: unique per kind within a [`ResourceGroup`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub namespace: String,
    pub name: String,
}

impl ResourceMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceMetadata {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub trait Resource {
    fn metadata(&self) -> &ResourceMetadata;
}

macro_rules! impl_resource {
    ($($ty:ty),*) => {
        $(impl Resource for $ty {
            fn metadata(&self) -> &ResourceMetadata {
                &self.metadata
            }
        })*
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub metadata: ResourceMetadata,
    pub schema: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    ActiveDirectory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDirectoryAuth {
    pub authority: String,
    pub resource: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamAuth {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub active_directory: ActiveDirectoryAuth,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamHeader {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub metadata: ResourceMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hosts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<UpstreamHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<UpstreamAuth>,
}

impl Upstream {
    /// Every host this upstream answers for.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.host
            .iter()
            .chain(self.source_hosts.iter().flatten())
            .map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultUpstream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<UpstreamHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<UpstreamAuth>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDirectoryCredentials {
    pub authority: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamClientCredentials {
    pub metadata: ResourceMetadata,
    pub auth_type: AuthType,
    pub active_directory: ActiveDirectoryCredentials,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Opa,
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::Opa => f.write_str("opa"),
        }
    }
}

/// Declared argument of a policy: a GraphQL type name plus optional default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyArgDefinition {
    #[serde(rename = "type")]
    pub arg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub optional: bool,
}

impl PolicyArgDefinition {
    pub fn is_non_null(&self) -> bool {
        self.arg_type.trim_end().ends_with('!')
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
    pub metadata: ResourceMetadata,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, PolicyArgDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_override_base_policy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<PolicyQuery>,
}

/// A GraphQL query run against the gateway before the policy is evaluated.
///
/// String variables may reference the policy's arguments as `{args.name}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyQuery {
    pub gql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
}

/// A reference to a policy definition, as written in `@policy` or `basePolicy`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl Policy {
    pub fn metadata(&self) -> ResourceMetadata {
        ResourceMetadata::new(self.namespace.clone(), self.name.clone())
    }
}

impl_resource!(Schema, Upstream, UpstreamClientCredentials, PolicyDefinition);

/// A snapshot of every resource the gateway composes from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub schemas: Vec<Schema>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub upstream_client_credentials: Vec<UpstreamClientCredentials>,
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_policy: Option<Policy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_query_policy: Option<Policy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_upstream: Option<DefaultUpstream>,
}

/// Partial group: every present list is merged into the target by identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupUpdate {
    pub schemas: Option<Vec<Schema>>,
    pub upstreams: Option<Vec<Upstream>>,
    pub upstream_client_credentials: Option<Vec<UpstreamClientCredentials>>,
    pub policies: Option<Vec<PolicyDefinition>>,
    pub base_policy: Option<Policy>,
    pub introspection_query_policy: Option<Policy>,
    pub default_upstream: Option<DefaultUpstream>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupDeletions {
    pub schemas: Option<Vec<ResourceMetadata>>,
    pub upstreams: Option<Vec<ResourceMetadata>>,
    pub upstream_client_credentials: Option<Vec<ResourceMetadata>>,
    pub policies: Option<Vec<ResourceMetadata>>,
    #[serde(default)]
    pub base_policy: bool,
    #[serde(default)]
    pub introspection_query_policy: bool,
    #[serde(default)]
    pub default_upstream: bool,
}

/// Replaces resources whose metadata matches an update, appending the rest.
pub fn apply_resource_updates<R: Resource>(resources: &mut Vec<R>, updates: Vec<R>) {
    for update in updates {
        match resources
            .iter_mut()
            .find(|existing| existing.metadata() == update.metadata())
        {
            Some(existing) => *existing = update,
            None => resources.push(update),
        }
    }
}

pub fn apply_resource_deletions<R: Resource>(resources: &mut Vec<R>, deletions: &[ResourceMetadata]) {
    resources.retain(|resource| !deletions.contains(resource.metadata()));
}

impl ResourceGroup {
    pub fn with_updates(&self, update: ResourceGroupUpdate) -> ResourceGroup {
        let mut next = self.clone();
        if let Some(schemas) = update.schemas {
            apply_resource_updates(&mut next.schemas, schemas);
        }
        if let Some(upstreams) = update.upstreams {
            apply_resource_updates(&mut next.upstreams, upstreams);
        }
        if let Some(credentials) = update.upstream_client_credentials {
            apply_resource_updates(&mut next.upstream_client_credentials, credentials);
        }
        if let Some(policies) = update.policies {
            apply_resource_updates(&mut next.policies, policies);
        }
        if update.base_policy.is_some() {
            next.base_policy = update.base_policy;
        }
        if update.introspection_query_policy.is_some() {
            next.introspection_query_policy = update.introspection_query_policy;
        }
        if update.default_upstream.is_some() {
            next.default_upstream = update.default_upstream;
        }
        next
    }

    pub fn with_deletions(&self, deletions: &ResourceGroupDeletions) -> ResourceGroup {
        let mut next = self.clone();
        if let Some(schemas) = &deletions.schemas {
            apply_resource_deletions(&mut next.schemas, schemas);
        }
        if let Some(upstreams) = &deletions.upstreams {
            apply_resource_deletions(&mut next.upstreams, upstreams);
        }
        if let Some(credentials) = &deletions.upstream_client_credentials {
            apply_resource_deletions(&mut next.upstream_client_credentials, credentials);
        }
        if let Some(policies) = &deletions.policies {
            apply_resource_deletions(&mut next.policies, policies);
        }
        if deletions.base_policy {
            next.base_policy = None;
        }
        if deletions.introspection_query_policy {
            next.introspection_query_policy = None;
        }
        if deletions.default_upstream {
            next.default_upstream = None;
        }
        next
    }

    pub fn policy_definition(&self, namespace: &str, name: &str) -> Option<&PolicyDefinition> {
        self.policies
            .iter()
            .find(|p| p.metadata.namespace == namespace && p.metadata.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema(namespace: &str, name: &str, sdl: &str) -> Schema {
        Schema {
            metadata: ResourceMetadata::new(namespace, name),
            schema: sdl.to_string(),
        }
    }

    #[test]
    fn updates_replace_matches_and_append_the_rest() {
        let group = ResourceGroup {
            schemas: vec![
                schema("ns", "a", "type Query { a: String }"),
                schema("ns", "b", "type Query { b: String }"),
            ],
            ..Default::default()
        };

        let next = group.with_updates(ResourceGroupUpdate {
            schemas: Some(vec![
                schema("ns", "b", "type Query { b: Int }"),
                schema("other", "a", "type Query { c: String }"),
            ]),
            ..Default::default()
        });

        let sdl: Vec<_> = next.schemas.iter().map(|s| s.schema.as_str()).collect();
        assert_eq!(
            sdl,
            vec![
                "type Query { a: String }",
                "type Query { b: Int }",
                "type Query { c: String }"
            ]
        );
        // the source snapshot is never mutated
        assert_eq!(group.schemas.len(), 2);
    }

    #[test]
    fn absent_update_lists_leave_resources_untouched() {
        let group = ResourceGroup {
            schemas: vec![schema("ns", "a", "type Query { a: String }")],
            base_policy: Some(Policy {
                namespace: "ns".into(),
                name: "base".into(),
                args: None,
            }),
            ..Default::default()
        };

        let next = group.with_updates(ResourceGroupUpdate::default());
        assert_eq!(next, group);
    }

    #[test]
    fn deletions_remove_matches_and_clear_singletons() {
        let group = ResourceGroup {
            schemas: vec![
                schema("ns", "a", "type Query { a: String }"),
                schema("ns", "b", "type Query { b: String }"),
            ],
            base_policy: Some(Policy {
                namespace: "ns".into(),
                name: "base".into(),
                args: None,
            }),
            default_upstream: Some(DefaultUpstream {
                target_origin: Some("http://fallback".into()),
                headers: vec![],
                auth: None,
            }),
            ..Default::default()
        };

        let next = group.with_deletions(&ResourceGroupDeletions {
            schemas: Some(vec![
                ResourceMetadata::new("ns", "a"),
                ResourceMetadata::new("ns", "missing"),
            ]),
            base_policy: true,
            default_upstream: true,
            ..Default::default()
        });

        assert_eq!(next.schemas, vec![schema("ns", "b", "type Query { b: String }")]);
        assert_eq!(next.base_policy, None);
        assert_eq!(next.default_upstream, None);
    }

    #[test]
    fn resource_group_reads_camel_case_documents() {
        let group: ResourceGroup = serde_json::from_value(json!({
            "schemas": [{ "metadata": { "namespace": "ns", "name": "s" }, "schema": "type Query { a: String }" }],
            "upstreams": [{
                "metadata": { "namespace": "ns", "name": "u" },
                "sourceHosts": ["api.example.com"],
                "targetOrigin": "http://localhost:9000",
                "auth": { "type": "ActiveDirectory", "activeDirectory": { "authority": "https://login", "resource": "res" } }
            }],
            "policies": [{
                "metadata": { "namespace": "ns", "name": "p" },
                "type": "opa",
                "code": "allow = true",
                "args": { "role": { "type": "String!", "default": "admin" } },
                "shouldOverrideBasePolicy": true,
                "query": { "gql": "query($role: String) { members(role: $role) }", "variables": { "role": "{args.role}" } }
            }],
            "basePolicy": { "namespace": "ns", "name": "p" }
        }))
        .unwrap();

        assert_eq!(group.upstreams[0].hosts().collect::<Vec<_>>(), vec!["api.example.com"]);
        let policy = group.policy_definition("ns", "p").unwrap();
        assert_eq!(policy.should_override_base_policy, Some(true));
        assert!(policy.args.as_ref().unwrap()["role"].is_non_null());
        let query = policy.query.as_ref().unwrap();
        assert_eq!(query.variables.as_ref().unwrap()["role"], json!("{args.role}"));
        assert_eq!(group.upstream_client_credentials, vec![]);
    }
}
