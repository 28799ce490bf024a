use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::exports::{ExportMap, ExportTracker};
use crate::policy::{PolicyQueryRunner, PolicyResultCache, PolicyScope};

/// State owned by a single GraphQL execution.
pub struct RequestScope {
    headers: HashMap<String, String>,
    jwt: OnceLock<Map<String, Value>>,
    pub exports: ExportTracker,
    pub policy_cache: PolicyResultCache,
    policy_queries: Option<Arc<dyn PolicyQueryRunner>>,
    ignore_policies: bool,
}

impl RequestScope {
    pub fn new(export_map: Arc<ExportMap>, headers: HashMap<String, String>) -> Self {
        RequestScope {
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            jwt: OnceLock::new(),
            exports: ExportTracker::new(export_map),
            policy_cache: PolicyResultCache::default(),
            policy_queries: None,
            ignore_policies: false,
        }
    }

    pub fn with_policy_queries(mut self, queries: Arc<dyn PolicyQueryRunner>) -> Self {
        self.policy_queries = Some(queries);
        self
    }

    /// Policy queries run in a scope where no gate is checked.
    pub fn ignoring_policies(mut self) -> Self {
        self.ignore_policies = true;
        self
    }

    pub fn ignores_policies(&self) -> bool {
        self.ignore_policies
    }

    pub fn policy_scope(&self) -> PolicyScope<'_> {
        PolicyScope {
            cache: &self.policy_cache,
            queries: self.policy_queries.as_ref(),
        }
    }

    /// Incoming headers, names lowercased.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Claims of the bearer token, decoded on first use.
    pub fn jwt(&self) -> &Map<String, Value> {
        self.jwt
            .get_or_init(|| decode_jwt_claims(self.header("authorization")))
    }
}

/// Decodes the claims of a `Bearer` token without checking its signature.
///
/// Anything that is not a well formed bearer JWT yields an empty claim set.
pub fn decode_jwt_claims(authorization: Option<&str>) -> Map<String, Value> {
    let Some(token) = authorization.and_then(|value| value.strip_prefix("Bearer ")) else {
        return Map::new();
    };
    let token = token.trim();

    let Ok(header) = decode_header(token) else {
        return Map::new();
    };
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<Map<String, Value>>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data.claims,
        Err(err) => {
            tracing::debug!(%err, "Ignoring undecodable bearer token");
            Map::new()
        }
    }
}
