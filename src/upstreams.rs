//! Per-snapshot outbound request decoration: origin rewrites, static headers and
//! ActiveDirectory client-credentials tokens.

use async_graphql::ErrorExtensions;
use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::error::BuildError;
use crate::request_context::RequestScope;
use crate::resources::{
    ActiveDirectoryCredentials, DefaultUpstream, ResourceGroup, Upstream, UpstreamAuth, UpstreamHeader,
};

pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
pub const UPSTREAM_TIMEOUT: &str = "UPSTREAM_TIMEOUT";

static INCOMING_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{incomingRequest\.headers\.([\w-]+)\}").expect("header pattern is valid")
});

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Invalid upstream url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Failed to acquire a token from {authority}: {message}")]
    Token { authority: String, message: String },

    #[error("Remote GraphQL service at {url} returned errors: {message}")]
    Remote { url: String, message: String },
}

impl UpstreamError {
    pub fn request(url: impl Into<String>, err: &reqwest::Error, timeout: Duration) -> Self {
        let url = url.into();
        if err.is_timeout() {
            UpstreamError::Timeout {
                url,
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            UpstreamError::Request {
                url,
                message: err.to_string(),
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            UpstreamError::Timeout { .. } => UPSTREAM_TIMEOUT,
            _ => UPSTREAM_ERROR,
        }
    }
}

impl ErrorExtensions for UpstreamError {
    fn extend(&self) -> async_graphql::Error {
        async_graphql::Error::new(self.to_string()).extend_with(|_, e| e.set("code", self.code()))
    }
}

/// Issues bearer tokens for upstreams protected by ActiveDirectory.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(
        &self,
        credentials: &ActiveDirectoryCredentials,
        resource: &str,
    ) -> Result<String, UpstreamError>;
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
}

/// OAuth2 client-credentials grant against `{authority}/oauth2/token`.
pub struct ClientCredentialsTokenProvider {
    client: reqwest::Client,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl ClientCredentialsTokenProvider {
    const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

    pub fn new(client: reqwest::Client) -> Self {
        ClientCredentialsTokenProvider {
            client,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone())
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn token(
        &self,
        credentials: &ActiveDirectoryCredentials,
        resource: &str,
    ) -> Result<String, UpstreamError> {
        let key = format!(
            "{}|{}|{}",
            credentials.authority, credentials.client_id, resource
        );
        if let Some(token) = self.cached(&key) {
            return Ok(token);
        }

        let token_error = |message: String| UpstreamError::Token {
            authority: credentials.authority.clone(),
            message,
        };
        let url = format!("{}/oauth2/token", credentials.authority.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("resource", resource),
            ])
            .send()
            .await
            .map_err(|e| token_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(token_error(format!("status {}", response.status())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| token_error(e.to_string()))?;

        // AD v1 endpoints send expires_in as a string
        let expires_in = match &body.expires_in {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .unwrap_or(0);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(Self::EXPIRY_MARGIN);

        tracing::debug!(authority = %credentials.authority, resource, "Acquired upstream token");
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                CachedToken {
                    token: body.access_token.clone(),
                    expires_at: Instant::now() + lifetime,
                },
            );
        Ok(body.access_token)
    }
}

/// The parts of an upstream that shape a request.
#[derive(Debug, Clone)]
struct UpstreamSettings {
    target_origin: Option<Url>,
    headers: Vec<UpstreamHeader>,
    auth: Option<UpstreamAuth>,
}

/// Lookup maps built once per resource snapshot.
#[derive(Clone)]
pub struct Upstreams {
    by_host: HashMap<String, UpstreamSettings>,
    default_upstream: Option<UpstreamSettings>,
    credentials_by_authority: HashMap<String, ActiveDirectoryCredentials>,
    tokens: Arc<dyn TokenProvider>,
}

impl Upstreams {
    pub fn from_resource_group(
        group: &ResourceGroup,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, BuildError> {
        let mut by_host = HashMap::new();
        for upstream in &group.upstreams {
            validate_upstream(upstream)?;
            let settings = UpstreamSettings {
                target_origin: parse_origin(upstream.target_origin.as_deref(), upstream)?,
                headers: upstream.headers.clone(),
                auth: upstream.auth.clone(),
            };
            for host in upstream.hosts() {
                by_host.insert(host.to_ascii_lowercase(), settings.clone());
            }
        }

        let default_upstream = match &group.default_upstream {
            Some(DefaultUpstream {
                target_origin,
                headers,
                auth,
            }) => Some(UpstreamSettings {
                target_origin: target_origin
                    .as_deref()
                    .map(Url::parse)
                    .transpose()
                    .map_err(|e| BuildError::Schema(format!("Invalid default upstream targetOrigin: {e}")))?,
                headers: headers.clone(),
                auth: auth.clone(),
            }),
            None => None,
        };

        let credentials_by_authority = group
            .upstream_client_credentials
            .iter()
            .map(|c| (c.active_directory.authority.clone(), c.active_directory.clone()))
            .collect();

        Ok(Upstreams {
            by_host,
            default_upstream,
            credentials_by_authority,
            tokens,
        })
    }

    /// Rewrites `url` and adds headers for whichever upstream serves its host.
    pub async fn apply(
        &self,
        url: &mut Url,
        headers: &mut HeaderMap,
        scope: Option<&RequestScope>,
    ) -> Result<(), UpstreamError> {
        let host = host_of(url);
        let Some(settings) = self.by_host.get(&host).or(self.default_upstream.as_ref()) else {
            // without any upstream configuration the caller's credentials travel along
            if let Some(authorization) = scope.and_then(|s| s.header("authorization")) {
                if let Ok(value) = HeaderValue::from_str(authorization) {
                    headers.entry(AUTHORIZATION).or_insert(value);
                }
            }
            return Ok(());
        };

        if let Some(origin) = &settings.target_origin {
            let mut rewritten = origin.clone();
            rewritten.set_path(url.path());
            rewritten.set_query(url.query());
            *url = rewritten;
        }

        for header in &settings.headers {
            let value = expand_incoming_headers(&header.value, scope);
            match (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %header.name, "Skipping invalid upstream header"),
            }
        }

        if let Some(auth) = &settings.auth {
            let authority = &auth.active_directory.authority;
            match self.credentials_by_authority.get(authority) {
                Some(credentials) => {
                    let token = self
                        .tokens
                        .token(credentials, &auth.active_directory.resource)
                        .await
                        .inspect_err(|err| {
                            tracing::error!(%err, "Failed to authenticate with ActiveDirectory")
                        })?;
                    let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                        UpstreamError::Token {
                            authority: authority.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    headers.insert(AUTHORIZATION, value);
                }
                None => tracing::debug!(%authority, "No client credentials for upstream authority"),
            }
        }
        Ok(())
    }
}

fn host_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

fn expand_incoming_headers(value: &str, scope: Option<&RequestScope>) -> String {
    INCOMING_HEADER
        .replace_all(value, |caps: &Captures<'_>| {
            scope
                .and_then(|s| s.header(&caps[1]))
                .unwrap_or_default()
                .to_string()
        })
        .into_owned()
}

/// An upstream must name its hosts exactly one way.
pub fn validate_upstream(upstream: &Upstream) -> Result<(), BuildError> {
    let invalid = |message: &str| BuildError::Upstream {
        upstream: upstream.metadata.clone(),
        message: message.to_string(),
    };
    match (&upstream.host, &upstream.source_hosts) {
        (Some(_), Some(_)) => Err(invalid("host and sourceHosts are mutually exclusive")),
        (None, None) => Err(invalid("one of host or sourceHosts is required")),
        (None, Some(hosts)) if hosts.is_empty() => Err(invalid("sourceHosts must not be empty")),
        _ => Ok(()),
    }
}

fn parse_origin(origin: Option<&str>, upstream: &Upstream) -> Result<Option<Url>, BuildError> {
    origin
        .map(|origin| {
            Url::parse(origin).map_err(|e| BuildError::Upstream {
                upstream: upstream.metadata.clone(),
                message: format!("invalid targetOrigin {origin}: {e}"),
            })
        })
        .transpose()
}
