use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RepositoryError;
use crate::resources::ResourceGroup;

/// Result of asking a store for its latest resource group.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchLatest {
    pub is_new: bool,
    /// Absent when the caller's etag is still current.
    pub resource_group: Option<ResourceGroup>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn fetch_latest(&self, current_etag: Option<&str>) -> Result<FetchLatest, RepositoryError>;

    /// Replaces the stored group.
    async fn update(&self, resource_group: ResourceGroup) -> Result<(), RepositoryError>;
}

struct Versioned {
    version: u64,
    group: ResourceGroup,
}

#[derive(Clone, Default)]
pub struct InMemoryResourceRepository {
    stored: Arc<RwLock<Option<Versioned>>>,
}

impl InMemoryResourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource_group(group: ResourceGroup) -> Self {
        InMemoryResourceRepository {
            stored: Arc::new(RwLock::new(Some(Versioned { version: 1, group }))),
        }
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn fetch_latest(&self, current_etag: Option<&str>) -> Result<FetchLatest, RepositoryError> {
        let stored = self.stored.read().await;
        let stored = stored.as_ref().ok_or(RepositoryError::NotFound)?;
        let etag = format!("v{}", stored.version);
        Ok(latest(etag, current_etag, || stored.group.clone()))
    }

    async fn update(&self, resource_group: ResourceGroup) -> Result<(), RepositoryError> {
        let mut stored = self.stored.write().await;
        let version = stored.as_ref().map_or(1, |s| s.version + 1);
        *stored = Some(Versioned {
            version,
            group: resource_group,
        });
        Ok(())
    }
}

fn latest(etag: String, current_etag: Option<&str>, group: impl FnOnce() -> ResourceGroup) -> FetchLatest {
    if current_etag == Some(etag.as_str()) {
        return FetchLatest {
            is_new: false,
            resource_group: None,
            etag: Some(etag),
        };
    }
    let mut group = group();
    group.etag = Some(etag.clone());
    FetchLatest {
        is_new: true,
        resource_group: Some(group),
        etag: Some(etag),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

/// A single JSON (or `.yaml`/`.yml`) file. The etag is a hash of its content.
#[derive(Debug, Clone)]
pub struct FileSystemResourceRepository {
    path: PathBuf,
}

impl FileSystemResourceRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSystemResourceRepository { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> Format {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

fn content_etag(content: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl ResourceRepository for FileSystemResourceRepository {
    async fn fetch_latest(&self, current_etag: Option<&str>) -> Result<FetchLatest, RepositoryError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        let etag = content_etag(&content);
        if current_etag == Some(etag.as_str()) {
            return Ok(latest(etag, current_etag, ResourceGroup::default));
        }

        let group: ResourceGroup = match self.format() {
            Format::Json => serde_json::from_slice(&content)?,
            Format::Yaml => serde_yaml::from_slice(&content)?,
        };
        tracing::debug!(path = %self.path.display(), %etag, "Read resource group");
        Ok(latest(etag, current_etag, || group))
    }

    async fn update(&self, mut resource_group: ResourceGroup) -> Result<(), RepositoryError> {
        resource_group.etag = None;
        let content = match self.format() {
            Format::Json => serde_json::to_vec_pretty(&resource_group)?,
            Format::Yaml => serde_yaml::to_string(&resource_group)?.into_bytes(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}
