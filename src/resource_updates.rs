use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

use crate::error::RepositoryError;
use crate::resource_repository::{FetchLatest, ResourceRepository};
use crate::resources::ResourceGroup;

/// Triggers an immediate fetch outside the polling schedule.
#[derive(Clone)]
pub struct RefreshHandle {
    notify: Arc<Notify>,
}

impl RefreshHandle {
    pub fn refresh(&self) {
        self.notify.notify_one();
    }
}

/// Ordered, de-duplicated resource snapshots read from a [`ResourceRepository`].
///
/// Fetch failures are logged and retried on the next tick; they never end the
/// stream. Polling stops when the receiving side is dropped.
pub struct ResourceUpdateStream {
    receiver: mpsc::Receiver<Arc<ResourceGroup>>,
    refresh: RefreshHandle,
}

impl ResourceUpdateStream {
    pub fn poll(repository: Arc<dyn ResourceRepository>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        let notify = Arc::new(Notify::new());
        tokio::spawn(poll_repository(repository, interval, sender, notify.clone()));
        ResourceUpdateStream {
            receiver,
            refresh: RefreshHandle { notify },
        }
    }

    pub async fn next(&mut self) -> Option<Arc<ResourceGroup>> {
        self.receiver.recv().await
    }

    pub fn refresh_handle(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    pub fn refresh(&self) {
        self.refresh.refresh();
    }

    /// The raw receiver, for [`GatewayRuntime::spawn`](crate::GatewayRuntime::spawn).
    pub fn split(self) -> (mpsc::Receiver<Arc<ResourceGroup>>, RefreshHandle) {
        (self.receiver, self.refresh)
    }
}

async fn poll_repository(
    repository: Arc<dyn ResourceRepository>,
    interval: Duration,
    sender: mpsc::Sender<Arc<ResourceGroup>>,
    refresh: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut etag: Option<String> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = refresh.notified() => {}
            _ = sender.closed() => break,
        }

        match repository.fetch_latest(etag.as_deref()).await {
            Ok(FetchLatest {
                is_new: true,
                resource_group: Some(group),
                etag: latest,
            }) => {
                if latest.is_some() && latest == etag {
                    continue;
                }
                tracing::info!(etag = ?latest, "Fetched new resource group");
                etag = latest;
                if sender.send(Arc::new(group)).await.is_err() {
                    break;
                }
            }
            Ok(_) => tracing::trace!(?etag, "Resource group unchanged"),
            Err(RepositoryError::NotFound) => tracing::debug!("No resource group stored yet"),
            Err(err) => tracing::warn!(%err, "Failed to fetch resource group, retrying"),
        }
    }
    tracing::debug!("Resource polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_repository::InMemoryResourceRepository;
    use crate::resources::{ResourceMetadata, Schema};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn group(sdl: &str) -> ResourceGroup {
        ResourceGroup {
            schemas: vec![Schema {
                metadata: ResourceMetadata::new("ns", "schema"),
                schema: sdl.to_string(),
            }],
            ..Default::default()
        }
    }

    /// Fails every other call.
    struct FlakyRepository {
        inner: InMemoryResourceRepository,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceRepository for FlakyRepository {
        async fn fetch_latest(&self, current_etag: Option<&str>) -> Result<FetchLatest, RepositoryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(RepositoryError::Io(std::io::Error::other("store unavailable")));
            }
            self.inner.fetch_latest(current_etag).await
        }

        async fn update(&self, resource_group: ResourceGroup) -> Result<(), RepositoryError> {
            self.inner.update(resource_group).await
        }
    }

    async fn next(stream: &mut ResourceUpdateStream) -> Option<Arc<ResourceGroup>> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn emits_each_version_once() {
        let repository = InMemoryResourceRepository::with_resource_group(group("type Query { a: String }"));
        let mut stream = ResourceUpdateStream::poll(Arc::new(repository.clone()), Duration::from_millis(20));

        let first = next(&mut stream).await.unwrap();
        assert_eq!(first.schemas[0].schema, "type Query { a: String }");

        // unchanged polls emit nothing
        let quiet = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(quiet.is_err());

        repository.update(group("type Query { b: String }")).await.unwrap();
        stream.refresh();
        let second = next(&mut stream).await.unwrap();
        assert_eq!(second.schemas[0].schema, "type Query { b: String }");
    }

    #[tokio::test]
    async fn fetch_failures_do_not_end_the_stream() {
        let repository = FlakyRepository {
            inner: InMemoryResourceRepository::with_resource_group(group("type Query { a: String }")),
            calls: AtomicUsize::new(0),
        };
        let mut stream = ResourceUpdateStream::poll(Arc::new(repository), Duration::from_millis(10));

        assert!(next(&mut stream).await.is_some());
    }
}
