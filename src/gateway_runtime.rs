//! Keeps exactly one [`ExecutableGateway`] current while resource snapshots arrive.
//!
//! Requests load the current gateway once and keep that `Arc` until they finish,
//! so a swap never affects work already in flight. A snapshot that fails to build
//! is logged and dropped; the previous gateway keeps serving.

use arc_swap::ArcSwapOption;
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::GraphQLRequest;
use crate::error::GatewayError;
use crate::executable_gateway::{ExecutableGateway, GatewayServices};
use crate::resources::ResourceGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Initializing,
    Ready,
    Disposed,
}

pub struct GatewayRuntime {
    services: GatewayServices,
    current: ArcSwapOption<ExecutableGateway>,
    // one snapshot is built and published at a time
    build_lock: Mutex<()>,
    state: watch::Sender<RuntimeState>,
    schema: watch::Sender<Option<Arc<str>>>,
    updates_task: StdMutex<Option<JoinHandle<()>>>,
}

impl GatewayRuntime {
    pub fn new(services: GatewayServices) -> Arc<Self> {
        Arc::new(GatewayRuntime {
            services,
            current: ArcSwapOption::empty(),
            build_lock: Mutex::new(()),
            state: watch::channel(RuntimeState::Initializing).0,
            schema: watch::channel(None).0,
            updates_task: StdMutex::new(None),
        })
    }

    /// Applies every snapshot received on `updates`, in arrival order.
    ///
    /// The task holds only a weak reference, so dropping the runtime ends it.
    pub fn spawn(self: &Arc<Self>, mut updates: mpsc::Receiver<Arc<ResourceGroup>>) {
        let runtime = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(group) = updates.recv().await {
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                // failures are logged by apply and leave the current gateway in place
                let _ = runtime.apply(group).await;
            }
            tracing::debug!("Resource update stream ended");
        });

        let previous = self
            .updates_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Builds `group` and, if that succeeds, makes it the current gateway.
    pub async fn apply(&self, group: Arc<ResourceGroup>) -> Result<(), GatewayError> {
        let _build = self.build_lock.lock().await;
        if self.state() == RuntimeState::Disposed {
            return Err(GatewayError::Disposed);
        }

        let etag = group.etag.clone();
        let gateway = match ExecutableGateway::build(group, &self.services) {
            Ok(gateway) => gateway,
            Err(err) => {
                tracing::error!(%err, ?etag, "Rejected resource group, keeping the current schema");
                return Err(err.into());
            }
        };

        let sdl = gateway.sdl();
        self.current.store(Some(Arc::new(gateway)));
        self.state.send_replace(RuntimeState::Ready);
        let schema_changed = self.schema.send_if_modified(|current| {
            if current.as_deref() == Some(&*sdl) {
                return false;
            }
            *current = Some(sdl.clone());
            true
        });

        tracing::info!(?etag, schema_changed, "Applied resource group");
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<ExecutableGateway>> {
        self.current.load_full()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Executes against the gateway current at call time and returns the
    /// serialized GraphQL response.
    pub async fn process_request(&self, request: GraphQLRequest) -> Result<Value, GatewayError> {
        let gateway = self.current().ok_or_else(|| match self.state() {
            RuntimeState::Disposed => GatewayError::Disposed,
            _ => GatewayError::NotReady,
        })?;

        let response = gateway.execute(request).await;
        Ok(serde_json::to_value(response)?)
    }

    /// Resolves once the first snapshot is live, or fails if the runtime is disposed first.
    pub async fn wait_until_ready(&self) -> Result<(), GatewayError> {
        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|state| *state != RuntimeState::Initializing)
            .await
            .map(|state| *state)
            .map_err(|_| GatewayError::Disposed)?;
        match reached {
            RuntimeState::Ready => Ok(()),
            _ => Err(GatewayError::Disposed),
        }
    }

    /// Notified with the printed SDL whenever a snapshot changes the schema text.
    pub fn schema_changes(&self) -> watch::Receiver<Option<Arc<str>>> {
        self.schema.subscribe()
    }

    /// Stops consuming updates. Requests holding a gateway finish normally.
    pub async fn dispose(&self) {
        let _build = self.build_lock.lock().await;
        if let Some(task) = self
            .updates_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.current.store(None);
        self.state.send_replace(RuntimeState::Disposed);
        tracing::info!("Gateway runtime disposed");
    }
}

impl Drop for GatewayRuntime {
    fn drop(&mut self) {
        if let Some(task) = self
            .updates_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
