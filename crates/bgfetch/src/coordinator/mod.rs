//! # Download Coordinator
//!
//! The coordinator owns the transfer and waiter registries. All of their
//! mutations happen on a single actor task fed by a command channel and by
//! the engine's event channel, so "check cache, check registry, begin
//! transfer" can never interleave between two operations.
//!
//! [`Coordinator`] itself is a cheap, cloneable handle to that actor.

mod actor;
mod dispatch;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{LocalCacheStore, derive_key};
use crate::config::CoordinatorConfig;
use crate::engine::{TransferEngine, TransferId};
use crate::error::CoordinatorError;
use crate::lifecycle::{ClockWatcher, LifecycleEvent};
use crate::operation::{DownloadOperation, OperationId, ProgressObserver};
use crate::request::{DownloadRequest, ResourceId};

use actor::Actor;
use dispatch::CallbackDispatcher;

#[derive(Debug)]
pub(crate) enum Command {
    Start(DownloadOperation),
    Cancel(OperationId),
    Lifecycle(LifecycleEvent),
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    Shutdown,
}

/// A transfer as seen in a [`RegistrySnapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub resource: ResourceId,
    pub transfer: TransferId,
    pub bytes_received: u64,
    pub bytes_expected: u64,
    pub waiters: usize,
}

/// Point-in-time view of the coordinator's registries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Whether startup reconciliation has completed
    pub reconciled: bool,
    /// Operations parked until reconciliation completes
    pub parked: usize,
    pub transfers: Vec<TransferInfo>,
}

impl RegistrySnapshot {
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn transfer_for(&self, resource: &ResourceId) -> Option<&TransferInfo> {
        self.transfers.iter().find(|info| &info.resource == resource)
    }
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    runtime: Handle,
    store: LocalCacheStore,
    config: CoordinatorConfig,
    next_operation: AtomicU64,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create the cache directory, optionally purge it, and spawn the actor
    /// on the current tokio runtime.
    ///
    /// Reconciliation against `engine` starts immediately. Operations
    /// submitted before it finishes are parked and released in order.
    pub async fn start(
        engine: Arc<dyn TransferEngine>,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError> {
        let runtime = Handle::try_current().map_err(|_| CoordinatorError::NoRuntime)?;

        let store = LocalCacheStore::new(config.resolved_cache_dir());
        store.ensure_initialized().await?;

        if config.purge_on_startup {
            match store.purge_all().await {
                Ok(removed) => debug!(removed, "Purged cache on startup"),
                Err(e) => warn!(error = %e, "Startup cache purge failed"),
            }
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let dispatcher = CallbackDispatcher::spawn(&runtime);
        let actor = Actor::new(
            engine,
            store.clone(),
            config.clone(),
            dispatcher,
            command_rx,
        );
        runtime.spawn(actor.run());

        if !config.clock_check_interval.is_zero() {
            let weak = commands.downgrade();
            ClockWatcher::new(config.clock_check_interval, config.clock_drift_threshold).spawn(
                &runtime,
                move || match weak.upgrade() {
                    Some(commands) => commands
                        .send(Command::Lifecycle(LifecycleEvent::SignificantTimeChange))
                        .is_ok(),
                    None => false,
                },
            );
        }

        info!(cache_dir = ?store.dir(), "Download coordinator started");

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                runtime,
                store,
                config,
                next_operation: AtomicU64::new(1),
            }),
        })
    }

    /// Create an operation and start it right away
    pub fn perform<F>(
        &self,
        request: DownloadRequest,
        dependencies: Vec<DownloadOperation>,
        progress_observer: Option<ProgressObserver>,
        completion: F,
    ) -> DownloadOperation
    where
        F: FnOnce(&DownloadOperation) + Send + 'static,
    {
        let operation =
            DownloadOperation::new(self, request, dependencies, progress_observer, completion);
        operation.start();
        operation
    }

    /// Deliver a process lifecycle signal. Both signals trigger cleanup of
    /// unreferenced cached files.
    pub fn notify_lifecycle(&self, event: LifecycleEvent) {
        if self.send(Command::Lifecycle(event)).is_err() {
            debug!(?event, "Lifecycle event after shutdown ignored");
        }
    }

    /// Where the cached file for `url` lives, whether or not it exists yet
    pub fn local_file_path(&self, url: &Url) -> PathBuf {
        self.inner
            .store
            .path_for(&derive_key(&ResourceId::from_url(url)))
    }

    pub fn cache_store(&self) -> &LocalCacheStore {
        &self.inner.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Current contents of the registries
    pub async fn snapshot(&self) -> Result<RegistrySnapshot, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Cancel every transfer and operation and stop the actor. Later
    /// operations fail to start.
    pub fn shutdown(&self) {
        if self.send(Command::Shutdown).is_err() {
            debug!("Coordinator already shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.commands.is_closed()
    }

    pub(crate) fn submit(&self, operation: DownloadOperation) -> Result<(), CoordinatorError> {
        self.send(Command::Start(operation))
    }

    pub(crate) fn request_cancel(&self, operation: OperationId) {
        if self.send(Command::Cancel(operation)).is_err() {
            debug!(operation = %operation, "Cancel after shutdown ignored");
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn next_operation_id(&self) -> OperationId {
        OperationId(self.inner.next_operation.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| CoordinatorError::Closed)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("cache_dir", &self.inner.store.dir())
            .field("closed", &self.is_closed())
            .finish()
    }
}
