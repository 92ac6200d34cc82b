use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::dispatch::CallbackDispatcher;
use super::registry::{ActiveTransfer, Registry, Unregistered};
use super::{Command, RegistrySnapshot, TransferInfo};
use crate::cache::{LocalCacheStore, derive_key};
use crate::config::CoordinatorConfig;
use crate::engine::{
    TransferEngine, TransferEvent, TransferEventKind, TransferEventSink, TransferHandle,
    TransferSnapshot, progress_fraction,
};
use crate::error::{EngineError, OperationError};
use crate::lifecycle::LifecycleEvent;
use crate::operation::{DownloadOperation, OperationId, OperationState};
use crate::request::ResourceId;

type Inventory = Result<Result<Vec<TransferSnapshot>, EngineError>, JoinError>;

/// Owner of the registries. Runs until shut down or until every
/// [`Coordinator`](super::Coordinator) handle is gone.
pub(crate) struct Actor {
    engine: Arc<dyn TransferEngine>,
    store: LocalCacheStore,
    config: CoordinatorConfig,
    dispatcher: CallbackDispatcher,
    registry: Registry<DownloadOperation>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    /// Engine events received before reconciliation completed
    deferred_events: Vec<TransferEvent>,
    /// Cleanup requested before reconciliation completed
    deferred_cleanup: Option<LifecycleEvent>,
}

impl Actor {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        store: LocalCacheStore,
        config: CoordinatorConfig,
        dispatcher: CallbackDispatcher,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            engine,
            store,
            config,
            dispatcher,
            registry: Registry::new(),
            commands,
            events_tx,
            events,
            deferred_events: Vec::new(),
            deferred_cleanup: None,
        }
    }

    fn sink(&self) -> TransferEventSink {
        TransferEventSink::new(self.events_tx.clone())
    }

    pub async fn run(mut self) {
        let engine = Arc::clone(&self.engine);
        let sink = self.sink();
        let mut inventory = tokio::spawn(async move { engine.list_active_transfers(sink).await });
        let mut reconciling = true;

        loop {
            tokio::select! {
                biased;

                result = &mut inventory, if reconciling => {
                    reconciling = false;
                    self.reconcile(result).await;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) => {
                            self.shutdown();
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All coordinator handles dropped");
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(event) = self.events.recv() => {
                    if self.registry.is_reconciled() {
                        self.handle_event(event).await;
                    } else {
                        self.deferred_events.push(event);
                    }
                }
            }
        }

        if reconciling {
            inventory.abort();
        }
        info!("Download coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(operation) => self.start_operation(operation).await,
            Command::Cancel(id) => self.cancel_operation(id),
            Command::Lifecycle(event) if !self.registry.is_reconciled() => {
                // Recovered transfers are not known yet
                debug!(?event, "Deferring cleanup until reconciliation completes");
                self.deferred_cleanup = Some(event);
            }
            Command::Lifecycle(event) => self.cleanup(event).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the loop
            Command::Shutdown => {}
        }
    }

    async fn reconcile(&mut self, inventory: Inventory) {
        let snapshots = match inventory {
            Ok(Ok(snapshots)) => snapshots,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list active transfers, continuing with none");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "Transfer inventory task failed, continuing with none");
                Vec::new()
            }
        };

        let mut recovered = 0;
        for snapshot in snapshots {
            if let Some(e) = &snapshot.error {
                debug!(transfer = %snapshot.id, error = %e, "Skipping failed transfer");
                continue;
            }
            if let Some(existing) = self.registry.transfer(&snapshot.resource) {
                warn!(
                    transfer = %snapshot.id,
                    kept = %existing.handle.id,
                    url = %snapshot.resource,
                    "Duplicate transfer for resource, cancelling it"
                );
                self.engine.cancel(snapshot.id);
                continue;
            }

            let mut active = ActiveTransfer::new(TransferHandle {
                id: snapshot.id,
                resource: snapshot.resource.clone(),
            });
            active.received = snapshot.bytes_received;
            active.expected = snapshot.bytes_expected;
            debug!(transfer = %snapshot.id, url = %snapshot.resource, "Recovered transfer");
            self.registry.insert_transfer(active);
            recovered += 1;
        }

        self.registry.mark_reconciled();
        let parked = self.registry.release_parked();
        info!(
            recovered,
            parked = parked.len(),
            "Reconciliation complete"
        );

        for id in parked {
            if let Some(operation) = self.registry.operation(id).cloned() {
                self.resolve(operation).await;
            }
        }

        for event in std::mem::take(&mut self.deferred_events) {
            self.handle_event(event).await;
        }

        if let Some(event) = self.deferred_cleanup.take() {
            self.cleanup(event).await;
        }
    }

    async fn start_operation(&mut self, operation: DownloadOperation) {
        if operation.is_cancelled() {
            debug!(operation = %operation.id(), "Operation cancelled before start");
            self.finish(&operation, Err(OperationError::CanceledBeforeStart));
            return;
        }

        if !self.transition(&operation, OperationState::Registered) {
            return;
        }
        self.registry.register(
            operation.id(),
            operation.resource_id().clone(),
            operation.clone(),
        );

        if !self.registry.is_reconciled() {
            if self.transition(&operation, OperationState::AwaitingReconciliation) {
                debug!(operation = %operation.id(), "Parked until reconciliation completes");
                self.registry.park(operation.id());
            }
            return;
        }

        self.resolve(operation).await;
    }

    /// Satisfy a registered operation from the cache, an existing transfer or
    /// a new one
    async fn resolve(&mut self, operation: DownloadOperation) {
        let resource = operation.resource_id().clone();
        let key = derive_key(&resource);

        if self.store.exists(&key).await {
            debug!(operation = %operation.id(), url = %resource, "Cache hit");
            self.registry.unregister(operation.id());
            if self.transition(&operation, OperationState::CacheHit) {
                self.progress(&operation, 1.0);
                self.finish(&operation, Ok(self.store.path_for(&key)));
            }
            return;
        }

        if let Some(active) = self.registry.transfer(&resource) {
            let fraction = active.fraction();
            debug!(operation = %operation.id(), transfer = %active.handle.id, "Attaching to active transfer");
            if self.transition(&operation, OperationState::AttachedToTransfer) {
                if let Some(fraction) = fraction {
                    self.progress(&operation, fraction);
                }
            }
            return;
        }

        match self.engine.begin(operation.request(), self.sink()) {
            Ok(handle) => {
                info!(operation = %operation.id(), transfer = %handle.id, url = %resource, "Began transfer");
                self.registry.insert_transfer(ActiveTransfer::new(handle));
                self.transition(&operation, OperationState::AttachedToTransfer);
            }
            Err(e) => {
                warn!(operation = %operation.id(), url = %resource, error = %e, "Failed to begin transfer");
                self.registry.unregister(operation.id());
                self.finish(
                    &operation,
                    Err(OperationError::TransferInitializationFailed(e)),
                );
            }
        }
    }

    fn cancel_operation(&mut self, id: OperationId) {
        let Some(Unregistered {
            resource,
            waiter: operation,
            remaining,
        }) = self.registry.unregister(id)
        else {
            debug!(operation = %id, "Cancel for operation that is not registered");
            return;
        };

        debug!(operation = %id, remaining, "Operation cancelled");
        self.finish(&operation, Err(OperationError::Cancelled));

        if remaining > 0 {
            return;
        }
        if let Some(active) = self.registry.remove_transfer(&resource) {
            info!(transfer = %active.handle.id, url = %resource, "No waiters left, cancelling transfer");
            self.engine.cancel(active.handle.id);
            self.reset_session_if_idle();
        }
    }

    async fn handle_event(&mut self, event: TransferEvent) {
        if !self.registry.matches(&event.resource, event.transfer) {
            self.handle_stale_event(event).await;
            return;
        }

        let resource = event.resource;
        match event.kind {
            TransferEventKind::Progress { received, expected } => {
                if let Some(active) = self.registry.transfer_mut(&resource) {
                    active.received = received;
                    active.expected = expected;
                }
                if let Some(fraction) = progress_fraction(received, expected) {
                    for operation in self.registry.waiters_of(&resource) {
                        self.progress(&operation, fraction);
                    }
                }
            }
            TransferEventKind::Completed { temp_file } => {
                let outcome = self
                    .store
                    .publish(&temp_file, &derive_key(&resource))
                    .await
                    .map_err(OperationError::PublishFailed);
                if let Err(e) = &outcome {
                    error!(transfer = %event.transfer, url = %resource, error = %e, "Failed to publish download");
                    discard(&temp_file).await;
                } else {
                    info!(transfer = %event.transfer, url = %resource, "Transfer completed");
                }
                self.finish_transfer(&resource, outcome);
            }
            TransferEventKind::Failed { error } => {
                warn!(transfer = %event.transfer, url = %resource, error = %error, "Transfer failed");
                self.finish_transfer(&resource, Err(OperationError::TransferFailed(error)));
            }
        }
    }

    /// Events of transfers no longer in the registry, typically ones that
    /// were cancelled. A finished download is still kept if no other
    /// transfer is working on the resource.
    async fn handle_stale_event(&mut self, event: TransferEvent) {
        let TransferEventKind::Completed { temp_file } = event.kind else {
            return;
        };

        if self.registry.transfer(&event.resource).is_some() {
            debug!(transfer = %event.transfer, "Discarding output of superseded transfer");
            discard(&temp_file).await;
            return;
        }

        match self
            .store
            .publish(&temp_file, &derive_key(&event.resource))
            .await
        {
            Ok(path) => debug!(transfer = %event.transfer, path = ?path, "Published untracked transfer"),
            Err(e) => {
                warn!(transfer = %event.transfer, error = %e, "Failed to publish untracked transfer");
                discard(&temp_file).await;
            }
        }
    }

    /// Deliver one outcome to every waiter and forget the transfer
    fn finish_transfer(&mut self, resource: &ResourceId, outcome: Result<PathBuf, OperationError>) {
        let waiters = self.registry.take_waiters(resource);
        for operation in &waiters {
            self.finish(operation, outcome.clone());
        }
        self.registry.remove_transfer(resource);
        debug!(url = %resource, waiters = waiters.len(), "Transfer finished");
        self.reset_session_if_idle();
    }

    async fn cleanup(&mut self, event: LifecycleEvent) {
        let keep = self.registry.referenced_keys();
        match self.store.purge_except(&keep).await {
            Ok(removed) => info!(?event, removed, kept = keep.len(), "Cleaned up cache"),
            Err(e) => warn!(?event, error = %e, "Cache cleanup failed"),
        }
    }

    fn shutdown(&mut self) {
        let (transfers, operations) = self.registry.drain();
        for active in transfers {
            self.engine.cancel(active.handle.id);
        }
        for operation in &operations {
            self.finish(operation, Err(OperationError::Cancelled));
        }
        info!(
            operations = operations.len(),
            "Download coordinator shutting down"
        );
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let mut transfers: Vec<_> = self
            .registry
            .transfers()
            .map(|active| TransferInfo {
                resource: active.handle.resource.clone(),
                transfer: active.handle.id,
                bytes_received: active.received,
                bytes_expected: active.expected,
                waiters: self.registry.waiter_count(&active.handle.resource),
            })
            .collect();
        transfers.sort_by(|a, b| a.transfer.cmp(&b.transfer));

        RegistrySnapshot {
            reconciled: self.registry.is_reconciled(),
            parked: self.registry.parked_count(),
            transfers,
        }
    }

    fn reset_session_if_idle(&self) {
        if self.config.reset_session_when_idle && self.registry.active_count() == 0 {
            debug!("No active transfers, resetting engine session");
            self.engine.reset_session();
        }
    }

    fn transition(&self, operation: &DownloadOperation, next: OperationState) -> bool {
        match operation.transition(next) {
            Ok(_) => true,
            Err(e) => {
                error!(operation = %operation.id(), error = %e, "Rejected state transition");
                false
            }
        }
    }

    fn progress(&self, operation: &DownloadOperation, fraction: f32) {
        if operation.set_progress(fraction) {
            self.dispatcher.progress(operation, fraction);
        }
    }

    fn finish(&self, operation: &DownloadOperation, outcome: Result<PathBuf, OperationError>) {
        if operation.finish(outcome) {
            self.dispatcher.completed(operation);
        }
    }
}

/// Remove a staged download that will never reach the cache
async fn discard(temp_file: &Path) {
    match tokio::fs::remove_file(temp_file).await {
        Ok(()) => debug!(path = ?temp_file, "Removed staged download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?temp_file, error = %e, "Failed to remove staged download"),
    }
}
