//! # Download Operations
//!
//! A [`DownloadOperation`] is what callers hold on to. It moves through a
//! single explicit state machine:
//!
//! ```text
//! Created ─┬─> WaitingForDependencies ─┐
//!          └───────────────────────────┴─> Registered ─┬─> AwaitingReconciliation ─┐
//!                                                       │                          │
//!                                                       ├──────────────────────────┴─> AttachedToTransfer ─┐
//!                                                       └─────────────────────────────> CacheHit ──────────┴─> Finished
//! ```
//!
//! Every non-terminal state may also go straight to `Finished` (cancellation
//! or a failure to start a transfer). The completion handler runs exactly
//! once, on the coordinator's callback task.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, warn};

use crate::coordinator::Coordinator;
use crate::error::{EngineError, InvalidTransition, OperationError};
use crate::request::{DownloadRequest, ResourceId};

/// Called with the latest progress fraction, zero or more times
pub type ProgressObserver = Arc<dyn Fn(&DownloadOperation, f32) + Send + Sync>;

/// Called once the operation has finished, exactly once
pub type CompletionHandler = Box<dyn FnOnce(&DownloadOperation) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Constructed, not submitted
    Created,
    /// Submitted, waiting for its dependencies to finish
    WaitingForDependencies,
    /// Holds a waiter entry in the registry
    Registered,
    /// Parked until startup reconciliation has completed
    AwaitingReconciliation,
    /// Observing an active transfer
    AttachedToTransfer,
    /// Satisfied from the local cache
    CacheHit,
    Finished,
}

impl OperationState {
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;

        match (self, next) {
            (Finished, _) => false,
            (_, Finished) => true,
            (Created, WaitingForDependencies | Registered) => true,
            (WaitingForDependencies, Registered) => true,
            (Registered, AwaitingReconciliation | AttachedToTransfer | CacheHit) => true,
            (AwaitingReconciliation, AttachedToTransfer | CacheHit) => true,
            _ => false,
        }
    }

    pub fn is_finished(self) -> bool {
        self == OperationState::Finished
    }
}

#[derive(Debug)]
struct Status {
    state: OperationState,
    submitted: bool,
    cancelled: bool,
    progress: f32,
    result_file: Option<PathBuf>,
    error: Option<OperationError>,
}

struct Inner {
    id: OperationId,
    request: DownloadRequest,
    resource: ResourceId,
    dependencies: Vec<DownloadOperation>,
    progress_observer: Option<ProgressObserver>,
    completion: Mutex<Option<CompletionHandler>>,
    status: Mutex<Status>,
    cancel_signal: Notify,
    finished: watch::Sender<bool>,
    coordinator: Coordinator,
}

/// Caller-facing handle to one download. Cloning shares the same operation.
#[derive(Clone)]
pub struct DownloadOperation {
    inner: Arc<Inner>,
}

impl DownloadOperation {
    /// Create an operation. Nothing happens until [`start`](Self::start).
    pub fn new<F>(
        coordinator: &Coordinator,
        request: DownloadRequest,
        dependencies: Vec<DownloadOperation>,
        progress_observer: Option<ProgressObserver>,
        completion: F,
    ) -> Self
    where
        F: FnOnce(&DownloadOperation) + Send + 'static,
    {
        let (finished, _) = watch::channel(false);
        let resource = request.resource_id();
        let completion: CompletionHandler = Box::new(completion);
        Self {
            inner: Arc::new(Inner {
                id: coordinator.next_operation_id(),
                request,
                resource,
                dependencies,
                progress_observer,
                completion: Mutex::new(Some(completion)),
                status: Mutex::new(Status {
                    state: OperationState::Created,
                    submitted: false,
                    cancelled: false,
                    progress: 0.0,
                    result_file: None,
                    error: None,
                }),
                cancel_signal: Notify::new(),
                finished,
                coordinator: coordinator.clone(),
            }),
        }
    }

    /// Submit the operation. Returns immediately; the outcome arrives through
    /// the completion handler.
    pub fn start(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.submitted || status.state != OperationState::Created {
                warn!(operation = %self.id(), state = ?status.state, "Operation already started");
                return;
            }
            status.submitted = true;
            if !self.dependencies().is_empty() && !status.cancelled {
                status.state = OperationState::WaitingForDependencies;
            }
        }

        if self.state() == OperationState::WaitingForDependencies {
            let operation = self.clone();
            self.inner
                .coordinator
                .runtime()
                .spawn(async move { operation.submit_after_dependencies().await });
        } else {
            self.submit();
        }
    }

    async fn submit_after_dependencies(self) {
        let dependencies = async {
            for dependency in self.dependencies() {
                dependency.wait().await;
            }
        };

        tokio::select! {
            _ = dependencies => {
                debug!(operation = %self.id(), "Dependencies finished");
            }
            _ = self.inner.cancel_signal.notified() => {
                debug!(operation = %self.id(), "Cancelled while waiting for dependencies");
            }
        }

        self.submit();
    }

    fn submit(&self) {
        if let Err(e) = self.inner.coordinator.submit(self.clone()) {
            warn!(operation = %self.id(), error = %e, "Coordinator unavailable");
            let error = OperationError::TransferInitializationFailed(EngineError::Other(
                e.to_string(),
            ));
            if self.finish(Err(error)) {
                self.complete();
            }
        }
    }

    /// Cancel the operation.
    ///
    /// Sibling operations waiting on the same resource are not affected. The
    /// transfer itself is stopped only when no other operation waits on it.
    pub fn cancel(&self) {
        let submitted = {
            let mut status = self.inner.status.lock();
            if status.state.is_finished() || status.cancelled {
                return;
            }
            status.cancelled = true;
            status.submitted
        };

        self.inner.cancel_signal.notify_one();
        if submitted {
            self.inner.coordinator.request_cancel(self.id());
        }
    }

    /// Resolves once the operation has finished and its completion handler
    /// has returned
    pub async fn wait(&self) {
        let mut finished = self.inner.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn id(&self) -> OperationId {
        self.inner.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.inner.request
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.inner.resource
    }

    /// Operations that must finish before this one is registered
    pub fn dependencies(&self) -> &[DownloadOperation] {
        &self.inner.dependencies
    }

    pub fn state(&self) -> OperationState {
        self.inner.status.lock().state
    }

    /// Last observed progress in `[0, 1]`
    pub fn progress(&self) -> f32 {
        self.inner.status.lock().progress
    }

    pub fn result_file(&self) -> Option<PathBuf> {
        self.inner.status.lock().result_file.clone()
    }

    pub fn error(&self) -> Option<OperationError> {
        self.inner.status.lock().error.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.status.lock().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub(crate) fn transition(
        &self,
        next: OperationState,
    ) -> Result<OperationState, InvalidTransition> {
        let mut status = self.inner.status.lock();
        let current = status.state;
        if !current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        status.state = next;
        Ok(current)
    }

    /// Record a new progress value. Returns false if nothing changed.
    pub(crate) fn set_progress(&self, progress: f32) -> bool {
        let mut status = self.inner.status.lock();
        if status.state.is_finished() || status.progress == progress {
            return false;
        }
        status.progress = progress;
        true
    }

    /// Record the terminal outcome. Returns false if the operation had
    /// already finished, in which case nothing is changed.
    pub(crate) fn finish(&self, outcome: Result<PathBuf, OperationError>) -> bool {
        let mut status = self.inner.status.lock();
        if status.state.is_finished() {
            return false;
        }
        status.state = OperationState::Finished;
        match outcome {
            Ok(path) => {
                status.progress = 1.0;
                status.result_file = Some(path);
            }
            Err(e) => status.error = Some(e),
        }
        true
    }

    /// Run the progress observer, if any
    pub(crate) fn notify_progress(&self, progress: f32) {
        if let Some(observer) = &self.inner.progress_observer {
            let result = catch_unwind(AssertUnwindSafe(|| observer(self, progress)));
            if result.is_err() {
                error!(operation = %self.id(), "Progress observer panicked");
            }
        }
    }

    /// Run the completion handler and wake waiters. Only the first call does
    /// anything.
    pub(crate) fn complete(&self) {
        let Some(handler) = self.inner.completion.lock().take() else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| handler(self))).is_err() {
            error!(operation = %self.id(), "Completion handler panicked");
        }
        self.inner.finished.send_replace(true);
    }
}

impl fmt::Debug for DownloadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("DownloadOperation")
            .field("id", &self.inner.id)
            .field("resource", &self.inner.resource)
            .field("state", &status.state)
            .field("progress", &status.progress)
            .field("cancelled", &status.cancelled)
            .finish()
    }
}

impl PartialEq for DownloadOperation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DownloadOperation {}
