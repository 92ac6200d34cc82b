#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bgfetch_engine::{
    Coordinator, CoordinatorConfig, DownloadRequest, EngineError, TransferEngine,
    TransferEventSink, TransferHandle, TransferId, TransferSnapshot,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::oneshot;
use url::Url;

/// Initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
#[macro_export]
macro_rules! init_test_tracing {
    () => {
        init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

#[derive(Default)]
struct MockState {
    begun: Vec<(TransferHandle, DownloadRequest)>,
    cancelled: Vec<TransferId>,
    sinks: HashMap<TransferId, (TransferHandle, TransferEventSink)>,
    inventory: Vec<TransferSnapshot>,
    inventory_gate: Option<oneshot::Receiver<()>>,
    inventory_error: Option<EngineError>,
    begin_error: Option<EngineError>,
}

/// Scripted transfer engine. Transfers never make progress on their own; the
/// test drives them through [`MockEngine::progress`], [`MockEngine::complete`]
/// and [`MockEngine::fail`].
pub struct MockEngine {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    resets: AtomicUsize,
    inventory_calls: AtomicUsize,
    staging: PathBuf,
}

impl MockEngine {
    pub fn new(staging: &Path) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            resets: AtomicUsize::new(0),
            inventory_calls: AtomicUsize::new(0),
            staging: staging.to_path_buf(),
        })
    }

    /// Report a transfer as already running at startup
    pub fn recover(&self, id: u64, url: &str, received: u64, expected: u64) -> TransferId {
        let id = TransferId(id);
        self.state.lock().inventory.push(TransferSnapshot {
            id,
            resource: DownloadRequest::parse(url).unwrap().resource_id(),
            bytes_received: received,
            bytes_expected: expected,
            error: None,
        });
        id
    }

    pub fn recover_failed(&self, id: u64, url: &str) {
        self.state.lock().inventory.push(TransferSnapshot {
            id: TransferId(id),
            resource: DownloadRequest::parse(url).unwrap().resource_id(),
            bytes_received: 0,
            bytes_expected: 0,
            error: Some(EngineError::Other("interrupted".into())),
        });
    }

    /// Hold `list_active_transfers` until the returned sender fires
    pub fn gate_inventory(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().inventory_gate = Some(rx);
        tx
    }

    pub fn is_inventory_gated(&self) -> bool {
        self.state.lock().inventory_gate.is_some()
    }

    pub fn fail_inventory(&self, error: EngineError) {
        self.state.lock().inventory_error = Some(error);
    }

    pub fn fail_next_begin(&self, error: EngineError) {
        self.state.lock().begin_error = Some(error);
    }

    pub fn begin_count(&self) -> usize {
        self.state.lock().begun.len()
    }

    pub fn begun(&self) -> Vec<TransferId> {
        self.state.lock().begun.iter().map(|(h, _)| h.id).collect()
    }

    pub fn last_begun(&self) -> TransferId {
        *self.begun().last().expect("no transfer begun")
    }

    pub fn begun_request(&self, id: TransferId) -> Option<DownloadRequest> {
        self.state
            .lock()
            .begun
            .iter()
            .find(|(h, _)| h.id == id)
            .map(|(_, r)| r.clone())
    }

    pub fn cancelled(&self) -> Vec<TransferId> {
        self.state.lock().cancelled.clone()
    }

    /// Whether the coordinator has asked for the active transfers yet
    pub fn inventory_requested(&self) -> bool {
        self.inventory_calls.load(Ordering::SeqCst) > 0
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    fn sink_for(&self, id: TransferId) -> (TransferHandle, TransferEventSink) {
        self.state
            .lock()
            .sinks
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("unknown transfer {id}"))
    }

    pub fn progress(&self, id: TransferId, received: u64, expected: u64) {
        let (handle, sink) = self.sink_for(id);
        sink.progress(&handle, received, expected);
    }

    /// Write `contents` to a staging file and report the transfer complete
    pub fn complete(&self, id: TransferId, contents: &str) -> PathBuf {
        let (handle, sink) = self.sink_for(id);
        let path = self.staging.join(format!("{}.part", id.0));
        std::fs::write(&path, contents).unwrap();
        sink.completed(&handle, path.clone());
        path
    }

    /// Report completion with a staging file that does not exist
    pub fn complete_without_file(&self, id: TransferId) {
        let (handle, sink) = self.sink_for(id);
        sink.completed(&handle, self.staging.join("missing.part"));
    }

    pub fn fail(&self, id: TransferId, error: EngineError) {
        let (handle, sink) = self.sink_for(id);
        sink.failed(&handle, error);
    }
}

#[async_trait]
impl TransferEngine for MockEngine {
    async fn list_active_transfers(
        &self,
        sink: TransferEventSink,
    ) -> Result<Vec<TransferSnapshot>, EngineError> {
        let gate = {
            let mut state = self.state.lock();
            self.inventory_calls.fetch_add(1, Ordering::SeqCst);
            let inventory = state.inventory.clone();
            for snapshot in inventory {
                let handle = TransferHandle {
                    id: snapshot.id,
                    resource: snapshot.resource.clone(),
                };
                state.sinks.insert(snapshot.id, (handle, sink.clone()));
            }
            state.inventory_gate.take()
        };

        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.inventory_error.take() {
            return Err(error);
        }
        Ok(state.inventory.clone())
    }

    fn begin(
        &self,
        request: &DownloadRequest,
        sink: TransferEventSink,
    ) -> Result<TransferHandle, EngineError> {
        let mut state = self.state.lock();
        if let Some(error) = state.begin_error.take() {
            return Err(error);
        }

        let handle = TransferHandle {
            id: TransferId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            resource: request.resource_id(),
        };
        state.begun.push((handle.clone(), request.clone()));
        state.sinks.insert(handle.id, (handle.clone(), sink));
        Ok(handle)
    }

    fn cancel(&self, transfer: TransferId) {
        let mut state = self.state.lock();
        state.cancelled.push(transfer);
        if let Some((handle, sink)) = state.sinks.get(&transfer) {
            sink.failed(handle, EngineError::Cancelled);
        }
    }

    fn reset_session(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Coordinator over a [`MockEngine`] with its own temporary directories
pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub coordinator: Coordinator,
    pub cache_dir: PathBuf,
    _dirs: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        let dirs = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(dirs.path());
        Self::start_with(dirs, engine).await
    }

    /// Start over an engine that was prepared against `dirs`. Unless the
    /// engine's inventory is gated, returns once reconciliation completed.
    pub async fn start_with(dirs: TempDir, engine: Arc<MockEngine>) -> Self {
        let gated = engine.is_inventory_gated();
        let cache_dir = dirs.path().join("cache");
        let config = CoordinatorConfig::builder()
            .with_cache_dir(&cache_dir)
            .with_clock_check_interval(Duration::ZERO)
            .build();
        let coordinator = Coordinator::start(engine.clone(), config).await.unwrap();
        let harness = Self {
            engine,
            coordinator,
            cache_dir,
            _dirs: dirs,
        };
        if !gated {
            harness.reconciled().await;
        }
        harness
    }

    /// Wait until the coordinator has finished startup reconciliation
    pub async fn reconciled(&self) -> bgfetch_engine::RegistrySnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = self.settle().await;
                if snapshot.reconciled {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconciliation did not complete in time")
    }

    /// Wait until the actor has processed everything sent so far
    pub async fn settle(&self) -> bgfetch_engine::RegistrySnapshot {
        self.coordinator.snapshot().await.unwrap()
    }

    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.coordinator.local_file_path(&Url::parse(url).unwrap())
    }
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn request(url: &str) -> DownloadRequest {
    DownloadRequest::parse(url).unwrap()
}
