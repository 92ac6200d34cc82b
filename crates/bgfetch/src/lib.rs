//! # bgfetch
//!
//! A coordinator for long-running file downloads. Every request for the same
//! remote resource shares one in-flight transfer and one cached file, and
//! transfers that outlive the process are picked up again at startup.
//!
//! ## Features
//!
//! - Request coalescing: at most one transfer per canonical URL
//! - Progress fan-out to every waiting operation
//! - Startup reconciliation against transfers an engine is still running
//! - Content-addressed on-disk cache with atomic publishing
//! - Cleanup on startup, termination and wall-clock jumps
//! - A `reqwest` based transfer engine
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bgfetch_engine::{Coordinator, CoordinatorConfig, DownloadRequest, HttpTransferEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(HttpTransferEngine::new(Default::default())?);
//! let coordinator = Coordinator::start(engine, CoordinatorConfig::default()).await?;
//!
//! let request = DownloadRequest::parse("https://example.com/archive.tar.gz")?;
//! let operation = coordinator.perform(request, Vec::new(), None, |op| {
//!     println!("finished: {:?} {:?}", op.result_file(), op.error());
//! });
//! operation.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod operation;
pub mod request;

pub use builder::CoordinatorConfigBuilder;
pub use cache::{CacheKey, LocalCacheStore, derive_key};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, RegistrySnapshot, TransferInfo};
pub use engine::{
    HttpEngineConfig, HttpTransferEngine, TransferEngine, TransferEvent, TransferEventKind,
    TransferEventSink, TransferHandle, TransferId, TransferSnapshot, create_client,
    progress_fraction,
};
pub use error::{CoordinatorError, EngineError, InvalidTransition, OperationError, StoreError};
pub use lifecycle::{ClockWatcher, LifecycleEvent, watch_termination_signals};
pub use operation::{
    CompletionHandler, DownloadOperation, OperationId, OperationState, ProgressObserver,
};
pub use request::{DownloadRequest, ResourceId, parse_header};
