//! # Transfer Engines
//!
//! The coordinator never moves bytes itself. A [`TransferEngine`] performs the
//! network transfer, writes the body to a temporary file and reports what
//! happens through a [`TransferEventSink`]. Engines that keep transfers alive
//! across process restarts report them again from
//! [`TransferEngine::list_active_transfers`].

mod http;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::request::{DownloadRequest, ResourceId};

pub use http::{HttpEngineConfig, HttpTransferEngine, create_client};

/// Engine-assigned identifier of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Handle returned by [`TransferEngine::begin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHandle {
    pub id: TransferId,
    pub resource: ResourceId,
}

/// A transfer the engine considers active, as seen at reconciliation time
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub resource: ResourceId,
    pub bytes_received: u64,
    /// Zero when the size is unknown
    pub bytes_expected: u64,
    /// Set when the transfer already failed; such transfers are ignored
    pub error: Option<EngineError>,
}

#[derive(Debug, Clone)]
pub enum TransferEventKind {
    Progress { received: u64, expected: u64 },
    Completed { temp_file: PathBuf },
    Failed { error: EngineError },
}

#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub transfer: TransferId,
    pub resource: ResourceId,
    pub kind: TransferEventKind,
}

/// Channel through which an engine reports progress and terminal events.
///
/// Every transfer must emit exactly one terminal event.
#[derive(Debug, Clone)]
pub struct TransferEventSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferEventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Send an event. Returns false once the coordinator has gone away.
    pub fn send(&self, event: TransferEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn progress(&self, handle: &TransferHandle, received: u64, expected: u64) -> bool {
        self.emit(handle, TransferEventKind::Progress { received, expected })
    }

    pub fn completed(&self, handle: &TransferHandle, temp_file: PathBuf) -> bool {
        self.emit(handle, TransferEventKind::Completed { temp_file })
    }

    pub fn failed(&self, handle: &TransferHandle, error: EngineError) -> bool {
        self.emit(handle, TransferEventKind::Failed { error })
    }

    fn emit(&self, handle: &TransferHandle, kind: TransferEventKind) -> bool {
        self.send(TransferEvent {
            transfer: handle.id,
            resource: handle.resource.clone(),
            kind,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The transport that performs transfers on behalf of the coordinator
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// List the transfers the engine is still running. Called once at startup;
    /// later events for these transfers go to `sink`.
    async fn list_active_transfers(
        &self,
        sink: TransferEventSink,
    ) -> Result<Vec<TransferSnapshot>, EngineError>;

    /// Start a transfer. Must return without waiting for the transfer.
    fn begin(
        &self,
        request: &DownloadRequest,
        sink: TransferEventSink,
    ) -> Result<TransferHandle, EngineError>;

    /// Best-effort stop of a running transfer
    fn cancel(&self, transfer: TransferId);

    /// Release session-wide resources once nothing is in flight
    fn reset_session(&self) {}
}

/// Progress fraction in `[0, 1]`, or None when the expected size is unknown
pub fn progress_fraction(received: u64, expected: u64) -> Option<f32> {
    if expected == 0 {
        return None;
    }
    Some((received as f64 / expected as f64).clamp(0.0, 1.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(progress_fraction(0, 0), None);
        assert_eq!(progress_fraction(50, 0), None);
        assert_eq!(progress_fraction(25, 100), Some(0.25));
        assert_eq!(progress_fraction(100, 100), Some(1.0));
        assert_eq!(progress_fraction(150, 100), Some(1.0));
    }

    #[tokio::test]
    async fn test_sink_reports_closed_receiver() {
        let (sink, rx) = TransferEventSink::channel();
        let handle = TransferHandle {
            id: TransferId(1),
            resource: crate::DownloadRequest::parse("https://example.com/x")
                .unwrap()
                .resource_id(),
        };
        assert!(sink.progress(&handle, 1, 2));
        drop(rx);
        assert!(!sink.completed(&handle, PathBuf::from("/tmp/x")));
        assert!(sink.is_closed());
    }
}
