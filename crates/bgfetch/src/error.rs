use std::path::PathBuf;
use std::sync::Arc;

use reqwest::StatusCode;

use crate::operation::OperationState;

/// Terminal outcome of a failed download operation.
///
/// Cloneable so that one transfer failure can be handed to every waiter.
#[derive(Debug, thiserror::Error, Clone)]
pub enum OperationError {
    #[error("Operation was cancelled before it started")]
    CanceledBeforeStart,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Transfer could not be initialized: {0}")]
    TransferInitializationFailed(#[source] EngineError),

    #[error("Transfer failed: {0}")]
    TransferFailed(#[source] EngineError),

    #[error("Failed to publish downloaded file: {0}")]
    PublishFailed(#[source] StoreError),
}

/// Errors raised by the local cache store
#[derive(Debug, thiserror::Error, Clone)]
pub enum StoreError {
    #[error("Source file does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source: Arc::new(err),
        }
    }
}

// Custom error type for transfer engine operations
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("Server returned status code {0}")]
    Status(StatusCode),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Engine error: {0}")]
    Other(String),
}

// Manual implementation of From<reqwest::Error> for EngineError
// because of the Arc wrapping.
impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Http {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            source: Arc::new(err),
        }
    }
}

/// Errors raised while setting up or talking to a coordinator
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("No tokio runtime is available on this thread")]
    NoRuntime,

    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Coordinator has shut down")]
    Closed,
}

/// Rejected state machine transition of a download operation
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("Invalid operation state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: OperationState,
    pub to: OperationState,
}
