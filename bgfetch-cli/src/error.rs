use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] bgfetch_engine::EngineError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] bgfetch_engine::CoordinatorError),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("{failed} of {total} downloads failed")]
    DownloadsFailed { failed: usize, total: usize },
}
