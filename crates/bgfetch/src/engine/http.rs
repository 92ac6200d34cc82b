//! # HTTP Transfer Engine
//!
//! Streams response bodies into staging files with reqwest. Transfers live as
//! tokio tasks inside this process, so `list_active_transfers` reports the
//! transfers of this engine instance only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use rustls::ClientConfig;
use rustls::crypto::aws_lc_rs;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TransferEngine, TransferEventSink, TransferHandle, TransferId, TransferSnapshot};
use crate::error::EngineError;
use crate::request::DownloadRequest;

const DEFAULT_USER_AGENT: &str = concat!("bgfetch/", env!("CARGO_PKG_VERSION"));
const STAGING_DIR_NAME: &str = "bgfetch-staging";

/// Configurable options for the HTTP engine
#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    /// Overall timeout for a whole transfer. Zero disables it.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, before per-request headers
    pub headers: HeaderMap,

    /// Where partial downloads are written. If None, a directory under the
    /// system temp dir is used.
    pub staging_dir: Option<PathBuf>,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpEngineConfig::get_default_headers(),
            staging_dir: None,
        }
    }
}

impl HttpEngineConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }

    fn resolved_staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(STAGING_DIR_NAME))
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpEngineConfig) -> Result<Client, EngineError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| EngineError::Other(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| EngineError::Other(format!("TLS platform verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    client_builder.build().map_err(EngineError::from)
}

struct RunningTransfer {
    resource: crate::request::ResourceId,
    received: Arc<AtomicU64>,
    expected: Arc<AtomicU64>,
    sink: Arc<Mutex<TransferEventSink>>,
    task: JoinHandle<()>,
}

type TransferTable = Arc<Mutex<HashMap<TransferId, RunningTransfer>>>;

pub struct HttpTransferEngine {
    config: HttpEngineConfig,
    client: Mutex<Client>,
    next_id: AtomicU64,
    transfers: TransferTable,
}

impl HttpTransferEngine {
    pub fn new(config: HttpEngineConfig) -> Result<Self, EngineError> {
        let client = create_client(&config)?;
        Ok(Self {
            config,
            client: Mutex::new(client),
            next_id: AtomicU64::new(1),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of transfers currently running
    pub fn active_count(&self) -> usize {
        self.transfers.lock().len()
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn list_active_transfers(
        &self,
        sink: TransferEventSink,
    ) -> Result<Vec<TransferSnapshot>, EngineError> {
        let transfers = self.transfers.lock();
        let snapshots = transfers
            .iter()
            .map(|(id, running)| {
                // Route later events to the coordinator asking now
                *running.sink.lock() = sink.clone();
                TransferSnapshot {
                    id: *id,
                    resource: running.resource.clone(),
                    bytes_received: running.received.load(Ordering::Relaxed),
                    bytes_expected: running.expected.load(Ordering::Relaxed),
                    error: None,
                }
            })
            .collect();
        Ok(snapshots)
    }

    fn begin(
        &self,
        request: &DownloadRequest,
        sink: TransferEventSink,
    ) -> Result<TransferHandle, EngineError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Other(format!("no async runtime: {e}")))?;

        match request.url().scheme() {
            "http" | "https" => {}
            other => {
                return Err(EngineError::InvalidRequest(format!(
                    "unsupported scheme '{other}' in {}",
                    request.url()
                )));
            }
        }

        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = TransferHandle {
            id,
            resource: request.resource_id(),
        };

        let received = Arc::new(AtomicU64::new(0));
        let expected = Arc::new(AtomicU64::new(0));
        let sink = Arc::new(Mutex::new(sink));

        let job = TransferJob {
            client: self.client.lock().clone(),
            request: request.clone(),
            handle: handle.clone(),
            staging_dir: self.config.resolved_staging_dir(),
            received: received.clone(),
            expected: expected.clone(),
            sink: sink.clone(),
            transfers: self.transfers.clone(),
        };

        // Hold the table lock across spawn so the task cannot finish and
        // remove itself before it is inserted.
        let mut transfers = self.transfers.lock();
        let task = runtime.spawn(job.run());
        transfers.insert(
            id,
            RunningTransfer {
                resource: handle.resource.clone(),
                received,
                expected,
                sink,
                task,
            },
        );

        info!(transfer = %id, url = %request.url(), "Started HTTP transfer");
        Ok(handle)
    }

    fn cancel(&self, transfer: TransferId) {
        let Some(running) = self.transfers.lock().remove(&transfer) else {
            debug!(transfer = %transfer, "Cancel requested for unknown transfer");
            return;
        };

        running.task.abort();
        let handle = TransferHandle {
            id: transfer,
            resource: running.resource,
        };
        running.sink.lock().failed(&handle, EngineError::Cancelled);
        info!(transfer = %transfer, "Cancelled HTTP transfer");
    }

    fn reset_session(&self) {
        match create_client(&self.config) {
            Ok(client) => {
                *self.client.lock() = client;
                debug!("HTTP client session reset");
            }
            Err(e) => warn!(error = %e, "Failed to rebuild HTTP client, keeping the old one"),
        }
    }
}

struct TransferJob {
    client: Client,
    request: DownloadRequest,
    handle: TransferHandle,
    staging_dir: PathBuf,
    received: Arc<AtomicU64>,
    expected: Arc<AtomicU64>,
    sink: Arc<Mutex<TransferEventSink>>,
    transfers: TransferTable,
}

impl TransferJob {
    async fn run(self) {
        let result = self.download().await;

        // A cancelled transfer has already been removed and reported
        if self.transfers.lock().remove(&self.handle.id).is_none() {
            return;
        }

        let sink = self.sink.lock().clone();
        match result {
            Ok(path) => {
                debug!(transfer = %self.handle.id, path = ?path, "HTTP transfer finished");
                sink.completed(&self.handle, path);
            }
            Err(e) => {
                warn!(transfer = %self.handle.id, url = %self.request.url(), error = %e, "HTTP transfer failed");
                sink.failed(&self.handle, e);
            }
        }
    }

    async fn download(&self) -> Result<PathBuf, EngineError> {
        let response = self
            .client
            .get(self.request.url().clone())
            .headers(self.request.headers().clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Status(status));
        }

        let total = response.content_length().unwrap_or(0);
        self.expected.store(total, Ordering::Relaxed);

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = tempfile::Builder::new()
            .prefix("bgfetch-")
            .suffix(".part")
            .tempfile_in(&self.staging_dir)?;
        // The temp path deletes the file when dropped, including on abort
        let (std_file, temp_path) = staged.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            let received =
                self.received.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            self.sink.lock().progress(&self.handle, received, total);
        }

        file.flush().await?;
        drop(file);

        temp_path.keep().map_err(|e| EngineError::from(e.error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HttpEngineConfig::default();
        assert!(config.timeout.is_zero());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.follow_redirects);
        assert!(config.user_agent.starts_with("bgfetch/"));
        assert_eq!(
            config.resolved_staging_dir(),
            std::env::temp_dir().join("bgfetch-staging")
        );
    }

    #[tokio::test]
    async fn test_begin_rejects_unsupported_scheme() {
        let engine = HttpTransferEngine::new(HttpEngineConfig::default()).unwrap();
        let (sink, _rx) = TransferEventSink::channel();
        let request = DownloadRequest::parse("ftp://example.com/file.bin").unwrap();

        let err = engine.begin(&request, sink).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_transfer_is_noop() {
        let engine = HttpTransferEngine::new(HttpEngineConfig::default()).unwrap();
        engine.cancel(TransferId(42));
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_list_active_transfers_starts_empty() {
        let engine = HttpTransferEngine::new(HttpEngineConfig::default()).unwrap();
        let (sink, _rx) = TransferEventSink::channel();
        let snapshots = engine.list_active_transfers(sink).await.unwrap();
        assert!(snapshots.is_empty());
    }
}
