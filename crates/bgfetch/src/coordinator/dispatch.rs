//! Callback delivery.
//!
//! Progress observers and completion handlers run on their own task, in the
//! order the actor emitted them, so caller code never runs inside the actor.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::operation::DownloadOperation;

#[derive(Debug)]
enum Notification {
    Progress(DownloadOperation, f32),
    Completed(DownloadOperation),
}

impl Notification {
    fn deliver(self) {
        match self {
            Notification::Progress(operation, progress) => {
                trace!(operation = %operation.id(), progress, "Delivering progress");
                operation.notify_progress(progress);
            }
            Notification::Completed(operation) => {
                debug!(operation = %operation.id(), "Delivering completion");
                operation.complete();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CallbackDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl CallbackDispatcher {
    pub fn spawn(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        runtime.spawn(async move {
            while let Some(notification) = rx.recv().await {
                notification.deliver();
            }
            debug!("Callback dispatcher stopped");
        });
        Self { tx }
    }

    pub fn progress(&self, operation: &DownloadOperation, progress: f32) {
        self.send(Notification::Progress(operation.clone(), progress));
    }

    pub fn completed(&self, operation: &DownloadOperation) {
        self.send(Notification::Completed(operation.clone()));
    }

    fn send(&self, notification: Notification) {
        // Runtime shutting down: deliver here rather than drop a completion
        if let Err(mpsc::error::SendError(notification)) = self.tx.send(notification) {
            notification.deliver();
        }
    }
}
