use bgfetch_engine::{DownloadOperation, OperationId, ProgressObserver};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

const BAR_LENGTH: u64 = 1000;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {percent}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// One progress bar per download operation
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<OperationId, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: true,
        }
    }

    /// Progress observer that drives the bar of the operation it is called for
    pub fn observer(&self, label: String) -> Option<ProgressObserver> {
        if self.disabled {
            return None;
        }
        let manager = self.clone();
        Some(Arc::new(move |op: &DownloadOperation, progress: f32| {
            manager.update(op.id(), &label, progress);
        }))
    }

    fn update(&self, id: OperationId, label: &str, progress: f32) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let bar = bars.entry(id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(BAR_LENGTH));
            bar.set_style(download_style());
            bar.set_message(format!("Downloading {label}"));
            bar.enable_steady_tick(Duration::from_millis(500));
            bar
        });
        bar.set_position((progress.clamp(0.0, 1.0) * BAR_LENGTH as f32) as u64);
    }

    /// Close the bar of a finished operation
    pub fn finish(&self, op: &DownloadOperation, message: String) {
        if self.disabled {
            return;
        }
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        if let Some(bar) = bars.remove(&op.id()) {
            if op.error().is_none() {
                bar.set_position(BAR_LENGTH);
            }
            bar.finish_with_message(message);
        }
    }
}
