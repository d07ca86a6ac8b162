//! Progress UI (spinner) for blog runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blogcrawl_core::{ProgressEvent, ProgressSink, TracingProgress};
use indicatif::{ProgressBar, ProgressStyle};

/// Spinner that shows the latest event and prints errors above itself.
#[derive(Debug)]
pub(crate) struct SpinnerProgress {
    spinner: ProgressBar,
    downloads: AtomicUsize,
}

impl SpinnerProgress {
    pub(crate) fn start() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            downloads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressSink for SpinnerProgress {
    fn report(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Error { .. } => self.spinner.println(event.to_string()),
            ProgressEvent::Downloading { blog, file } => {
                let n = self.downloads.fetch_add(1, Ordering::Relaxed) + 1;
                self.spinner
                    .set_message(format!("[{n}] {blog}: downloading {file}"));
            }
            _ => self.spinner.set_message(event.to_string()),
        }
    }
}

/// Spinner on a terminal, tracing otherwise.
///
/// Returns the sink and, when a spinner was started, the handle to clear it.
pub(crate) fn progress_sink(
    use_spinner: bool,
) -> (Arc<dyn ProgressSink>, Option<Arc<SpinnerProgress>>) {
    if use_spinner {
        let spinner = Arc::new(SpinnerProgress::start());
        (Arc::clone(&spinner) as Arc<dyn ProgressSink>, Some(spinner))
    } else {
        (Arc::new(TracingProgress), None)
    }
}
