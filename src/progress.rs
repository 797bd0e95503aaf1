//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::WorkflowConfigBuilder::progress_callback`] (or
//! [`crate::pipeline::tag::Tagger::progress`]) to receive events as the
//! pipeline works through files, text chunks and tagging batches.
//!
//! The pipeline is sequential, so callbacks are never invoked concurrently,
//! but the trait is `Send + Sync` because the workflow runs on a tokio
//! runtime and callers usually forward events to another thread (a
//! terminal progress bar, a channel, a UI).
//!
//! # Example
//!
//! ```rust
//! use pdf2anki::PipelineProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Percent(AtomicUsize);
//!
//! impl PipelineProgressCallback for Percent {
//!     fn on_batch_complete(&self, _pass: usize, processed: usize, total: usize) {
//!         let pct = processed * 100 / total.max(1);
//!         self.0.store(pct, Ordering::SeqCst);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Pipeline stage reported by [`PipelineProgressCallback::on_stage_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PageImages,
    VisualExtraction,
    TextExtraction,
    /// Tagging pass `n` (1-based).
    Tagging(usize),
    Writing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::PageImages => write!(f, "page images"),
            Stage::VisualExtraction => write!(f, "visual extraction"),
            Stage::TextExtraction => write!(f, "text extraction"),
            Stage::Tagging(n) => write!(f, "tagging pass {}", n),
            Stage::Writing => write!(f, "writing output"),
        }
    }
}

/// Called by the pipeline as it progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage begins. `units` is the number of chunks, batches or pages the
    /// stage will work through, when known up front.
    fn on_stage_start(&self, stage: Stage, units: Option<usize>) {
        let _ = (stage, units);
    }

    /// A text chunk was handled (sent, skipped or failed).
    ///
    /// # Arguments
    /// * `chunk`  — 1-indexed chunk number
    /// * `total`  — number of chunks
    /// * `items`  — valid items the chunk produced
    fn on_chunk_complete(&self, chunk: usize, total: usize, items: usize) {
        let _ = (chunk, total, items);
    }

    /// A tagging batch was handled. `processed / total * 100` is the
    /// percentage of rows tagged so far in this pass.
    fn on_batch_complete(&self, pass: usize, processed: usize, total: usize) {
        let _ = (pass, processed, total);
    }

    /// Bulk mode: file `index` (1-based) of `total` is starting.
    fn on_file_start(&self, index: usize, total: usize, name: &str) {
        let _ = (index, total, name);
    }

    /// Bulk mode: a file failed and was skipped.
    fn on_file_error(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// The workflow wrote its final output with `rows` data rows.
    fn on_workflow_complete(&self, rows: usize) {
        let _ = rows;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::WorkflowConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

/// Percentage of `processed` over `total`, 100 when `total` is zero.
pub fn percent(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    processed as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        stages: Mutex<Vec<Stage>>,
        batches: AtomicUsize,
        last_processed: AtomicUsize,
        file_errors: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage_start(&self, stage: Stage, _units: Option<usize>) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_batch_complete(&self, _pass: usize, processed: usize, _total: usize) {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.last_processed.store(processed, Ordering::SeqCst);
        }

        fn on_file_error(&self, _index: usize, _total: usize, _error: &str) {
            self.file_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Tagging(1), Some(3));
        cb.on_chunk_complete(1, 2, 5);
        cb.on_batch_complete(1, 5, 12);
        cb.on_file_start(1, 2, "a.pdf");
        cb.on_file_error(1, 2, "boom");
        cb.on_workflow_complete(12);
    }

    #[test]
    fn tracking_callback_counts_events() {
        let cb = Arc::new(TrackingCallback::default());
        let dyn_cb: ProgressCallback = cb.clone();

        dyn_cb.on_stage_start(Stage::TextExtraction, None);
        dyn_cb.on_stage_start(Stage::Tagging(2), Some(3));
        for processed in [5, 10, 12] {
            dyn_cb.on_batch_complete(2, processed, 12);
        }
        dyn_cb.on_file_error(2, 3, "corrupt");

        assert_eq!(
            *cb.stages.lock().unwrap(),
            vec![Stage::TextExtraction, Stage::Tagging(2)]
        );
        assert_eq!(cb.batches.load(Ordering::SeqCst), 3);
        assert_eq!(cb.last_processed.load(Ordering::SeqCst), 12);
        assert_eq!(cb.file_errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn percent_of_rows() {
        assert_eq!(percent(5, 20), 25.0);
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(Stage::Tagging(2).to_string(), "tagging pass 2");
    }
}
