//! Best-effort progress snapshots.
//!
//! After every unit of work (chunk, batch) the full state so far is written
//! to `{base}_{step}_temp_results.{json|tsv}`, overwriting the previous
//! snapshot. Nothing ever reads these files back; they exist so a human can
//! recover a long run that died halfway. A failed write is a warning, never
//! an error.

use crate::pipeline::assemble::render_tsv;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where and under which base name snapshots are written.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    base: String,
}

impl Checkpoint {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Path of the snapshot for `step` with extension `ext`.
    pub fn path_for(&self, step: &str, ext: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}_temp_results.{}", self.base, step, ext))
    }

    /// Overwrite the JSON snapshot for `step` with `items`.
    ///
    /// Returns the written path, or `None` if `items` is empty or the write
    /// failed.
    pub async fn save_json<T: Serialize>(&self, step: &str, items: &[T]) -> Option<PathBuf> {
        if items.is_empty() {
            debug!("checkpoint '{}' skipped: nothing to save", step);
            return None;
        }
        let body = match serde_json::to_string_pretty(items) {
            Ok(b) => b,
            Err(e) => {
                warn!("checkpoint '{}' not serialisable: {}", step, e);
                return None;
            }
        };
        self.write(self.path_for(step, "json"), body).await
    }

    /// Overwrite the TSV snapshot for `step` with `header` plus `rows`.
    pub async fn save_tsv(
        &self,
        step: &str,
        header: &[String],
        rows: &[Vec<String>],
    ) -> Option<PathBuf> {
        if rows.is_empty() {
            debug!("checkpoint '{}' skipped: no rows yet", step);
            return None;
        }
        self.write(self.path_for(step, "tsv"), render_tsv(header, rows))
            .await
    }

    async fn write(&self, path: PathBuf, body: String) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(
                "could not create checkpoint dir {}: {}",
                self.dir.display(),
                e
            );
            return None;
        }
        match tokio::fs::write(&path, body).await {
            Ok(()) => {
                debug!("checkpoint saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("could not write checkpoint {}: {}", path.display(), e);
                None
            }
        }
    }
}
