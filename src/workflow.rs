//! End-to-end workflows: document(s) in, tagged Anki import file out.
//!
//! ```text
//! visual:  PDF ─▶ page images ─▶ upload + extract ─▶ records ─▶ 5-col table ─▶ tag ─▶ .txt
//! text:    PDF/TXT ─▶ plain text ─▶ chunked extract ─▶ records ─▶ 3-col table ─▶ tag ─▶ .txt
//! bulk:    many PDFs ─▶ (visual steps per file, failures isolated) ─▶ one table ─▶ tag ─▶ .txt
//! tag:     existing TSV ─▶ tag ─▶ .txt
//! ```
//!
//! Every workflow writes its intermediate result next to the final file and
//! leaves it there, together with the checkpoints of each stage.

use crate::config::WorkflowConfig;
use crate::error::Pdf2AnkiError;
use crate::pipeline::assemble::{self, write_atomic, VISUAL_HEADER};
use crate::pipeline::checkpoint::Checkpoint;
use crate::pipeline::extract::{
    cleanup_upload, extract_text, extract_visual, TextExtractionOptions,
};
use crate::pipeline::images::generate_page_images;
use crate::pipeline::input::{resolve_input, sanitize_filename, InputKind};
use crate::pipeline::tag::{TagTable, Tagger};
use crate::progress::Stage;
use crate::record::VisualRecord;
use crate::services::gemini::GenerativeModel;
use crate::services::pdf::{read_pdf_text, PdfEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a finished workflow put its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOutput {
    /// The tagged, Anki-ready file.
    pub final_path: PathBuf,
    /// Untagged records (JSON) or rows (TSV).
    pub intermediate_path: Option<PathBuf>,
    /// Folder holding the page images, for visual workflows.
    pub image_dir: Option<PathBuf>,
    /// Data rows in the final file.
    pub rows: usize,
}

/// A bulk input that failed and was left out of the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
    /// New name when the input was renamed with the `UP_` marker.
    pub renamed_to: Option<PathBuf>,
}

/// Outcome of [`Workflow::run_bulk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
    /// Inputs that are not PDFs.
    pub skipped: Vec<PathBuf>,
    pub output: WorkflowOutput,
}

/// Runs the workflows against one model backend and one PDF engine.
pub struct Workflow {
    model: Arc<dyn GenerativeModel>,
    pdf: Arc<dyn PdfEngine>,
    config: WorkflowConfig,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        pdf: Arc<dyn PdfEngine>,
        config: WorkflowConfig,
    ) -> Self {
        Self { model, pdf, config }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // ── Visual ───────────────────────────────────────────────────────────

    /// Slide deck → `{base}_final_tagged_visual.txt`.
    pub async fn run_visual(&self, pdf_path: &Path) -> Result<WorkflowOutput, Pdf2AnkiError> {
        let started = Instant::now();
        let pdf_path = require_pdf(pdf_path)?;
        self.require_credentials()?;

        let base = sanitize_filename(&pdf_path);
        let out_dir = self.output_dir_for(&pdf_path);
        let checkpoint = Checkpoint::new(&out_dir, &base);
        info!("Visual workflow: {} → {}", pdf_path.display(), out_dir.display());

        let (image_dir, overwrite) = match &self.config.media_dir {
            Some(dir) => (dir.clone(), true),
            None => (
                out_dir.join(format!("{}_workflow_images_{}", base, timestamp())),
                false,
            ),
        };

        let records = self
            .extract_deck(&pdf_path, &base, &image_dir, overwrite, &checkpoint)
            .await?;
        if records.is_empty() {
            warn!("No question/answer pairs found in {}", pdf_path.display());
        }

        self.config.progress_callback.on_stage_start(Stage::Writing, None);
        let intermediate = out_dir.join(format!("{}_intermediate_visual.json", base));
        write_json(&intermediate, &records).await?;

        let table = assemble::visual_table_with(&records, self.config.media);
        let final_path = out_dir.join(format!("{}_final_tagged_visual.txt", base));
        let rows = self.tag_and_write(table, &final_path, checkpoint).await?;

        info!(
            "Visual workflow finished in {:.1}s: {} rows, images in {}",
            started.elapsed().as_secs_f64(),
            rows,
            image_dir.display()
        );
        if self.config.media_dir.is_none() {
            info!(
                "Copy the images from {} into Anki's collection.media folder before importing",
                image_dir.display()
            );
        }
        Ok(WorkflowOutput {
            final_path,
            intermediate_path: Some(intermediate),
            image_dir: Some(image_dir),
            rows,
        })
    }

    /// Page images, extraction and upload cleanup for one deck. The image
    /// map and source prefix are attached to every record.
    async fn extract_deck(
        &self,
        pdf_path: &Path,
        base: &str,
        image_dir: &Path,
        overwrite: bool,
        checkpoint: &Checkpoint,
    ) -> Result<Vec<VisualRecord>, Pdf2AnkiError> {
        let progress = &self.config.progress_callback;

        progress.on_stage_start(Stage::PageImages, None);
        let page_map = generate_page_images(
            Arc::clone(&self.pdf),
            pdf_path,
            image_dir,
            base,
            self.config.image_zoom,
            overwrite,
        )
        .await?;

        progress.on_stage_start(Stage::VisualExtraction, None);
        let extraction = extract_visual(
            &*self.model,
            pdf_path,
            &self.config.extraction_model,
            &self.config.visual_prompt,
            Some(checkpoint),
        )
        .await;
        if let Some(file) = &extraction.upload {
            cleanup_upload(&*self.model, file).await;
        }

        let mut records = extraction.result?;
        for record in &mut records {
            record.page_image_map = Some(page_map.clone());
            record.source_pdf_prefix = Some(base.to_string());
        }
        Ok(records)
    }

    // ── Text ─────────────────────────────────────────────────────────────

    /// Text PDF or `.txt` → `{base}_final_tagged_text.txt`.
    pub async fn run_text(&self, input: &Path) -> Result<WorkflowOutput, Pdf2AnkiError> {
        let started = Instant::now();
        let kind = resolve_input(input)?;
        self.require_credentials()?;

        let text = match &kind {
            InputKind::Pdf(path) => read_pdf_text(Arc::clone(&self.pdf), path).await?,
            InputKind::Text(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| Pdf2AnkiError::ReadFailed {
                        path: path.clone(),
                        source: e,
                    })?;
                String::from_utf8_lossy(&bytes).trim().to_string()
            }
        };
        if text.is_empty() {
            return Err(Pdf2AnkiError::EmptyInput(format!(
                "no text in '{}'",
                input.display()
            )));
        }
        info!("Read {} characters from {}", text.chars().count(), input.display());

        let base = sanitize_filename(kind.path());
        let out_dir = self.output_dir_for(kind.path());
        let checkpoint = Checkpoint::new(&out_dir, &base);

        let options = TextExtractionOptions {
            model: self.config.extraction_model.clone(),
            prompt: self.config.text_prompt.clone(),
            chunk_size: self.config.chunk_size,
            delay: self.config.chunk_delay,
        };
        let records = extract_text(
            &*self.model,
            &text,
            &options,
            Some(&checkpoint),
            self.config.progress_callback.as_ref(),
        )
        .await?;
        if records.is_empty() {
            warn!("No question/answer pairs found in {}", input.display());
        }

        self.config.progress_callback.on_stage_start(Stage::Writing, None);
        let intermediate = out_dir.join(format!("{}_intermediate_text.json", base));
        write_json(&intermediate, &records).await?;

        let table = assemble::text_table(&records);
        let final_path = out_dir.join(format!("{}_final_tagged_text.txt", base));
        let rows = self.tag_and_write(table, &final_path, checkpoint).await?;

        info!(
            "Text workflow finished in {:.1}s: {} rows",
            started.elapsed().as_secs_f64(),
            rows
        );
        Ok(WorkflowOutput {
            final_path,
            intermediate_path: Some(intermediate),
            image_dir: None,
            rows,
        })
    }

    // ── Bulk ─────────────────────────────────────────────────────────────

    /// Many decks → one `bulk_visual_{timestamp}_final_tagged.txt`.
    ///
    /// A failing deck is recorded in [`BulkReport::failures`] (and renamed
    /// with `UP_` when configured) and the loop moves on. Non-PDF inputs
    /// are skipped. It is an error only when no deck produced any row.
    pub async fn run_bulk(&self, inputs: &[PathBuf]) -> Result<BulkReport, Pdf2AnkiError> {
        let started = Instant::now();
        self.require_credentials()?;

        let stamp = timestamp();
        let batch_base = format!("bulk_visual_{}", stamp);
        let out_dir = match (&self.config.output_dir, inputs.first()) {
            (Some(dir), _) => dir.clone(),
            (None, Some(first)) => parent_dir(first),
            (None, None) => PathBuf::from("."),
        };
        let (image_dir, overwrite) = match &self.config.media_dir {
            Some(dir) => (dir.clone(), true),
            None => (out_dir.join(format!("{}_images", batch_base)), false),
        };

        let progress = &self.config.progress_callback;
        let total = inputs.len();
        let mut aggregated = TagTable::new(header(&VISUAL_HEADER), Vec::new());
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        let mut skipped = Vec::new();

        for (i, path) in inputs.iter().enumerate() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            info!("File {}/{}: {}", i + 1, total, name);
            progress.on_file_start(i + 1, total, &name);

            if !has_pdf_extension(path) {
                info!("Skipping non-PDF file {}", name);
                skipped.push(path.clone());
                continue;
            }

            match self.bulk_file(path, &out_dir, &image_dir, overwrite).await {
                Ok(table) => {
                    debug!("{}: {} rows", name, table.len());
                    aggregated.extend_aligned(table);
                    succeeded.push(path.clone());
                }
                Err(e) => {
                    error!("Failed processing {}: {}", name, e);
                    progress.on_file_error(i + 1, total, &e.to_string());
                    let renamed_to = if self.config.rename_failed {
                        mark_failed(path).await
                    } else {
                        None
                    };
                    failures.push(FileFailure {
                        path: path.clone(),
                        error: e.to_string(),
                        renamed_to,
                    });
                }
            }
        }

        info!(
            "Bulk extraction: {} succeeded, {} failed, {} skipped of {}",
            succeeded.len(),
            failures.len(),
            skipped.len(),
            total
        );
        if aggregated.is_empty() {
            return Err(Pdf2AnkiError::EmptyInput(format!(
                "no rows were extracted from any of {} files",
                total
            )));
        }

        progress.on_stage_start(Stage::Writing, None);
        let intermediate = out_dir.join(format!("{}_intermediate.tsv", batch_base));
        assemble::write_tsv(&intermediate, &aggregated).await?;

        let final_path = out_dir.join(format!("{}_final_tagged.txt", batch_base));
        let checkpoint = Checkpoint::new(&out_dir, &batch_base);
        let rows = self.tag_and_write(aggregated, &final_path, checkpoint).await?;

        info!(
            "Bulk workflow finished in {:.1}s: {} rows",
            started.elapsed().as_secs_f64(),
            rows
        );
        Ok(BulkReport {
            succeeded,
            failures,
            skipped,
            output: WorkflowOutput {
                final_path,
                intermediate_path: Some(intermediate),
                image_dir: Some(image_dir),
                rows,
            },
        })
    }

    async fn bulk_file(
        &self,
        path: &Path,
        out_dir: &Path,
        image_dir: &Path,
        overwrite: bool,
    ) -> Result<TagTable, Pdf2AnkiError> {
        let pdf_path = require_pdf(path)?;
        let base = sanitize_filename(&pdf_path);
        let checkpoint = Checkpoint::new(out_dir, &base);
        let records = self
            .extract_deck(&pdf_path, &base, image_dir, overwrite, &checkpoint)
            .await?;
        if records.is_empty() {
            warn!("No question/answer pairs found in {}", pdf_path.display());
        }
        Ok(assemble::visual_table_with(&records, self.config.media))
    }

    // ── Tag only ─────────────────────────────────────────────────────────

    /// Tag an existing TSV. `output` defaults to `{base}_final_tagged.txt`
    /// next to the input (or in the configured output folder).
    pub async fn tag_file(
        &self,
        input: &Path,
        output: Option<&Path>,
    ) -> Result<WorkflowOutput, Pdf2AnkiError> {
        let table = assemble::read_tsv(input).await?;
        if table.is_empty() {
            warn!("{} has a header but no rows", input.display());
        }

        let base = tag_base_name(input);
        let out_dir = self.output_dir_for(input);
        let final_path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| out_dir.join(format!("{}_final_tagged.txt", base)));
        let checkpoint = Checkpoint::new(&out_dir, &base);

        let rows = self.tag_and_write(table, &final_path, checkpoint).await?;
        Ok(WorkflowOutput {
            final_path,
            intermediate_path: None,
            image_dir: None,
            rows,
        })
    }

    // ── Shared steps ─────────────────────────────────────────────────────

    async fn tag_and_write(
        &self,
        table: TagTable,
        path: &Path,
        checkpoint: Checkpoint,
    ) -> Result<usize, Pdf2AnkiError> {
        let tagger = Tagger::new(Arc::clone(&self.model))
            .batch_size(self.config.batch_size)
            .delay(self.config.batch_delay)
            .checkpoint(checkpoint)
            .progress(Arc::clone(&self.config.progress_callback));

        let passes = if table.is_empty() {
            info!("Nothing to tag; writing header only");
            &[][..]
        } else {
            &self.config.passes[..]
        };
        let rows = tagger.write(table, passes, path).await?;
        self.config.progress_callback.on_workflow_complete(rows);
        Ok(rows)
    }

    fn require_credentials(&self) -> Result<(), Pdf2AnkiError> {
        self.model
            .check_credentials()
            .map_err(|_| Pdf2AnkiError::MissingApiKey)
    }

    fn output_dir_for(&self, input: &Path) -> PathBuf {
        self.config
            .output_dir
            .clone()
            .unwrap_or_else(|| parent_dir(input))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn require_pdf(path: &Path) -> Result<PathBuf, Pdf2AnkiError> {
    match resolve_input(path)? {
        InputKind::Pdf(p) => Ok(p),
        InputKind::Text(p) => Err(Pdf2AnkiError::UnsupportedInput { path: p }),
    }
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn header(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|c| c.to_string()).collect()
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

async fn write_json<T: serde::Serialize>(path: &Path, items: &[T]) -> Result<(), Pdf2AnkiError> {
    let body = serde_json::to_string_pretty(items)
        .map_err(|e| Pdf2AnkiError::Internal(format!("serialising records: {}", e)))?;
    write_atomic(path, body).await?;
    debug!("Wrote {} records to {}", items.len(), path.display());
    Ok(())
}

const STAGE_SUFFIXES: [&str; 7] = [
    "_intermediate_visual",
    "_intermediate_text",
    "_intermediate",
    "_final_tagged_visual",
    "_final_tagged_text",
    "_final_tagged",
    "_extracted",
];

/// Base name for tag-only output: the sanitized stem without the suffix an
/// earlier stage of this tool gave it.
fn tag_base_name(input: &Path) -> String {
    let base = sanitize_filename(input);
    STAGE_SUFFIXES
        .iter()
        .find_map(|s| base.strip_suffix(s))
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .unwrap_or(base)
}

/// Rename a failed input to `UP_<name>`, adding `_1`, `_2`, ... before the
/// extension when that name is taken.
async fn mark_failed(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let dir = parent_dir(path);
    let marked = format!("UP_{}", name);
    let (stem, ext) = match marked.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{}", e)),
        None => (marked.clone(), String::new()),
    };

    let mut candidate = dir.join(&marked);
    let mut counter = 1;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        counter += 1;
    }

    match tokio::fs::rename(path, &candidate).await {
        Ok(()) => {
            warn!("Renamed failed input to {}", candidate.display());
            Some(candidate)
        }
        Err(e) => {
            error!("Could not rename failed input {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_base_strips_stage_suffix() {
        assert_eq!(tag_base_name(Path::new("deck_intermediate_visual.tsv")), "deck");
        assert_eq!(tag_base_name(Path::new("/x/notes_final_tagged.txt")), "notes");
        assert_eq!(tag_base_name(Path::new("plain.tsv")), "plain");
        assert_eq!(tag_base_name(Path::new("_intermediate.tsv")), "intermediate");
    }

    #[test]
    fn pdf_extension_is_case_insensitive() {
        assert!(has_pdf_extension(Path::new("a.PDF")));
        assert!(has_pdf_extension(Path::new("dir/b.pdf")));
        assert!(!has_pdf_extension(Path::new("c.txt")));
        assert!(!has_pdf_extension(Path::new("pdf")));
    }

    #[tokio::test]
    async fn failed_input_rename_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("deck.pdf");
        std::fs::write(&first, b"x").unwrap();
        std::fs::write(dir.path().join("UP_deck.pdf"), b"older").unwrap();

        let renamed = mark_failed(&first).await.unwrap();
        assert_eq!(renamed, dir.path().join("UP_deck_1.pdf"));
        assert!(!first.exists());
        assert!(renamed.exists());
    }
}
