//! # pdf2anki
//!
//! Turn quiz material into tagged Anki flashcard rows with a multimodal LLM.
//!
//! Two kinds of source are supported. Slide decks (PDFs where a question
//! slide is followed, sometimes after filler slides, by its answer slide) are
//! uploaded whole and read visually; every page is also rendered to a JPEG so
//! the cards can show the slides. Text sources (text PDFs and `.txt` files)
//! are split into chunks and mined for question/answer pairs that already
//! exist in the text. Either way the rows are then classified in batches
//! against a fixed hierarchical tag vocabulary, in one or two passes.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / TXT
//!  │
//!  ├─ 1. Input     validate path, detect PDF by magic bytes
//!  ├─ 2. Images    rasterise pages to JPEG via pdfium (spawn_blocking)
//!  ├─ 3. Extract   whole-PDF upload (visual) or chunked text calls
//!  ├─ 4. Assemble  records → TSV rows with <img> media fields
//!  ├─ 5. Tag       batched classification, 1–2 passes, taxonomy-filtered
//!  └─ 6. Output    tab-separated file ready for Anki's importer
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pdf2anki::{GeminiClient, PdfiumEngine, Workflow, WorkflowConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("GEMINI_API_KEY")?;
//!     let config = WorkflowConfig::builder()
//!         .api_key(key.clone())
//!         .second_pass(true)
//!         .build()?;
//!     let workflow = Workflow::new(
//!         Arc::new(GeminiClient::new(key)),
//!         Arc::new(PdfiumEngine::new()),
//!         config,
//!     );
//!     let output = workflow.run_visual(Path::new("quiz.pdf")).await?;
//!     println!("{} rows → {}", output.rows, output.final_path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2anki` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf2anki = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod services;
pub mod workflow;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{WorkflowConfig, WorkflowConfigBuilder, DEFAULT_MODEL};
pub use error::{ParseError, Pdf2AnkiError, ServiceError};
pub use pipeline::assemble::MediaOptions;
pub use pipeline::tag::{TagTable, TaggedRows, Tagger, TaggingPass};
pub use pipeline::taxonomy::Taxonomy;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
pub use record::{PageImageMap, TextRecord, VisualRecord};
pub use services::anki::{AnkiConnect, NoteStore};
pub use services::gemini::{GeminiClient, GenerativeModel};
pub use services::pdf::{PdfEngine, PdfiumEngine};
pub use workflow::{BulkReport, FileFailure, Workflow, WorkflowOutput};
