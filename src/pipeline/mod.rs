//! Pipeline stages for document-to-flashcard conversion.
//!
//! Each submodule implements one step and talks to the outside world only
//! through the traits in [`crate::services`], so every stage can be tested
//! with an in-memory fake.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ images ──▶ extract ──▶ assemble ──▶ tag
//! (path)    (pdfium)   (LLM)       (TSV rows)   (LLM, batched)
//!                        │                       │
//!                 chunk + parse          taxonomy + parse
//! ```
//!
//! 1. [`input`]    — validate the path and classify it as PDF or text
//! 2. [`images`]   — render every page to `{base}_page_NNN.jpg`
//! 3. [`extract`]  — visual (whole-PDF upload) or chunked text extraction
//! 4. [`assemble`] — records → rectangular TSV with `<img>` media fields
//! 5. [`tag`]      — batched classification passes, streamed to disk
//!
//! [`checkpoint`] snapshots each stage's partial result so a crashed run
//! leaves something to inspect.

pub mod assemble;
pub mod checkpoint;
pub mod chunk;
pub mod extract;
pub mod images;
pub mod input;
pub mod parse;
pub mod tag;
pub mod taxonomy;
