//! Clients for the systems the pipeline depends on.
//!
//! - [`gemini`] — generative model (file upload, content generation)
//! - [`pdf`]    — PDF rendering and text extraction via pdfium
//! - [`anki`]   — AnkiConnect note store, used by the `anki` subcommands

pub mod anki;
pub mod gemini;
pub mod pdf;
