//! Error types for the pdf2anki library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`Pdf2AnkiError`] — **Fatal** for the current operation: the document,
//!   the call, or the whole run cannot continue (missing credential,
//!   unreadable input, PDF engine unavailable, output not writable).
//!
//! * [`ServiceError`] — one generative-model call failed. Whether that kills
//!   the surrounding operation depends on [`ServiceError::is_recoverable`]:
//!   transport and provider-side failures only cost the current chunk or
//!   batch, anything else aborts the call.
//!
//! * [`ParseError`] — the model answered, but the text is not the JSON array
//!   we asked for. Chunked callers skip the chunk; single-shot callers fail
//!   the document.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2anki library.
#[derive(Debug, Error)]
pub enum Pdf2AnkiError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file is neither a PDF nor a plain-text file.
    #[error("Unsupported input '{path}': expected a .pdf or .txt file")]
    UnsupportedInput { path: PathBuf },

    /// The file exists but could not be read.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The input produced nothing to work on (no text, no rows).
    #[error("Nothing to process: {0}")]
    EmptyInput(String),

    // ── PDF errors ────────────────────────────────────────────────────────
    /// pdfium could not open or parse the document.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// A rendered page could not be written as an image file.
    #[error("Failed to save page image '{path}': {detail}")]
    ImageSaveFailed { path: PathBuf, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The API key is missing or still the placeholder value.
    #[error("Gemini API key is not configured.\nSet GEMINI_API_KEY or pass --api-key.")]
    MissingApiKey,

    /// A generative-model call failed in a way that aborts the operation.
    #[error("Model call failed: {0}")]
    Service(#[from] ServiceError),

    /// The model response could not be turned into records.
    #[error("Could not parse model response: {0}")]
    Parse(#[from] ParseError),

    /// The provider blocked the whole request.
    #[error("Request blocked by the model provider: {reason}")]
    Blocked { reason: String },

    /// The model returned no text at all.
    #[error("Model returned no text")]
    NoResponseText,

    // ── Note-store errors ─────────────────────────────────────────────────
    /// The AnkiConnect bridge could not be reached.
    #[error("AnkiConnect is unreachable at {url}: {detail}\nIs Anki running with the AnkiConnect add-on?")]
    NoteStoreUnavailable { url: String, detail: String },

    /// AnkiConnect answered with an `error` field.
    #[error("AnkiConnect action '{action}' failed: {message}")]
    NoteStore { action: String, message: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
You can:\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n\
  • Place the pdfium shared library next to the working directory.\n\
  • Install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single generative-model call.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Credential rejected locally (empty or placeholder).
    #[error("invalid API credential")]
    InvalidCredential,

    /// Connection, DNS, TLS or body-read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The provider refused to produce content.
    #[error("blocked by provider ({reason})")]
    Blocked { reason: String },

    /// The provider answered 2xx but the payload was not what the API documents.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The operation is not available on this model backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A local file needed for the call could not be read.
    #[error("local I/O error: {0}")]
    Io(String),
}

impl ServiceError {
    /// `true` when the failure only costs the current chunk or batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ServiceError::Transport(_) | ServiceError::Http { .. } | ServiceError::Blocked { .. }
        )
    }

    /// Short category used inside `ERROR: API Call Failed (...)` tags.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidCredential => "InvalidCredential",
            ServiceError::Transport(_) => "Transport",
            ServiceError::Http { .. } => "Http",
            ServiceError::Blocked { .. } => "Blocked",
            ServiceError::UnexpectedResponse(_) => "UnexpectedResponse",
            ServiceError::Unsupported(_) => "Unsupported",
            ServiceError::Io(_) => "Io",
        }
    }
}

/// Failure to read a JSON array out of model text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Neither the raw text nor the fence-stripped text is valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Valid JSON, but not an array.
    #[error("expected a JSON array, got {0}")]
    NotAnArray(&'static str),
}
