//! Input resolution: classify a user-supplied path and derive output names.
//!
//! We validate the PDF magic bytes (`%PDF`) before handing a file to pdfium
//! or uploading it, so callers get a meaningful error instead of an engine
//! failure halfway through a run.

use crate::error::Pdf2AnkiError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What kind of document a path points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// A PDF (by magic bytes or extension).
    Pdf(PathBuf),
    /// A UTF-8 plain-text file.
    Text(PathBuf),
}

impl InputKind {
    pub fn path(&self) -> &Path {
        match self {
            InputKind::Pdf(p) | InputKind::Text(p) => p,
        }
    }
}

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/*?:"<>|\s]+"#).expect("valid regex"));

/// Base name used for every file derived from `path`.
///
/// Takes the file stem and collapses runs of path separators, shell-hostile
/// characters and whitespace into a single `_`. Falls back to
/// `processed_file` when nothing usable is left.
pub fn sanitize_filename(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(&stem, "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "processed_file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Validate `path` and classify it as PDF or text.
pub fn resolve_input(path: &Path) -> Result<InputKind, Pdf2AnkiError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(Pdf2AnkiError::FileNotFound { path });
    }

    let mut magic = [0u8; 4];
    let has_magic = match std::fs::File::open(&path) {
        Ok(mut f) => f.read_exact(&mut magic).is_ok() && &magic == b"%PDF",
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Pdf2AnkiError::PermissionDenied { path });
        }
        Err(e) => return Err(Pdf2AnkiError::ReadFailed { path, source: e }),
    };

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    let kind = match ext.as_deref() {
        _ if has_magic => InputKind::Pdf(path),
        Some("pdf") => {
            return Err(Pdf2AnkiError::CorruptPdf {
                path,
                detail: format!("missing %PDF header (first bytes: {magic:?})"),
            })
        }
        Some("txt") => InputKind::Text(path),
        _ => return Err(Pdf2AnkiError::UnsupportedInput { path }),
    };

    debug!("Resolved input: {:?}", kind);
    Ok(kind)
}
